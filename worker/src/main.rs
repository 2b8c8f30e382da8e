//! Entry point of the process worker.
//!
//! The framed channel to the server runs over the stdin/stdout pipes the
//! worker inherits. Before any package code can run, the original stdout fd
//! is duplicated for the channel and fd 1 is pointed at stderr, so stray
//! prints from package code can never corrupt a frame. The parent drains
//! stderr into a bounded buffer.

use std::fs::File;
use std::io::BufReader;
use std::io::BufWriter;

use anyhow::Context;
use anyhow::Result;
use qpy_worker::WorkerRuntime;
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
fn take_channel_stdout() -> Result<File> {
    use std::os::fd::FromRawFd;

    // SAFETY: duplicates fd 1 and rebinds it to fd 2; both are open at
    // process start. The duplicate is owned by the returned File.
    unsafe {
        let channel_fd = libc::dup(libc::STDOUT_FILENO);
        if channel_fd < 0 {
            return Err(std::io::Error::last_os_error()).context("dup stdout");
        }
        if libc::dup2(libc::STDERR_FILENO, libc::STDOUT_FILENO) < 0 {
            return Err(std::io::Error::last_os_error()).context("redirect stdout to stderr");
        }
        Ok(File::from_raw_fd(channel_fd))
    }
}

#[cfg(not(unix))]
fn take_channel_stdout() -> Result<File> {
    anyhow::bail!("process workers are only supported on unix");
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let channel_out = take_channel_stdout()?;
    let stdin = std::io::stdin().lock();

    let runtime = WorkerRuntime::new(BufReader::new(stdin), BufWriter::new(channel_out));
    runtime.run().context("worker runtime failed")
}
