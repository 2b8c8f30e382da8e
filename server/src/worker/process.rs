//! A worker running as its own OS process.
//!
//! The framed channel runs over the child's stdin/stdout; stderr is drained
//! into a bounded buffer so a chatty package can neither deadlock the pipe
//! nor balloon server memory. A background observer watches the receive
//! loop, the child's exit, and the per-call time enforcer; whichever
//! finishes first tears the worker down and fails outstanding futures.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use qpy_protocol::Exit;
use qpy_protocol::InitWorker;
use qpy_protocol::LoadPackage;
use qpy_protocol::PackageLocation;
use qpy_protocol::WorkerRequest;
use qpy_protocol::WorkerResourceLimits;
use tokio::process::Child;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use super::connection::BoxedWriter;
use super::connection::ConnectionReader;
use super::connection::send_message;
use super::error::WorkerError;
use super::host;
use super::host::Shared;
use super::host::TimeLimiter;
use super::host::WorkerState;

const INIT_TIMEOUT: Duration = Duration::from_secs(2);
const LOAD_TIMEOUT: Duration = Duration::from_secs(4);
const STDERR_BUFFER_SIZE: usize = 5 * 1024;

#[derive(Default)]
struct StderrBuffer {
    data: Vec<u8>,
    skipped: u64,
}

impl StderrBuffer {
    fn extend(&mut self, chunk: &[u8]) {
        let space_left = STDERR_BUFFER_SIZE.saturating_sub(self.data.len());
        let take = chunk.len().min(space_left);
        self.data.extend_from_slice(&chunk[..take]);
        self.skipped += (chunk.len() - take) as u64;
    }

    fn take_and_log(&mut self) {
        if !self.data.is_empty() {
            let text = String::from_utf8_lossy(&self.data);
            if self.skipped > 0 {
                warn!(
                    "worker wrote to stdout/stderr: {text} (additional {} bytes were skipped)",
                    self.skipped
                );
            } else {
                warn!("worker wrote to stdout/stderr: {text}");
            }
        }
        self.data.clear();
        self.skipped = 0;
    }
}

pub struct ProcessWorker {
    location: PackageLocation,
    limits: WorkerResourceLimits,
    executable: PathBuf,
    shared: Arc<Shared>,
    writer: Arc<Mutex<Option<BoxedWriter>>>,
    exchange: Mutex<()>,
    limiter: Option<Arc<TimeLimiter>>,
    pid: Option<u32>,
    observer: Option<JoinHandle<()>>,
    stderr: Arc<StdMutex<StderrBuffer>>,
}

impl ProcessWorker {
    pub fn new(
        location: PackageLocation,
        limits: WorkerResourceLimits,
        executable: PathBuf,
    ) -> Self {
        Self {
            location,
            limits,
            executable,
            shared: Shared::new(),
            writer: Arc::new(Mutex::new(None)),
            exchange: Mutex::new(()),
            limiter: None,
            pid: None,
            observer: None,
            stderr: Arc::new(StdMutex::new(StderrBuffer::default())),
        }
    }

    pub fn location(&self) -> &PackageLocation {
        &self.location
    }

    pub fn limits(&self) -> WorkerResourceLimits {
        self.limits
    }

    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    /// Spawns the worker process and performs the init/load handshake. Any
    /// failure before the worker reaches idle is a start error carrying the
    /// `temporary` bit of its cause.
    pub async fn start(&mut self) -> Result<(), WorkerError> {
        let mut child = Command::new(&self.executable)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| WorkerError::Start {
                reason: format!("failed to spawn '{}': {err}", self.executable.display()),
                temporary: false,
            })?;

        let stdin = child.stdin.take().ok_or_else(|| WorkerError::Start {
            reason: "failed to capture worker stdin".to_string(),
            temporary: true,
        })?;
        let stdout = child.stdout.take().ok_or_else(|| WorkerError::Start {
            reason: "failed to capture worker stdout".to_string(),
            temporary: true,
        })?;
        let stderr = child.stderr.take().ok_or_else(|| WorkerError::Start {
            reason: "failed to capture worker stderr".to_string(),
            temporary: true,
        })?;

        self.pid = child.id();
        *self.writer.lock().await = Some(Box::new(stdin));

        tokio::spawn(drain_stderr(stderr, self.stderr.clone()));

        let (limiter, limit_rx) = TimeLimiter::new();
        let limiter = Arc::new(limiter);
        self.limiter = Some(limiter);

        let reader = ConnectionReader::new(Box::new(stdout));
        self.shared.set_state(WorkerState::Idle);
        self.observer = Some(tokio::spawn(observe(
            child,
            reader,
            self.shared.clone(),
            limit_rx,
            self.stderr.clone(),
        )));

        let init = InitWorker {
            limits: self.limits,
            worker_type: qpy_worker::WORKER_TYPE_PROCESS.to_string(),
        };
        self.handshake(&init, INIT_TIMEOUT).await?;

        let load = LoadPackage {
            location: self.location.clone(),
            main: true,
        };
        self.handshake(&load, LOAD_TIMEOUT).await?;

        debug!(pid = ?self.pid, "worker is idle");
        Ok(())
    }

    /// One pre-idle exchange under a hard wall-clock deadline.
    async fn handshake<R: WorkerRequest>(
        &self,
        message: &R,
        deadline: Duration,
    ) -> Result<R::Response, WorkerError> {
        let exchange = tokio::time::timeout(
            deadline,
            self.send_and_wait::<R>(message, deadline.as_secs_f64()),
        )
        .await;

        let result = match exchange {
            Ok(result) => result,
            Err(_) => Err(WorkerError::Start {
                reason: "worker did not answer during initialization".to_string(),
                temporary: true,
            }),
        };

        match result {
            Ok(response) => Ok(response),
            Err(error) => {
                // Stderr may hold the reason the worker never came up.
                if let Ok(mut buffer) = self.stderr.lock() {
                    buffer.take_and_log();
                }
                self.kill().await;
                Err(match error {
                    start @ WorkerError::Start { .. } => start,
                    other => WorkerError::Start {
                        reason: other.to_string(),
                        temporary: other.temporary(),
                    },
                })
            }
        }
    }

    pub async fn send_and_wait<R: WorkerRequest>(
        &self,
        message: &R,
        cpu_limit_seconds: f64,
    ) -> Result<R::Response, WorkerError> {
        let cpu_now = self.cpu_time();
        let limiter = self
            .limiter
            .as_ref()
            .map(|limiter| (limiter.as_ref(), cpu_now));
        host::send_and_wait(
            &self.shared,
            &self.writer,
            &self.exchange,
            limiter,
            message,
            cpu_limit_seconds,
        )
        .await
    }

    pub fn default_timeout(&self) -> f64 {
        self.limits.max_cpu_time_seconds_per_call
    }

    /// Asks the worker to exit and waits up to `grace` for the observer to
    /// wind down; kills it otherwise.
    pub async fn stop(&mut self, grace: Duration) {
        {
            let mut writer = self.writer.lock().await;
            if let Some(writer) = writer.as_mut() {
                let _ = send_message(writer, &Exit {}).await;
            }
        }

        if let Some(observer) = self.observer.take() {
            if tokio::time::timeout(grace, observer).await.is_err() {
                debug!("worker was killed because it did not stop gracefully");
                self.kill().await;
            }
        }
    }

    /// Unconditionally terminates the worker process. The observer reaps it.
    pub async fn kill(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            // SAFETY: sending a signal to a pid we spawned and still track.
            unsafe {
                libc::kill(pid as i32, libc::SIGKILL);
            }
        }
    }

    #[cfg(target_os = "linux")]
    fn cpu_time(&self) -> f64 {
        self.pid.map(cpu_time_of).unwrap_or(0.0)
    }

    #[cfg(not(target_os = "linux"))]
    fn cpu_time(&self) -> f64 {
        0.0
    }
}

async fn observe(
    mut child: Child,
    reader: ConnectionReader,
    shared: Arc<Shared>,
    limit_rx: tokio::sync::watch::Receiver<Option<host::LimitWindow>>,
    stderr: Arc<StdMutex<StderrBuffer>>,
) {
    let pid = child.id();
    #[cfg(target_os = "linux")]
    let cpu_time = move || pid.map(cpu_time_of).unwrap_or(0.0);
    #[cfg(not(target_os = "linux"))]
    let cpu_time = move || {
        let _ = pid;
        0.0
    };

    let failure = tokio::select! {
        result = host::receive_loop(reader, shared.clone()) => result.err(),
        _ = child.wait() => None,
        violation = host::enforce_time_limits(limit_rx, cpu_time) => Some(violation),
    };

    shared.set_state(WorkerState::NotRunning);
    if let Some(error) = failure {
        warn!(%error, "worker observer shutting the worker down");
        shared.record_failure(error);
    }

    // Kill if still alive, then reap.
    let _ = child.start_kill();
    match child.wait().await {
        Ok(status) if !status.success() => {
            debug!(?status, "worker exited abnormally");
        }
        _ => {}
    }

    if let Ok(mut buffer) = stderr.lock() {
        buffer.take_and_log();
    }
    shared.fail_pending();
}

async fn drain_stderr(
    mut stderr: tokio::process::ChildStderr,
    buffer: Arc<StdMutex<StderrBuffer>>,
) {
    use tokio::io::AsyncReadExt;

    let mut chunk = [0u8; 8 * 1024];
    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(read) => {
                if let Ok(mut buffer) = buffer.lock() {
                    buffer.extend(&chunk[..read]);
                }
            }
        }
    }
}

/// User plus system CPU time of a process, in seconds.
#[cfg(target_os = "linux")]
fn cpu_time_of(pid: u32) -> f64 {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return 0.0;
    };
    // The comm field may contain spaces; fields resume after the last ')'.
    let Some(after_comm) = stat.rsplit_once(')').map(|(_, rest)| rest) else {
        return 0.0;
    };
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // utime and stime are overall fields 14 and 15; state is field 3 and the
    // first one after the comm.
    let utime: u64 = fields.get(11).and_then(|f| f.parse().ok()).unwrap_or(0);
    let stime: u64 = fields.get(12).and_then(|f| f.parse().ok()).unwrap_or(0);

    // SAFETY: sysconf with a valid name has no preconditions.
    let ticks_per_second = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks_per_second <= 0 {
        return 0.0;
    }
    (utime + stime) as f64 / ticks_per_second as f64
}
