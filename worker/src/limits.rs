/// Caps this process's address space at `max_memory` bytes.
///
/// Applied once during bootstrap, before any package code runs. Exceeding the
/// limit makes allocations fail, which package code reports as a
/// memory-exceeded error or, failing that, aborts the process; the server
/// treats both as the worker hitting its memory budget.
#[cfg(unix)]
pub fn apply_memory_limit(max_memory: u64) -> std::io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: max_memory,
        rlim_max: max_memory,
    };
    // SAFETY: passing a valid, initialised rlimit struct.
    let rc = unsafe { libc::setrlimit(libc::RLIMIT_AS, &limit) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn apply_memory_limit(_max_memory: u64) -> std::io::Result<()> {
    Ok(())
}
