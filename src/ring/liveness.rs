//! Reader-process liveness probing.
//!
//! A reader slot records its OS pid and the process start time so a reused
//! pid is not mistaken for the original reader. On Linux the start time is
//! the ctime of `/proc/<pid>`.

use crate::error::{Error, Result};

#[cfg(target_os = "linux")]
pub fn process_start_time(pid: u32) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    let meta = std::fs::metadata(format!("/proc/{pid}")).ok()?;
    Some(meta.ctime() as u64)
}

#[cfg(not(target_os = "linux"))]
pub fn process_start_time(pid: u32) -> Option<u64> {
    // No /proc: existence check only, start time degenerates to zero.
    let alive = unsafe { libc::kill(pid as libc::pid_t, 0) } == 0
        || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
    alive.then_some(0)
}

/// Whether the process that recorded `(pid, start_time)` still exists.
pub fn process_alive(pid: u32, start_time: u64) -> bool {
    if pid == 0 {
        return false;
    }
    match process_start_time(pid) {
        Some(now) => now == start_time,
        None => false,
    }
}

/// Deliberately unsticks a ring by killing a wedged reader. `coredump`
/// selects SIGQUIT so the reader leaves a dump behind; callers decide policy.
pub fn kill(pid: u32, coredump: bool) -> Result<()> {
    let sig = if coredump {
        libc::SIGQUIT
    } else {
        libc::SIGKILL
    };
    // SAFETY: plain kill(2); pid validity is the caller's concern.
    if unsafe { libc::kill(pid as libc::pid_t, sig) } == -1 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive() {
        let pid = std::process::id();
        let start = process_start_time(pid).expect("own start time");
        assert!(process_alive(pid, start));
    }

    #[test]
    fn stale_start_time_is_dead() {
        let pid = std::process::id();
        assert!(!process_alive(pid, u64::MAX));
    }

    #[test]
    fn nonexistent_pid_is_dead() {
        // Pid 0 is the sentinel for an empty slot.
        assert!(!process_alive(0, 0));
    }
}
