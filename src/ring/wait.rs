//! Futex-based blocking on shared control words.
//!
//! Each blockable side of a ring has a 32-bit notify word: a wrapping event
//! counter in the low 31 bits plus a `WAITING` bit in the top bit. A waiter
//! CAS-sets the `WAITING` bit and sleeps on the word; the advancing side
//! bumps the counter after publishing its update and issues a wake only if
//! the bit was set (signal suppression).

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::error::Result;

pub const WAITING_BIT: u32 = 1 << 31;

/// Marks the caller as waiting and returns the word value to sleep on.
///
/// The caller must re-check its wake condition between this call and
/// `futex_wait`; the advancing side only wakes waiters registered before its
/// bump.
pub fn mark_waiting(word: &AtomicU32) -> u32 {
    loop {
        let seen = word.load(Ordering::Acquire);
        if seen & WAITING_BIT != 0 {
            return seen;
        }
        if word
            .compare_exchange_weak(seen, seen | WAITING_BIT, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return seen | WAITING_BIT;
        }
    }
}

/// Publishes an advance: bumps the event counter, clears `WAITING`, and wakes
/// sleepers if any were registered.
pub fn wake_waiters(word: &AtomicU32) -> Result<()> {
    let prev = word.swap(next_count(word.load(Ordering::Relaxed)), Ordering::AcqRel);
    if prev & WAITING_BIT != 0 {
        futex_wake(word)?;
    }
    Ok(())
}

fn next_count(value: u32) -> u32 {
    (value & !WAITING_BIT).wrapping_add(1) & !WAITING_BIT
}

#[cfg(target_os = "linux")]
pub fn futex_wait(addr: &AtomicU32, expected: u32, timeout: Option<Duration>) -> Result<()> {
    use libc::{syscall, timespec, SYS_futex, EAGAIN, EINTR, ETIMEDOUT, FUTEX_WAIT};

    let mut ts = timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let ts_ptr = if let Some(timeout) = timeout {
        ts.tv_sec = timeout.as_secs() as libc::time_t;
        ts.tv_nsec = timeout.subsec_nanos() as libc::c_long;
        &ts as *const timespec
    } else {
        std::ptr::null()
    };

    let res = unsafe {
        syscall(
            SYS_futex,
            addr as *const AtomicU32 as *const u32,
            FUTEX_WAIT,
            expected,
            ts_ptr,
            std::ptr::null::<u32>(),
            0,
        )
    };
    if res == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(code) if code == EAGAIN || code == EINTR || code == ETIMEDOUT => Ok(()),
        _ => Err(crate::error::Error::Io(err)),
    }
}

#[cfg(target_os = "linux")]
pub fn futex_wake(addr: &AtomicU32) -> Result<()> {
    use libc::{syscall, SYS_futex, FUTEX_WAKE};
    let res = unsafe {
        syscall(
            SYS_futex,
            addr as *const AtomicU32 as *const u32,
            FUTEX_WAKE,
            i32::MAX,
            std::ptr::null::<u32>(),
            std::ptr::null::<u32>(),
            0,
        )
    };
    if res < 0 {
        return Err(crate::error::Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wait(_addr: &AtomicU32, _expected: u32, timeout: Option<Duration>) -> Result<()> {
    if let Some(timeout) = timeout {
        std::thread::sleep(timeout.min(Duration::from_millis(1)));
    } else {
        std::thread::sleep(Duration::from_millis(1));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wake(_addr: &AtomicU32) -> Result<()> {
    Ok(())
}
