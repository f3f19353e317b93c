//! Thin wrappers around the futex syscall.
//!
//! Glibc has no futex wrapper, so the calls are made through
//! `libc::syscall`. Both operate on a 4-byte aligned word that lives in the
//! shared mapping; the word is handed over as the address of an `AtomicU32`.

use std::ptr;
use std::sync::atomic::AtomicU32;

/// Puts the caller to sleep while `*word == expected`.
///
/// Returns `true` on a normal wakeup. Returns `false` when the kernel
/// reports that the word no longer held `expected` by the time it would
/// have slept (`EAGAIN`) or the wait was interrupted (`EINTR`); callers
/// recover by re-reading the word and looping.
pub fn futex_wait(word: &AtomicU32, expected: u32) -> bool {
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            ptr::null::<libc::timespec>(),
        )
    };
    if rc == 0 {
        return true;
    }

    let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
    debug_assert!(
        errno == libc::EAGAIN || errno == libc::EINTR,
        "futex(FUTEX_WAIT) failed unexpectedly: errno {}",
        errno
    );
    false
}

/// Wakes at most `count` waiters sleeping on `word`. Returns how many were
/// actually woken.
pub fn futex_wake(word: &AtomicU32, count: u32) -> u32 {
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE,
            count,
            ptr::null::<libc::timespec>(),
        )
    };
    debug_assert!(rc >= 0, "futex(FUTEX_WAKE) failed unexpectedly");
    rc.max(0) as u32
}

/// Wakes every waiter sleeping on `word`.
pub fn futex_wake_all(word: &AtomicU32) -> u32 {
    futex_wake(word, u32::MAX)
}
