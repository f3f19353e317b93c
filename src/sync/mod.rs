//! Synchronization primitives built on the kernel's futex facility.
//!
//! Non-blocking paths through the crate never enter the kernel; these
//! primitives exist for the true-contention cases (a contended allocation
//! lock, a blocked producer, a consumer waiting on an empty slot), where a
//! futex wait is the fallback.

pub mod futex;
pub mod mutex;

pub use futex::{futex_wait, futex_wake, futex_wake_all};
pub use mutex::{Mutex, MutexGuard};
