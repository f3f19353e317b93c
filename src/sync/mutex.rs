//! A three-state futex-backed lock that lives in shared memory.
//!
//! State protocol: 0 = unlocked, 1 = locked with no waiters known,
//! 2 = locked and contended. The uncontended lock and unlock are a single
//! compare-exchange each; only true contention pays for a kernel round
//! trip, and an unlock from state 2 always wakes one waiter so nobody
//! starves.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::atomics;
use crate::sync::futex::{futex_wait, futex_wake};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

/// A low-level mutex. Must be placed in shared memory by whatever uses it;
/// embed it in a pool-resident header or allocate it from the pool.
#[repr(C)]
pub struct Mutex {
    // Futex semantics require four-byte alignment, which AtomicU32 carries.
    state: AtomicU32,
}

impl Mutex {
    /// Initializes the lock to the unlocked state. Call exactly once, from
    /// the process that creates the owning structure.
    pub fn init(&self) {
        self.state.store(UNLOCKED, Ordering::SeqCst);
    }

    /// Grabs the lock, blocking if it is already held. With no contention
    /// this never leaves userspace.
    pub fn lock(&self) {
        if atomics::compare_exchange(&self.state, UNLOCKED, LOCKED) {
            return;
        }

        // Contended. Advertise a waiter by moving the state to 2, then wait
        // in the kernel until an unlocker resets it to 0 and we win the
        // re-grab race.
        loop {
            if atomics::load(&self.state) == CONTENDED
                || atomics::compare_exchange(&self.state, LOCKED, CONTENDED)
            {
                futex_wait(&self.state, CONTENDED);
            }
            if atomics::compare_exchange(&self.state, UNLOCKED, CONTENDED) {
                return;
            }
        }
    }

    /// Releases the lock, waking one waiter if any are queued. With no
    /// contention this never leaves userspace.
    pub fn unlock(&self) {
        if atomics::compare_exchange(&self.state, LOCKED, UNLOCKED) {
            return;
        }

        // The state can only go up while we hold the lock, so it must be 2.
        let released = atomics::compare_exchange(&self.state, CONTENDED, UNLOCKED);
        debug_assert!(released, "double-releasing lock?");
        futex_wake(&self.state, 1);
    }

    /// Grabs the lock and returns a guard that releases it on drop.
    pub fn guard(&self) -> MutexGuard<'_> {
        self.lock();
        MutexGuard { mutex: self }
    }

    #[cfg(test)]
    pub(crate) fn raw_state(&self) -> u32 {
        atomics::load(&self.state)
    }
}

/// RAII guard returned by [`Mutex::guard`].
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}
