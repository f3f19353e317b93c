//! Sequentially consistent operations on words living in the shared mapping.
//!
//! Everything that more than one process can touch concurrently goes through
//! this module (or holds `AtomicU32` fields directly). All orderings are
//! `SeqCst`: the handoff protocols in the ring and queue layers were designed
//! against full ordering, and nothing here is hot enough to justify proving a
//! weaker one correct.
//!
//! The 16-bit half accessors exist so the two counters packed into a ring
//! slot's `write_waiters` word can advance independently without a lock. They
//! assume a little-endian layout, which is fine: pool contents are never
//! exchanged across architectures.

use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};

/// Atomically writes `desired` iff the word currently equals `expected`.
/// Returns whether the write happened.
pub fn compare_exchange(word: &AtomicU32, expected: u32, desired: u32) -> bool {
    word.compare_exchange(expected, desired, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
}

/// Adds `delta` to the word, wrapping, and returns the previous value.
pub fn fetch_add(word: &AtomicU32, delta: u32) -> u32 {
    word.fetch_add(delta, Ordering::SeqCst)
}

/// Subtracts `delta` from the word, wrapping, and returns the previous value.
pub fn fetch_sub(word: &AtomicU32, delta: u32) -> u32 {
    word.fetch_sub(delta, Ordering::SeqCst)
}

/// Stores `value` and returns the previous value.
pub fn exchange(word: &AtomicU32, value: u32) -> u32 {
    word.swap(value, Ordering::SeqCst)
}

/// ANDs `mask` into the word in place.
pub fn fetch_and(word: &AtomicU32, mask: u32) -> u32 {
    word.fetch_and(mask, Ordering::SeqCst)
}

/// Reads the word.
pub fn load(word: &AtomicU32) -> u32 {
    word.load(Ordering::SeqCst)
}

/// Unit increment.
pub fn increment(word: &AtomicU32) {
    word.fetch_add(1, Ordering::SeqCst);
}

/// Unit decrement.
pub fn decrement(word: &AtomicU32) {
    word.fetch_sub(1, Ordering::SeqCst);
}

/// Adds `delta` to a 16-bit half-word, wrapping, and returns the previous
/// value.
pub fn fetch_add_u16(half: &AtomicU16, delta: u16) -> u16 {
    half.fetch_add(delta, Ordering::SeqCst)
}

/// Unit increment of a 16-bit half-word.
pub fn increment_u16(half: &AtomicU16) {
    half.fetch_add(1, Ordering::SeqCst);
}

/// View of the low 16 bits of a 32-bit shared word.
pub fn low_half(word: &AtomicU32) -> &AtomicU16 {
    // Little-endian: the low half is at the word's own address.
    unsafe { AtomicU16::from_ptr(word.as_ptr() as *mut u16) }
}

/// View of the high 16 bits of a 32-bit shared word.
pub fn high_half(word: &AtomicU32) -> &AtomicU16 {
    unsafe { AtomicU16::from_ptr((word.as_ptr() as *mut u16).add(1)) }
}

/// Full barrier against both compiler and CPU reordering.
pub fn fence() {
    std::sync::atomic::fence(Ordering::SeqCst);
}
