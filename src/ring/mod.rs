//! The inner queueing primitive: a fixed-capacity multi-producer,
//! single-consumer ring living entirely in pool memory.
//!
//! A `Ring` value is a per-thread handle; the shared state is a pool
//! header plus a slot array found from it. Producers claim space with
//! [`Ring::reserve`] and commit with [`Ring::enqueue_at`], which lets the
//! fan-out layer make a broadcast all-or-nothing. Each slot's `valid` word
//! doubles as the futex the consumer sleeps on; each slot's turnstile
//! orders blocked producers FIFO.
//!
//! Non-blocking operations are lock-free and never enter the kernel. The
//! blocking variants fall back to a futex wait only on true contention.
//!
//! One logical consumer per ring. Handles must not be shared between
//! threads; open another handle at the same offset instead.

mod waiters;

use std::cell::{Cell, UnsafeCell};
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::AtomicU32;

use crate::atomics;
use crate::error::{MagnonError, Result};
use crate::pool::Pool;
use crate::sync::futex::{futex_wait, futex_wake, futex_wake_all};

/// Slot is empty.
const EMPTY: u32 = 0;
/// Slot holds a committed item.
const FILLED: u32 = 1;
/// Slot is empty and the consumer is waiting on it.
const WAITED: u32 = 2;

/// Pool-resident ring state, opened from a single offset.
#[repr(C)]
struct RawRing {
    /// Queue length as writers see it; may transiently overshoot the
    /// capacity while reservations race. Futex-capable word.
    write_length: AtomicU32,
    /// Next slot a committing producer claims, wrapped by the index mask.
    head_index: AtomicU32,
    /// Pool offset of the slot array.
    array_offset: i32,
    /// Capacity; a power of two.
    array_length: u32,
    /// log2 of the capacity, kept so openers can rebuild the mask.
    length_shifts: u32,
}

/// One element of the slot array.
#[repr(C)]
struct Slot<T> {
    value: UnsafeCell<T>,
    /// Handoff register and consumer-side futex word.
    valid: AtomicU32,
    /// Producer turnstile; see the `waiters` module.
    write_waiters: AtomicU32,
}

/// A handle to a shared ring of `T`. `T` must be trivially copyable: its
/// bytes are what travels through shared memory.
pub struct Ring<T: Copy> {
    pool: &'static Pool,
    raw: NonNull<RawRing>,
    array: NonNull<Slot<T>>,
    /// AND-mask that wraps indices at the capacity.
    mask: u32,
    /// Consumer-private read position; deliberately not in shared memory.
    tail_index: Cell<u32>,
}

// A handle may migrate between threads, but `Cell` keeps it !Sync: the
// single-consumer protocol relies on one thread at a time per handle.
unsafe impl<T: Copy + Send> Send for Ring<T> {}

impl<T: Copy> Ring<T> {
    /// Creates a new ring of `capacity` slots in the pool.
    pub fn create(capacity: u32) -> Result<Self> {
        Self::create_in(Pool::acquire()?, capacity)
    }

    /// [`Ring::create`] against an already-acquired pool handle.
    pub(crate) fn create_in(pool: &'static Pool, capacity: u32) -> Result<Self> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(MagnonError::invalid_parameter(
                "capacity",
                "Ring capacity must be a nonzero power of two",
            ));
        }
        let raw = pool
            .alloc_value::<RawRing>()
            .ok_or(MagnonError::out_of_pool(mem::size_of::<RawRing>()))?;
        let array = match pool.alloc_array::<Slot<T>>(capacity as usize) {
            Some(array) => array,
            None => {
                pool.free_value(raw.as_ptr());
                return Err(MagnonError::out_of_pool(
                    mem::size_of::<Slot<T>>() * capacity as usize,
                ));
            }
        };

        unsafe {
            let header = raw.as_ptr();
            ptr::addr_of_mut!((*header).write_length).write(AtomicU32::new(0));
            ptr::addr_of_mut!((*header).head_index).write(AtomicU32::new(0));
            ptr::addr_of_mut!((*header).array_offset).write(pool.offset_of(array.as_ptr()));
            ptr::addr_of_mut!((*header).array_length).write(capacity);
            ptr::addr_of_mut!((*header).length_shifts).write(capacity.trailing_zeros());

            for i in 0..capacity as usize {
                let slot = array.as_ptr().add(i);
                ptr::addr_of_mut!((*slot).valid).write(AtomicU32::new(EMPTY));
                ptr::addr_of_mut!((*slot).write_waiters).write(AtomicU32::new(0));
            }
        }

        Ok(Self {
            pool,
            raw,
            array,
            mask: index_mask(capacity.trailing_zeros()),
            tail_index: Cell::new(0),
        })
    }

    /// Attaches to an existing ring by the pool offset of its header.
    ///
    /// The offset must have come from [`Ring::offset`] on a live ring of
    /// the same `T`; this is the cross-process door and cannot be checked.
    pub fn open(offset: i32) -> Result<Self> {
        Ok(Self::open_in(Pool::acquire()?, offset))
    }

    /// [`Ring::open`] against an already-acquired pool handle.
    pub(crate) fn open_in(pool: &'static Pool, offset: i32) -> Self {
        let raw: NonNull<RawRing> = unsafe { NonNull::new_unchecked(pool.at_offset(offset)) };
        let (array_offset, shifts) = unsafe {
            let header = raw.as_ref();
            (header.array_offset, header.length_shifts)
        };
        let array = unsafe { NonNull::new_unchecked(pool.at_offset(array_offset)) };

        Self {
            pool,
            raw,
            array,
            mask: index_mask(shifts),
            tail_index: Cell::new(0),
        }
    }

    fn raw(&self) -> &RawRing {
        unsafe { self.raw.as_ref() }
    }

    fn slot(&self, index: u32) -> &Slot<T> {
        unsafe { &*self.array.as_ptr().add(index as usize) }
    }

    /// Ring capacity in items.
    pub fn capacity(&self) -> u32 {
        self.raw().array_length
    }

    /// Pool offset of the shared header, for handing to [`Ring::open`].
    pub fn offset(&self) -> i32 {
        self.pool.offset_of(self.raw.as_ptr())
    }

    /// Claims space for one future [`Ring::enqueue_at`] without choosing a
    /// slot yet. Returns false when the ring is full. Every success must be
    /// followed by exactly one `enqueue_at` or `cancel_reservation`.
    pub fn reserve(&self) -> bool {
        let raw = self.raw();
        let old_length = atomics::fetch_add(&raw.write_length, 1);
        atomics::fence();
        if old_length >= raw.array_length {
            // Full; undo before anyone acts on the overshoot.
            atomics::decrement(&raw.write_length);
            return false;
        }
        true
    }

    /// Releases a reservation made with [`Ring::reserve`].
    pub fn cancel_reservation(&self) {
        atomics::decrement(&self.raw().write_length);
    }

    /// Commits an item into space previously reserved with
    /// [`Ring::reserve`].
    pub fn enqueue_at(&self, item: T) {
        self.commit(item, false);
    }

    /// Non-blocking enqueue: reserve and commit in one step. Returns false
    /// when the ring is full.
    pub fn enqueue(&self, item: T) -> bool {
        if !self.reserve() {
            return false;
        }
        self.enqueue_at(item);
        true
    }

    /// Enqueues, waiting for space if the ring is full. Blocked producers
    /// at the same slot unblock in arrival order.
    pub fn enqueue_blocking(&self, item: T) {
        // Take the space unconditionally; the turnstile will hold us until
        // the claimed slot is actually writable.
        atomics::increment(&self.raw().write_length);
        atomics::fence();
        self.commit(item, true);
    }

    fn commit(&self, item: T, can_block: bool) {
        let raw = self.raw();

        // Claim a slot index. The fetch_and keeps the shared counter from
        // running away; the claimed value is wrapped separately in case a
        // batch of increments lands before their wrap-arounds do.
        let old_head = atomics::fetch_add(&raw.head_index, 1);
        atomics::fence();
        atomics::fetch_and(&raw.head_index, self.mask);
        let slot = self.slot(old_head & self.mask);

        // Every producer draws a ticket, blocking or not, so the released
        // counter stays in step with arrivals.
        let ticket = waiters::take_ticket(&slot.write_waiters);
        if can_block {
            waiters::wait_for_turn(&slot.write_waiters, ticket);
        }

        unsafe { ptr::write_volatile(slot.value.get(), item) };

        // Publish only after the payload bytes are in place.
        atomics::fence();
        let old_valid = atomics::exchange(&slot.valid, FILLED);
        debug_assert!(old_valid != FILLED, "overwriting a committed slot");
        if old_valid == WAITED {
            // The consumer announced itself on this slot; wake it.
            futex_wake(&slot.valid, 1);
        }
    }

    /// Non-blocking dequeue. Returns `None` when the ring is empty.
    pub fn dequeue(&self) -> Option<T> {
        let slot = self.slot(self.tail_index.get());
        if !atomics::compare_exchange(&slot.valid, FILLED, EMPTY) {
            return None;
        }

        let item = self.consume(slot);
        atomics::fence();
        atomics::decrement(&self.raw().write_length);
        Some(item)
    }

    /// Dequeues, waiting for an item if the ring is empty.
    pub fn dequeue_blocking(&self) -> T {
        let slot = self.slot(self.tail_index.get());
        if !atomics::compare_exchange(&slot.valid, FILLED, EMPTY) {
            self.wait_for_fill(slot);
            // Sole consumer: the slot is committed now. Claim it.
            atomics::exchange(&slot.valid, EMPTY);
        }

        let item = self.consume(slot);
        atomics::fence();
        let old_length = atomics::fetch_sub(&self.raw().write_length, 1);
        if old_length > self.raw().array_length {
            // Producers are queued beyond capacity. Wake everyone parked on
            // this slot; the turnstile lets one through and re-parks the
            // rest.
            futex_wake_all(&slot.write_waiters);
        }
        item
    }

    /// Non-blocking peek: copies the next item without consuming it.
    /// After a successful peek, the next [`Ring::dequeue`] on this handle
    /// is guaranteed to succeed.
    pub fn peek(&self) -> Option<T> {
        let slot = self.slot(self.tail_index.get());
        if atomics::load(&slot.valid) != FILLED {
            return None;
        }
        Some(unsafe { ptr::read_volatile(slot.value.get()) })
    }

    /// Peeks, waiting for an item if the ring is empty.
    pub fn peek_blocking(&self) -> T {
        let slot = self.slot(self.tail_index.get());
        if atomics::load(&slot.valid) != FILLED {
            self.wait_for_fill(slot);
        }
        unsafe { ptr::read_volatile(slot.value.get()) }
    }

    /// Announces the consumer on an empty slot and sleeps until a producer
    /// commits into it. On return the slot is FILLED.
    fn wait_for_fill(&self, slot: &Slot<T>) {
        if atomics::compare_exchange(&slot.valid, EMPTY, WAITED) {
            while atomics::load(&slot.valid) == WAITED {
                futex_wait(&slot.valid, WAITED);
            }
        }
        // If the exchange failed, a producer beat us to the slot and it is
        // already FILLED.
    }

    /// Copies the item out and retires the slot. The caller has already
    /// moved `valid` out of FILLED.
    fn consume(&self, slot: &Slot<T>) -> T {
        let item = unsafe { ptr::read_volatile(slot.value.get()) };
        self.tail_index.set((self.tail_index.get() + 1) & self.mask);
        // Let the next ticketed writer at this slot through.
        waiters::release_one(&slot.write_waiters);
        item
    }

    /// Returns the ring's pool storage (header and slot array). Only call
    /// when every process is done with this ring; handles left open
    /// elsewhere become dangling.
    pub fn free(self) {
        let raw = self.raw();
        let array_ptr = self.array.as_ptr();
        let len = raw.array_length as usize;
        self.pool.free_array(array_ptr, len);
        self.pool.free_value(self.raw.as_ptr());
    }
}

fn index_mask(shifts: u32) -> u32 {
    // A shift by 32 would be undefined; a one-slot ring masks to zero.
    if shifts == 0 {
        0
    } else {
        u32::MAX >> (32 - shifts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::test_pool;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_capacity_must_be_power_of_two() {
        test_pool();
        assert!(Ring::<u32>::create(0).is_err());
        assert!(Ring::<u32>::create(48).is_err());
        let ring = Ring::<u32>::create(1).unwrap();
        assert_eq!(ring.capacity(), 1);
        ring.free();
    }

    #[test]
    fn test_single_thread_fill_and_drain() {
        test_pool();
        let ring = Ring::<i32>::create(64).unwrap();

        for i in 0..64 {
            assert!(ring.enqueue(i), "enqueue {} failed", i);
        }
        assert!(!ring.enqueue(64), "full ring accepted an item");

        for i in 0..64 {
            assert_eq!(ring.dequeue(), Some(i));
        }
        assert_eq!(ring.dequeue(), None);

        ring.free();
    }

    #[test]
    fn test_wraparound() {
        test_pool();
        let ring = Ring::<u64>::create(8).unwrap();

        for round in 0..5u64 {
            for i in 0..8 {
                assert!(ring.enqueue(round * 8 + i));
            }
            for i in 0..8 {
                assert_eq!(ring.dequeue(), Some(round * 8 + i));
            }
        }
        ring.free();
    }

    #[test]
    fn test_reserve_and_cancel() {
        test_pool();
        let ring = Ring::<u8>::create(2).unwrap();

        assert!(ring.reserve());
        assert!(ring.reserve());
        assert!(!ring.reserve(), "reservations exceeded capacity");

        ring.cancel_reservation();
        assert!(ring.reserve());

        ring.enqueue_at(1);
        ring.enqueue_at(2);
        assert_eq!(ring.dequeue(), Some(1));
        assert_eq!(ring.dequeue(), Some(2));

        ring.free();
    }

    #[test]
    fn test_peek_does_not_consume() {
        test_pool();
        let ring = Ring::<i32>::create(4).unwrap();
        assert_eq!(ring.peek(), None);

        ring.enqueue(7);
        assert_eq!(ring.peek(), Some(7));
        assert_eq!(ring.peek(), Some(7));
        assert_eq!(ring.dequeue(), Some(7));
        assert_eq!(ring.peek(), None);

        ring.free();
    }

    #[test]
    fn test_open_shares_state() {
        test_pool();
        let ring = Ring::<u32>::create(8).unwrap();
        let producer = Ring::<u32>::open(ring.offset()).unwrap();

        assert!(producer.enqueue(99));
        assert_eq!(ring.dequeue(), Some(99));

        ring.free();
    }

    #[test]
    fn test_mpsc_sums_to_zero() {
        test_pool();
        let ring = Ring::<i64>::create(64).unwrap();
        let offset = ring.offset();

        let mut producers = Vec::new();
        for _ in 0..4 {
            producers.push(thread::spawn(move || {
                let handle = Ring::<i64>::open(offset).unwrap();
                for v in -500..=500i64 {
                    while !handle.enqueue(v) {
                        thread::yield_now();
                    }
                }
            }));
        }

        let expected = 4 * 1001;
        let mut sum = 0i64;
        let mut count = 0usize;
        while count < expected {
            if let Some(v) = ring.dequeue() {
                sum += v;
                count += 1;
            } else {
                thread::yield_now();
            }
        }

        for p in producers {
            p.join().unwrap();
        }
        assert_eq!(sum, 0);
        assert_eq!(ring.dequeue(), None);
        ring.free();
    }

    #[test]
    fn test_blocking_dequeue_wakes_on_commit() {
        test_pool();
        let ring = Ring::<u32>::create(4).unwrap();
        let offset = ring.offset();

        let consumer = thread::spawn(move || {
            let handle = Ring::<u32>::open(offset).unwrap();
            handle.dequeue_blocking()
        });

        // Let the consumer park on the empty slot first.
        thread::sleep(Duration::from_millis(50));
        let producer = Ring::<u32>::open(offset).unwrap();
        assert!(producer.enqueue(123));

        assert_eq!(consumer.join().unwrap(), 123);
        ring.free();
    }

    #[test]
    fn test_blocking_enqueue_waits_for_space() {
        // Capacity-one ring: the second producer must block until the
        // consumer drains the first item.
        test_pool();
        let ring = Ring::<u32>::create(1).unwrap();
        let offset = ring.offset();

        assert!(ring.enqueue(1));

        let committed = Arc::new(AtomicBool::new(false));
        let producer = {
            let committed = Arc::clone(&committed);
            thread::spawn(move || {
                let handle = Ring::<u32>::open(offset).unwrap();
                handle.enqueue_blocking(2);
                committed.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(
            !committed.load(Ordering::SeqCst),
            "producer committed into a full ring"
        );

        assert_eq!(ring.dequeue_blocking(), 1);
        producer.join().unwrap();
        assert!(committed.load(Ordering::SeqCst));
        assert_eq!(ring.dequeue_blocking(), 2);

        ring.free();
    }

    #[test]
    fn test_blocking_peek_then_dequeue() {
        test_pool();
        let ring = Ring::<u32>::create(2).unwrap();
        let offset = ring.offset();

        let consumer = thread::spawn(move || {
            let handle = Ring::<u32>::open(offset).unwrap();
            let peeked = handle.peek_blocking();
            let dequeued = handle.dequeue().unwrap();
            (peeked, dequeued)
        });

        thread::sleep(Duration::from_millis(50));
        let producer = Ring::<u32>::open(offset).unwrap();
        assert!(producer.enqueue(55));

        assert_eq!(consumer.join().unwrap(), (55, 55));
        ring.free();
    }

    #[test]
    fn test_blocked_producers_unblock_in_order() {
        test_pool();
        let ring = Ring::<u32>::create(1).unwrap();
        let offset = ring.offset();

        assert!(ring.enqueue(0));

        // Stagger two blocking producers onto the same slot.
        let first = thread::spawn(move || {
            let handle = Ring::<u32>::open(offset).unwrap();
            handle.enqueue_blocking(1);
        });
        thread::sleep(Duration::from_millis(50));
        let second = thread::spawn(move || {
            let handle = Ring::<u32>::open(offset).unwrap();
            handle.enqueue_blocking(2);
        });
        thread::sleep(Duration::from_millis(50));

        assert_eq!(ring.dequeue_blocking(), 0);
        assert_eq!(ring.dequeue_blocking(), 1);
        assert_eq!(ring.dequeue_blocking(), 2);

        first.join().unwrap();
        second.join().unwrap();
        ring.free();
    }
}
