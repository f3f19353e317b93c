//! The fan-out MPMC queue: one inner ring per consumer, so every consumer
//! receives every message.
//!
//! The shared part is a header holding a fixed table of subqueue
//! descriptors. A consumer handle creates its own ring and publishes it in
//! a descriptor; producer handles notice table changes through a cheap
//! epoch counter and attach or detach rings accordingly. A broadcast
//! reserves a slot in every live ring before committing to any of them, so
//! delivery is all-or-nothing.
//!
//! A `Queue` value is a single-thread handle. To share a queue between
//! threads or processes, open more handles at the same offset (or fetch
//! the same name); never share one handle.

pub(crate) mod registry;

use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use crate::atomics;
use crate::consts::{MAX_CONSUMERS, QUEUE_CAPACITY};
use crate::error::{MagnonError, Result};
use crate::pool::Pool;
use crate::ring::Ring;

/// One subqueue's shared bookkeeping.
///
/// A descriptor is in exactly one of three states: FREE (`dead` = 1, no
/// references), LIVE (`valid` = 1, at least the owner's reference), or
/// DYING (invalidated by its owner but still referenced by producers).
/// Only the owning consumer moves LIVE to DYING; whichever handle drops
/// the last reference moves DYING to FREE.
#[repr(C)]
struct Descriptor {
    /// Pool offset of the ring header.
    offset: AtomicI32,
    /// Set once the ring is publishable; cleared when the owner leaves.
    valid: AtomicU32,
    /// Set while the slot is reusable by a new consumer.
    dead: AtomicU32,
    /// Handles that may still act on this subqueue.
    num_references: AtomicU32,
}

/// Pool-resident queue state.
#[repr(C)]
struct RawQueue {
    /// Number of live subqueues.
    num_subqueues: AtomicU32,
    /// Ring capacity, fixed at creation for every subqueue.
    subqueue_size: u32,
    /// Bumped on every descriptor state change; handles compare it against
    /// their last-seen value to skip rescanning an unchanged table.
    subqueue_updates: AtomicU32,
    descriptors: [Descriptor; MAX_CONSUMERS],
}

/// A handle to a shared fan-out queue of `T`.
pub struct Queue<T: Copy> {
    pool: &'static Pool,
    raw: NonNull<RawQueue>,
    /// Local ring handles, indexed like the descriptor table.
    subqueues: Vec<Option<Ring<T>>>,
    /// Index of the ring this handle consumes from, if it is a consumer.
    my_subqueue: Option<usize>,
    last_num_subqueues: u32,
    last_subqueue_updates: u32,
    /// Scratch list of reserved indices during a broadcast; preallocated
    /// so the enqueue path does not allocate.
    writable: Vec<usize>,
}

unsafe impl<T: Copy + Send> Send for Queue<T> {}

impl<T: Copy> Queue<T> {
    /// Creates a brand new queue in the pool. `consumer` decides whether
    /// this handle can dequeue; producer-only handles never add a
    /// subqueue, which keeps a never-read ring from filling up and
    /// stalling broadcasts. Normally [`Queue::fetch`] is used instead.
    pub fn create(consumer: bool, capacity: u32) -> Result<Self> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(MagnonError::invalid_parameter(
                "capacity",
                "Queue capacity must be a nonzero power of two",
            ));
        }

        let pool = Pool::acquire()?;
        let raw = pool
            .alloc_value::<RawQueue>()
            .ok_or(MagnonError::out_of_pool(mem::size_of::<RawQueue>()))?;

        unsafe {
            let header = raw.as_ptr();
            ptr::addr_of_mut!((*header).num_subqueues).write(AtomicU32::new(0));
            ptr::addr_of_mut!((*header).subqueue_size).write(capacity);
            ptr::addr_of_mut!((*header).subqueue_updates).write(AtomicU32::new(0));
            for i in 0..MAX_CONSUMERS {
                let desc = ptr::addr_of_mut!((*header).descriptors[i]);
                ptr::addr_of_mut!((*desc).offset).write(AtomicI32::new(0));
                ptr::addr_of_mut!((*desc).valid).write(AtomicU32::new(0));
                ptr::addr_of_mut!((*desc).dead).write(AtomicU32::new(1));
                ptr::addr_of_mut!((*desc).num_references).write(AtomicU32::new(0));
            }
        }

        Self::with_local_state(pool, raw, consumer)
    }

    /// Attaches a new handle to an existing queue by header offset.
    pub fn load(consumer: bool, offset: i32) -> Result<Self> {
        let pool = Pool::acquire()?;
        let raw = NonNull::new(pool.at_offset::<RawQueue>(offset))
            .ok_or_else(|| MagnonError::platform("Null queue header"))?;
        Self::with_local_state(pool, raw, consumer)
    }

    fn with_local_state(pool: &'static Pool, raw: NonNull<RawQueue>, consumer: bool) -> Result<Self> {
        let mut queue = Self {
            pool,
            raw,
            subqueues: (0..MAX_CONSUMERS).map(|_| None).collect(),
            my_subqueue: None,
            last_num_subqueues: 0,
            last_subqueue_updates: 0,
            writable: Vec::with_capacity(MAX_CONSUMERS),
        };
        if consumer {
            queue.make_own_subqueue()?;
        }
        Ok(queue)
    }

    /// Fetches the queue registered under `name`, creating it (with the
    /// default capacity) on first use. The handle can produce and consume.
    pub fn fetch(name: &str) -> Result<Self> {
        registry::fetch_queue(name, true, QUEUE_CAPACITY)
    }

    /// Like [`Queue::fetch`], but the handle is producer-only.
    pub fn fetch_producer(name: &str) -> Result<Self> {
        registry::fetch_queue(name, false, QUEUE_CAPACITY)
    }

    /// Like [`Queue::fetch`] with an explicit per-ring capacity, applied
    /// only if this call ends up creating the queue.
    pub fn fetch_sized(name: &str, capacity: u32) -> Result<Self> {
        registry::fetch_queue(name, true, capacity)
    }

    /// Producer-only variant of [`Queue::fetch_sized`].
    pub fn fetch_sized_producer(name: &str, capacity: u32) -> Result<Self> {
        registry::fetch_queue(name, false, capacity)
    }

    fn raw(&self) -> &RawQueue {
        unsafe { self.raw.as_ref() }
    }

    fn descriptor(&self, index: usize) -> &Descriptor {
        unsafe { &(*self.raw.as_ptr()).descriptors[index] }
    }

    /// Pool offset of the shared header, for [`Queue::load`] elsewhere.
    pub fn offset(&self) -> i32 {
        self.pool.offset_of(self.raw.as_ptr())
    }

    /// Number of currently live consumers.
    pub fn num_consumers(&self) -> u32 {
        atomics::load(&self.raw().num_subqueues)
    }

    /// Claims a FREE descriptor, creates this handle's ring there, and
    /// publishes it.
    fn make_own_subqueue(&mut self) -> Result<()> {
        let capacity = self.raw().subqueue_size;

        for index in 0..MAX_CONSUMERS {
            let desc = self.descriptor(index);
            // Grab the slot now; losing racers move on to the next one.
            if !atomics::compare_exchange(&desc.dead, 1, 0) {
                continue;
            }
            atomics::fence();

            let ring = match Ring::create_in(self.pool, capacity) {
                Ok(ring) => ring,
                Err(e) => {
                    // Hand the slot back before surfacing the failure.
                    atomics::exchange(&desc.dead, 1);
                    return Err(e);
                }
            };

            desc.offset.store(ring.offset(), Ordering::SeqCst);
            desc.num_references.store(1, Ordering::SeqCst);

            // Publish only after the descriptor is fully described.
            atomics::fence();
            atomics::exchange(&desc.valid, 1);

            self.subqueues[index] = Some(ring);
            self.my_subqueue = Some(index);
            self.last_num_subqueues += 1;
            self.last_subqueue_updates += 1;
            atomics::fence();
            atomics::increment(&self.raw().subqueue_updates);
            atomics::fence();
            atomics::increment(&self.raw().num_subqueues);
            return Ok(());
        }

        Err(MagnonError::too_many_consumers(MAX_CONSUMERS))
    }

    /// Takes a reference on descriptor `index` and opens its ring locally.
    /// Returns false when the subqueue is already being freed.
    fn add_subqueue(&mut self, index: usize) -> bool {
        let desc = self.descriptor(index);
        loop {
            let references = atomics::load(&desc.num_references);
            atomics::fence();
            if references == 0 {
                // Freed under us; it would be invalid to resurrect.
                return false;
            }
            if atomics::compare_exchange(&desc.num_references, references, references + 1) {
                break;
            }
            // Counter moved; retry against the new value.
        }

        let offset = desc.offset.load(Ordering::SeqCst);
        self.subqueues[index] = Some(Ring::open_in(self.pool, offset));
        true
    }

    /// Drops this handle's reference on descriptor `index`. The last
    /// reference out frees the ring and recycles the descriptor.
    fn remove_subqueue(&mut self, index: usize) {
        let references = atomics::fetch_sub(&self.descriptor(index).num_references, 1);
        atomics::fence();

        let ring = self.subqueues[index].take();
        if references == 1 {
            if let Some(ring) = ring {
                ring.free();
            }
            // Only now is the slot safe to hand to a new consumer.
            atomics::fence();
            atomics::exchange(&self.descriptor(index).dead, 1);
        }
    }

    /// Brings the local ring cache in line with the shared descriptor
    /// table. Does nothing when the update epoch is unchanged.
    fn incorporate_new_subqueues(&mut self) {
        let updates = atomics::load(&self.raw().subqueue_updates);
        atomics::fence();
        if updates == self.last_subqueue_updates {
            return;
        }

        for index in 0..MAX_CONSUMERS {
            let valid = atomics::load(&self.descriptor(index).valid);
            if valid == 1 && self.subqueues[index].is_none() {
                if self.add_subqueue(index) {
                    self.last_num_subqueues += 1;
                }
            } else if valid == 0 && self.subqueues[index].is_some() {
                self.remove_subqueue(index);
                self.last_num_subqueues -= 1;
            }
        }

        self.last_subqueue_updates = updates;
    }

    /// Broadcasts `item` to every live consumer without blocking.
    ///
    /// Delivery is all-or-nothing: a slot is reserved in every ring before
    /// any copy is committed, and one full ring rolls every reservation
    /// back. Returns false when any ring is full or when there are no
    /// consumers at all (the message would go to the void).
    pub fn enqueue(&mut self, item: T) -> bool {
        self.incorporate_new_subqueues();
        if self.last_num_subqueues == 0 {
            return false;
        }

        self.writable.clear();
        for index in 0..MAX_CONSUMERS {
            let Some(ring) = &self.subqueues[index] else {
                continue;
            };
            if !ring.reserve() {
                for &reserved in &self.writable {
                    self.subqueues[reserved]
                        .as_ref()
                        .expect("reserved subqueue vanished")
                        .cancel_reservation();
                }
                return false;
            }
            self.writable.push(index);
            if self.writable.len() == self.last_num_subqueues as usize {
                // Found every ring that exists; no point scanning on.
                break;
            }
        }
        debug_assert_eq!(self.writable.len(), self.last_num_subqueues as usize);

        for &index in &self.writable {
            self.subqueues[index]
                .as_ref()
                .expect("reserved subqueue vanished")
                .enqueue_at(item);
        }
        true
    }

    /// Broadcasts `item`, waiting for space in each full ring in turn.
    /// Returns false only when there are no consumers.
    pub fn enqueue_blocking(&mut self, item: T) -> bool {
        self.incorporate_new_subqueues();
        if self.last_num_subqueues == 0 {
            return false;
        }

        let mut written = 0;
        for index in 0..MAX_CONSUMERS {
            let Some(ring) = &self.subqueues[index] else {
                continue;
            };
            ring.enqueue_blocking(item);
            written += 1;
            if written == self.last_num_subqueues {
                break;
            }
        }
        debug_assert_eq!(written, self.last_num_subqueues);
        true
    }

    fn consumer_ring(&self) -> &Ring<T> {
        let index = self
            .my_subqueue
            .expect("dequeue/peek on a producer-only queue handle");
        self.subqueues[index]
            .as_ref()
            .expect("consumer subqueue missing")
    }

    /// Removes the next item from this handle's own ring. Returns `None`
    /// when it is empty. Consumer handles only.
    pub fn dequeue(&self) -> Option<T> {
        self.consumer_ring().dequeue()
    }

    /// Like [`Queue::dequeue`], waiting for an item if the ring is empty.
    pub fn dequeue_blocking(&self) -> T {
        self.consumer_ring().dequeue_blocking()
    }

    /// Copies the next item without consuming it. Consumer handles only.
    pub fn peek(&self) -> Option<T> {
        self.consumer_ring().peek()
    }

    /// Like [`Queue::peek`], waiting for an item if the ring is empty.
    pub fn peek_blocking(&self) -> T {
        self.consumer_ring().peek_blocking()
    }

    /// Returns every piece of the queue's pool storage: all subqueues it
    /// can see plus the header. Only call when every process is done with
    /// the queue; other handles become dangling.
    pub fn free(mut self) {
        self.incorporate_new_subqueues();

        self.my_subqueue = None;
        for index in 0..MAX_CONSUMERS {
            if let Some(ring) = self.subqueues[index].take() {
                ring.free();
            }
        }
        self.pool.free_value(self.raw.as_ptr());
        // Drop now finds no local state and touches nothing shared.
    }
}

impl<T: Copy> Drop for Queue<T> {
    fn drop(&mut self) {
        if let Some(index) = self.my_subqueue.take() {
            // Retire our own subqueue first so producers stop broadcasting
            // into it, then let the reference count settle its storage.
            let desc = self.descriptor(index);
            atomics::exchange(&desc.valid, 0);
            atomics::fence();
            atomics::decrement(&self.raw().num_subqueues);
            atomics::fence();
            atomics::increment(&self.raw().subqueue_updates);
        }

        for index in 0..MAX_CONSUMERS {
            if self.subqueues[index].is_some() {
                self.remove_subqueue(index);
            }
        }
    }
}
