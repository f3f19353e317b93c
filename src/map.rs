//! A fixed-capacity hash map stored entirely in the pool.
//!
//! Buckets chain through pool offsets on collision. Every lookup and
//! mutation takes the map's pool-resident mutex; this structure backs the
//! queue name registry, where contention is rare and simplicity wins.
//!
//! The map bootstraps by placement: the first process to construct it at a
//! given offset allocates and initializes the shared state there, and
//! every later construction at that offset finds the block in use and
//! attaches to what the first one built.

use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};

use crate::error::{MagnonError, Result};
use crate::keys::MapKey;
use crate::pool::Pool;
use crate::sync::Mutex;

/// Sentinel for "no overflow bucket".
const NO_BUCKET: i32 = -1;

/// Pool-resident map state, found at the map's placement offset.
#[repr(C)]
struct MapHeader {
    /// Pool offset of the bucket array.
    data_offset: i32,
    /// Pool offset of the mutex guarding the map.
    lock_offset: i32,
}

/// One storage location. Overflow buckets are pool-allocated and linked
/// through `next`.
#[repr(C)]
struct Bucket<K, V> {
    occupied: u32,
    key: K,
    value: V,
    next: i32,
}

/// A handle to a shared map keyed by `K` with trivially copyable values.
pub struct SharedHashMap<K: MapKey, V: Copy> {
    pool: &'static Pool,
    buckets: NonNull<Bucket<K::Stored, V>>,
    lock: NonNull<Mutex>,
    num_buckets: usize,
    _marker: PhantomData<(K, V)>,
}

// All shared access funnels through the pool-resident mutex.
unsafe impl<K: MapKey, V: Copy> Send for SharedHashMap<K, V> {}
unsafe impl<K: MapKey, V: Copy> Sync for SharedHashMap<K, V> {}

impl<K: MapKey, V: Copy> SharedHashMap<K, V> {
    /// Constructs or attaches to the map placed at `offset`. The first
    /// caller across all processes initializes it; everyone else attaches.
    /// All participants must agree on `offset`, `num_buckets`, and the
    /// key/value types.
    pub fn new(offset: i32, num_buckets: usize) -> Result<Self> {
        let pool = Pool::acquire()?;

        if !pool.is_used(offset) {
            match pool.alloc_value_at::<MapHeader>(offset) {
                Some(header) => return Self::initialize(pool, header, num_buckets),
                // Lost the placement race to another process; fall through
                // and attach to what it is building.
                None => {}
            }
        }
        Self::attach(pool, offset, num_buckets)
    }

    fn initialize(
        pool: &'static Pool,
        header: NonNull<MapHeader>,
        num_buckets: usize,
    ) -> Result<Self> {
        let buckets = pool
            .alloc_array::<Bucket<K::Stored, V>>(num_buckets)
            .ok_or(MagnonError::out_of_pool(
                mem::size_of::<Bucket<K::Stored, V>>() * num_buckets,
            ))?;
        for i in 0..num_buckets {
            unsafe {
                let bucket = buckets.as_ptr().add(i);
                ptr::addr_of_mut!((*bucket).occupied).write(0);
                ptr::addr_of_mut!((*bucket).next).write(NO_BUCKET);
            }
        }

        let lock = pool
            .alloc_value::<Mutex>()
            .ok_or(MagnonError::out_of_pool(mem::size_of::<Mutex>()))?;
        unsafe { lock.as_ref() }.init();

        unsafe {
            let header = header.as_ptr();
            (*header).data_offset = pool.offset_of(buckets.as_ptr());
            (*header).lock_offset = pool.offset_of(lock.as_ptr());
        }

        Ok(Self {
            pool,
            buckets,
            lock,
            num_buckets,
            _marker: PhantomData,
        })
    }

    fn attach(pool: &'static Pool, offset: i32, num_buckets: usize) -> Result<Self> {
        let header: *const MapHeader = pool.at_offset(offset);
        let (data_offset, lock_offset) = unsafe { ((*header).data_offset, (*header).lock_offset) };

        Ok(Self {
            pool,
            buckets: NonNull::new(pool.at_offset(data_offset))
                .ok_or_else(|| MagnonError::platform("Corrupt map header"))?,
            lock: NonNull::new(pool.at_offset(lock_offset))
                .ok_or_else(|| MagnonError::platform("Corrupt map header"))?,
            num_buckets,
            _marker: PhantomData,
        })
    }

    fn lock(&self) -> &Mutex {
        unsafe { self.lock.as_ref() }
    }

    fn bucket_at(&self, index: usize) -> *mut Bucket<K::Stored, V> {
        debug_assert!(index < self.num_buckets);
        unsafe { self.buckets.as_ptr().add(index) }
    }

    fn home_bucket(&self, key: &K) -> *mut Bucket<K::Stored, V> {
        self.bucket_at(key.hash_key() as usize % self.num_buckets)
    }

    /// Adds a new entry or overwrites the value of an existing one.
    /// Fails only when the pool cannot supply an overflow bucket or a key
    /// copy.
    pub fn insert_or_set(&self, key: &K, value: V) -> Result<()> {
        let _guard = self.lock().guard();

        // Walk the chain looking for the key; remember the chain's last
        // bucket in case we must extend it.
        let mut bucket = self.home_bucket(key);
        let tail = loop {
            unsafe {
                if (*bucket).occupied != 0 && key.matches(&(*bucket).key, self.pool) {
                    // Present already: update in place, keep the stored key.
                    (*bucket).value = value;
                    return Ok(());
                }
                if (*bucket).occupied == 0 {
                    // The home bucket itself is free.
                    break None;
                }
                if (*bucket).next == NO_BUCKET {
                    break Some(bucket);
                }
                bucket = self.pool.at_offset((*bucket).next);
            }
        };

        let target = match tail {
            None => bucket,
            Some(tail) => {
                let overflow = self
                    .pool
                    .alloc_value::<Bucket<K::Stored, V>>()
                    .ok_or(MagnonError::out_of_pool(mem::size_of::<
                        Bucket<K::Stored, V>,
                    >()))?;
                unsafe {
                    let overflow = overflow.as_ptr();
                    ptr::addr_of_mut!((*overflow).occupied).write(0);
                    ptr::addr_of_mut!((*overflow).next).write(NO_BUCKET);
                    (*tail).next = self.pool.offset_of(overflow);
                    overflow
                }
            }
        };

        let stored = key
            .convert(self.pool)
            .ok_or(MagnonError::out_of_pool(0))?;
        unsafe {
            (*target).key = stored;
            (*target).value = value;
            (*target).occupied = 1;
        }
        Ok(())
    }

    /// Looks up the value stored for `key`.
    pub fn get(&self, key: &K) -> Option<V> {
        let _guard = self.lock().guard();

        let mut bucket = self.home_bucket(key);
        loop {
            unsafe {
                if (*bucket).occupied != 0 && key.matches(&(*bucket).key, self.pool) {
                    return Some((*bucket).value);
                }
                if (*bucket).next == NO_BUCKET {
                    return None;
                }
                bucket = self.pool.at_offset((*bucket).next);
            }
        }
    }

    /// Returns the map's pool storage: key copies, overflow buckets, the
    /// bucket array, and the mutex. Only call when every process is done
    /// with the map; the placement header block itself stays claimed so a
    /// later constructor does not misread freed memory as a live map.
    pub fn free(self) {
        for i in 0..self.num_buckets {
            let head = self.bucket_at(i);
            unsafe {
                if (*head).occupied != 0 {
                    K::release(&(*head).key, self.pool);
                }
                let mut next = (*head).next;
                while next != NO_BUCKET {
                    let bucket: *mut Bucket<K::Stored, V> = self.pool.at_offset(next);
                    if (*bucket).occupied != 0 {
                        K::release(&(*bucket).key, self.pool);
                    }
                    next = (*bucket).next;
                    self.pool.free_value(bucket);
                }
            }
        }

        self.pool.free_array(self.buckets.as_ptr(), self.num_buckets);
        self.pool.free_value(self.lock.as_ptr());
    }
}
