//! Build-time constants shared by every process that maps the pool.
//!
//! All participants must be compiled with the same values here; the pool
//! layout and the queue descriptor table are sized by these constants.

/// Name of the POSIX shared memory segment backing the default pool.
pub const SHM_NAME: &str = "/magnon_core";

/// Allocation quantum of the pool, in bytes. Chosen to balance bitmap
/// overhead against wasted space; the page size should be an integer
/// multiple of this number.
pub const BLOCK_SIZE: usize = 128;

/// Default size request for the pool data area, in bytes.
pub const POOL_SIZE: usize = 64_000;

/// Default ring capacity is 1 << QUEUE_CAPACITY_SHIFTS items.
pub const QUEUE_CAPACITY_SHIFTS: u32 = 6;

/// Default number of items each ring can hold. Must be a power of two.
pub const QUEUE_CAPACITY: u32 = 1 << QUEUE_CAPACITY_SHIFTS;

/// Maximum number of consumers a fan-out queue can have. This bounds the
/// descriptor table embedded in every queue header.
pub const MAX_CONSUMERS: usize = 64;

/// Number of buckets in the hash map that stores queue names.
pub const NAME_MAP_BUCKETS: usize = 128;

/// Pool offset where the queue name registry lives. Placement-allocated,
/// so every process finds the same map.
pub const NAME_MAP_OFFSET: i32 = 0;
