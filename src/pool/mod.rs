//! The shared memory pool: a named POSIX segment carved into fixed-size
//! blocks by a bitmap allocator.
//!
//! Every ring, queue header, and registry structure in the crate lives in
//! pool memory and is referred to by its byte offset into the data area;
//! raw pointers never cross a process boundary. The segment is mapped once
//! per process and accessed through a singleton, because mapping the same
//! segment twice in one process is not portable.
//!
//! Layout of the segment, front to back: the pool header (sizes plus the
//! embedded allocation lock), the block-allocation bitmap (one bit per
//! block), padding up to a block boundary, then the data area.

mod bitmap;

use std::fs::File;
use std::mem;
use std::ptr::NonNull;
use std::sync::{Mutex as StdMutex, OnceLock};

use memmap2::{MmapMut, MmapOptions};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use serde::{Deserialize, Serialize};

use crate::consts::{BLOCK_SIZE, POOL_SIZE, SHM_NAME};
use crate::error::{MagnonError, Result};
use crate::sync::Mutex;

use bitmap::{define_segment, Bitmap};

/// Configuration for opening the pool segment.
///
/// Every process that maps the same segment must use the same `size`;
/// offsets handed out by one participant are meaningless otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// POSIX shared memory name (leading slash, no other slashes).
    pub name: String,
    /// Requested data-area size in bytes; rounded up to a whole number of
    /// blocks.
    pub size: usize,
    /// Whether to mlock the mapping. Recommended for real-time use; failure
    /// (e.g. RLIMIT_MEMLOCK) is not fatal.
    pub lock_memory: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: SHM_NAME.to_string(),
            size: POOL_SIZE,
            lock_memory: true,
        }
    }
}

impl PoolConfig {
    /// Config with a custom segment name and the default size.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Builder-style size override.
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }
}

/// Shared state at the very front of the segment.
#[repr(C)]
struct PoolHeader {
    /// Size of the data area in bytes.
    size: u32,
    /// Number of blocks in the data area.
    num_blocks: u32,
    /// Size of the block-allocation bitmap in bytes.
    bitmap_bytes: u32,
    /// Serializes all allocator state changes.
    allocation_lock: Mutex,
}

/// Derived segment geometry for a requested data-area size.
struct Geometry {
    data_size: usize,
    num_blocks: usize,
    bitmap_bytes: usize,
    header_overhead: usize,
    total_size: usize,
}

fn geometry(requested: usize) -> Geometry {
    // The data area is a whole number of blocks.
    let data_size = requested.div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
    let num_blocks = data_size / BLOCK_SIZE;
    let bitmap_bytes = num_blocks.div_ceil(8);

    // Header plus bitmap, padded so block 0 starts block-aligned.
    let header_overhead =
        (mem::size_of::<PoolHeader>() + bitmap_bytes).div_ceil(BLOCK_SIZE) * BLOCK_SIZE;

    Geometry {
        data_size,
        num_blocks,
        bitmap_bytes,
        header_overhead,
        total_size: header_overhead + data_size,
    }
}

/// A mapped handle to the pool. Usually obtained through [`Pool::acquire`];
/// [`Pool::open`] exists for tests and tools that need a private segment.
pub struct Pool {
    mmap: MmapMut,
    _file: File,
    name: String,
    header: NonNull<PoolHeader>,
    bits: NonNull<u8>,
    data: NonNull<u8>,
}

// The mapping is shared by design; all mutation goes through the embedded
// allocation lock or the atomic protocols of the structures stored inside.
unsafe impl Send for Pool {}
unsafe impl Sync for Pool {}

static POOL: OnceLock<Pool> = OnceLock::new();
static POOL_INIT: StdMutex<()> = StdMutex::new(());

impl Pool {
    /// Returns the process-wide pool handle, opening the default segment on
    /// first call. Thread-safe; the first call wins and later calls get the
    /// same handle regardless of their config.
    pub fn acquire() -> Result<&'static Pool> {
        Self::acquire_with(PoolConfig::default())
    }

    /// Like [`Pool::acquire`] but the first caller in the process picks the
    /// segment name and size.
    pub fn acquire_with(config: PoolConfig) -> Result<&'static Pool> {
        if let Some(pool) = POOL.get() {
            return Ok(pool);
        }

        let _init = POOL_INIT.lock().unwrap();
        if let Some(pool) = POOL.get() {
            return Ok(pool);
        }
        let pool = Self::open(config)?;
        Ok(POOL.get_or_init(move || pool))
    }

    /// Opens (creating if absent) the named segment and maps it. Most code
    /// should use [`Pool::acquire`] instead; a process must not map the
    /// same segment twice.
    pub fn open(config: PoolConfig) -> Result<Self> {
        if config.name.is_empty() {
            return Err(MagnonError::invalid_parameter(
                "name",
                "Segment name cannot be empty",
            ));
        }
        if config.size == 0 {
            return Err(MagnonError::invalid_parameter(
                "size",
                "Pool size must be greater than 0",
            ));
        }

        let geo = geometry(config.size);

        // Create-exclusive first; on EEXIST attach to what's already there.
        let mode = Mode::S_IRUSR | Mode::S_IWUSR;
        let (fd, created) = match shm_open(
            config.name.as_str(),
            OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_EXCL,
            mode,
        ) {
            Ok(fd) => (fd, true),
            Err(Errno::EEXIST) => (shm_open(config.name.as_str(), OFlag::O_RDWR, mode)?, false),
            Err(e) => return Err(e.into()),
        };

        if created {
            nix::unistd::ftruncate(&fd, geo.total_size as libc::off_t)?;
        }

        let file = File::from(fd);
        let mmap = unsafe {
            MmapOptions::new()
                .len(geo.total_size)
                .map_mut(&file)
                .map_err(|e| MagnonError::from_io(e, "Failed to map pool segment"))?
        };
        if config.lock_memory {
            // Pin the mapping for real-time use; failure just means page
            // faults stay possible.
            let _ = mmap.lock();
        }

        let base = mmap.as_ptr() as *mut u8;
        let pool = unsafe {
            Self {
                header: NonNull::new_unchecked(base as *mut PoolHeader),
                bits: NonNull::new_unchecked(base.add(mem::size_of::<PoolHeader>())),
                data: NonNull::new_unchecked(base.add(geo.header_overhead)),
                name: config.name,
                _file: file,
                mmap,
            }
        };

        if created {
            unsafe {
                let header = pool.header.as_ptr();
                (*header).size = geo.data_size as u32;
                (*header).num_blocks = geo.num_blocks as u32;
                (*header).bitmap_bytes = geo.bitmap_bytes as u32;
            }
            pool.header().allocation_lock.init();
            pool.clear();
        } else {
            let header = unsafe { pool.header.as_ref() };
            if header.size != geo.data_size as u32 {
                return Err(MagnonError::invalid_parameter(
                    "size",
                    format!(
                        "Existing segment has a {}-byte data area, expected {}",
                        header.size, geo.data_size
                    ),
                ));
            }
        }

        Ok(pool)
    }

    fn header(&self) -> &PoolHeader {
        unsafe { self.header.as_ref() }
    }

    /// Size of the data area in bytes. Offsets are valid in `[0, size)`.
    pub fn size(&self) -> usize {
        self.header().size as usize
    }

    /// The allocator's quantum.
    pub const fn block_size() -> usize {
        BLOCK_SIZE
    }

    /// Runs `f` on the bitmap. Callers must hold the allocation lock.
    fn with_bitmap<R>(&self, f: impl FnOnce(&mut Bitmap) -> R) -> R {
        let header = self.header();
        let bits = unsafe {
            std::slice::from_raw_parts_mut(self.bits.as_ptr(), header.bitmap_bytes as usize)
        };
        f(&mut Bitmap::new(bits, header.num_blocks as usize))
    }

    /// Reserves the best-fitting free run of blocks covering `bytes` bytes.
    /// Returns the run's starting offset, or `None` when no free run is
    /// large enough. Never blocks beyond the allocation lock.
    pub fn allocate(&self, bytes: usize) -> Option<i32> {
        debug_assert!(bytes > 0, "allocating zero-length extent?");
        let blocks = bytes.div_ceil(BLOCK_SIZE);

        let _lock = self.header().allocation_lock.guard();
        self.with_bitmap(|map| {
            let seg = map.best_fit(blocks)?;
            map.set_segment(&seg, true);
            Some((seg.start_block * BLOCK_SIZE) as i32)
        })
    }

    /// Reserves exactly the span `[offset, offset + bytes)` if every block
    /// it covers is free. Used for fixed-offset rendezvous structures.
    pub fn allocate_at(&self, offset: i32, bytes: usize) -> Option<i32> {
        debug_assert!(bytes > 0, "allocating zero-length extent?");
        debug_assert!(
            offset >= 0 && offset as usize + bytes <= self.size(),
            "placement span exceeds the pool"
        );
        let seg = define_segment(offset as usize, bytes);

        let _lock = self.header().allocation_lock.guard();
        self.with_bitmap(|map| {
            if !map.span_is_free(&seg) {
                return None;
            }
            map.set_segment(&seg, true);
            Some(offset)
        })
    }

    /// Releases the blocks covering `[offset, offset + bytes)`. The span
    /// must exactly cover a live allocation.
    pub fn free(&self, offset: i32, bytes: usize) {
        let seg = define_segment(offset as usize, bytes);

        let _lock = self.header().allocation_lock.guard();
        self.with_bitmap(|map| {
            debug_assert!(map.span_is_used(&seg), "freeing blocks that are not allocated");
            map.set_segment(&seg, false);
        })
    }

    /// Whether the block covering `offset` is allocated. This is how
    /// placement-allocated structures detect an already-initialized peer.
    pub fn is_used(&self, offset: i32) -> bool {
        let block = offset as usize / BLOCK_SIZE;
        let _lock = self.header().allocation_lock.guard();
        self.with_bitmap(|map| map.block_is_used(block))
    }

    /// Translates a pool offset to a pointer in this process's mapping.
    pub fn at_offset<T>(&self, offset: i32) -> *mut T {
        debug_assert!(
            offset >= 0 && (offset as usize) < self.size(),
            "pool offset out of bounds"
        );
        let ptr = unsafe { self.data.as_ptr().add(offset as usize) };
        debug_assert!(ptr as usize % mem::align_of::<T>() == 0, "misaligned pool access");
        ptr as *mut T
    }

    /// Translates a pointer into pool memory back to its offset.
    pub fn offset_of<T>(&self, ptr: *const T) -> i32 {
        let offset = ptr as usize - self.data.as_ptr() as usize;
        debug_assert!(offset < self.size(), "pointer does not reference pool memory");
        offset as i32
    }

    /// Allocates storage for one `T` and returns a pointer to it.
    pub fn alloc_value<T>(&self) -> Option<NonNull<T>> {
        let offset = self.allocate(mem::size_of::<T>())?;
        NonNull::new(self.at_offset::<T>(offset))
    }

    /// Allocates storage for one `T` at a fixed offset.
    pub fn alloc_value_at<T>(&self, offset: i32) -> Option<NonNull<T>> {
        let offset = self.allocate_at(offset, mem::size_of::<T>())?;
        NonNull::new(self.at_offset::<T>(offset))
    }

    /// Allocates storage for `len` contiguous `T`s.
    pub fn alloc_array<T>(&self, len: usize) -> Option<NonNull<T>> {
        let offset = self.allocate(mem::size_of::<T>() * len)?;
        NonNull::new(self.at_offset::<T>(offset))
    }

    /// Frees the storage behind a value allocated with [`Pool::alloc_value`].
    pub fn free_value<T>(&self, ptr: *mut T) {
        self.free(self.offset_of(ptr), mem::size_of::<T>());
    }

    /// Frees the storage behind an array allocated with [`Pool::alloc_array`].
    pub fn free_array<T>(&self, ptr: *mut T, len: usize) {
        self.free(self.offset_of(ptr), mem::size_of::<T>() * len);
    }

    /// Forgets every allocation by zeroing the bitmap. Destroys all pool
    /// contents; meant for tests and cold bootstrap only.
    pub fn clear(&self) {
        let _lock = self.header().allocation_lock.guard();
        self.with_bitmap(|map| map.clear_all());
    }

    /// Removes the segment name from the system so the next process starts
    /// fresh. Existing mappings stay valid until unmapped.
    pub fn unlink(&self) -> bool {
        shm_unlink(self.name.as_str()).is_ok()
    }

    /// Removes an arbitrary segment name.
    pub fn unlink_named(name: &str) -> bool {
        shm_unlink(name).is_ok()
    }

    #[cfg(test)]
    pub(crate) fn bitmap_snapshot(&self) -> Vec<u8> {
        let _lock = self.header().allocation_lock.guard();
        self.with_bitmap(|map| map.snapshot())
    }
}
