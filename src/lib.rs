//! # Magnon - Lock-Free Shared Memory IPC Bus
//!
//! Magnon is a shared-memory inter-process communication substrate built
//! around fan-out MPMC queues: every consumer receives every message, and
//! the fast path never enters the kernel. It targets soft-real-time
//! systems (control loops, telemetry buses) where unrelated processes
//! exchange fixed-layout messages.
//!
//! ## Features
//!
//! - **Named shared memory pool**: one POSIX segment, carved into blocks
//!   by a best-fit bitmap allocator; everything addressable by offset
//! - **Lock-free queueing**: non-blocking enqueue/dequeue/peek stay in
//!   userspace; blocking variants fall back to a futex only on contention
//! - **Fan-out broadcast**: one ring per consumer with all-or-nothing
//!   delivery across the set
//! - **Named rendezvous**: queues located by name through a shared hash
//!   map at a fixed pool offset
//! - **Typed payloads**: any trivially copyable type travels by value
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                  Queue (MPMC fan-out)            │
//! │   name registry │ descriptor table │ broadcast   │
//! ├──────────────────────────────────────────────────┤
//! │  SharedHashMap          │  Ring (MPSC) per       │
//! │  (names → offsets)      │  consumer              │
//! ├──────────────────────────────────────────────────┤
//! │                  Pool (shm segment)              │
//! │   bitmap allocator │ offsets │ futex Mutex       │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use magnon::Queue;
//!
//! // Process A
//! let mut tx = magnon::Queue::<i32>::fetch("ctrl")?;
//! tx.enqueue(1);
//!
//! // Process B
//! let rx = Queue::<i32>::fetch("ctrl")?;
//! let value = rx.dequeue_blocking();
//! # Ok::<(), magnon::MagnonError>(())
//! ```

pub mod atomics;
pub mod chunk;
pub mod consts;
pub mod error;
pub mod keys;
pub mod map;
pub mod pool;
pub mod queue;
pub mod ring;
pub mod sync;

// Main API re-exports
pub use chunk::{Chunk, ChunkHandle};
pub use error::{MagnonError, Result};
pub use keys::MapKey;
pub use map::SharedHashMap;
pub use pool::{Pool, PoolConfig};
pub use queue::Queue;
pub use ring::Ring;
pub use sync::Mutex;

#[cfg(test)]
pub(crate) mod test_util {
    use std::sync::OnceLock;

    use crate::pool::{Pool, PoolConfig};

    /// The pool shared by all unit tests in this binary: a process-unique
    /// segment, unlinked immediately so nothing outlives the run, with the
    /// registry block claimed before any test can allocate over it.
    pub fn test_pool() -> &'static Pool {
        static INIT: OnceLock<&'static Pool> = OnceLock::new();
        *INIT.get_or_init(|| {
            let name = format!("/magnon_unit_{}", std::process::id());
            Pool::unlink_named(&name);
            let pool = Pool::acquire_with(PoolConfig::named(&name).with_size(1 << 20))
                .expect("test pool");
            pool.unlink();
            crate::queue::registry::bootstrap().expect("registry bootstrap");
            pool
        })
    }
}
