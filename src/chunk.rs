//! An example payload that rides on the fan-out queue: a pair of float
//! arrays (values and their gradients) too large to embed in a ring slot.
//!
//! What actually travels through the queue is a small [`ChunkHandle`]
//! descriptor; the arrays themselves are copied into pool storage on
//! enqueue and back out on dequeue. The receiver frees the pool copies, so
//! this transport assumes a single consumer per handle. The module is a
//! plain client of the queue API and touches no ring internals.

use std::ptr;

use crate::error::{MagnonError, Result};
use crate::pool::Pool;
use crate::queue::Queue;

/// The trivially copyable descriptor sent through a `Queue<ChunkHandle>`.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ChunkHandle {
    data_offset: i32,
    gradients_offset: i32,
    len: u32,
}

/// A block of float data with per-element gradients, owned process-locally.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    data: Vec<f32>,
    gradients: Vec<f32>,
}

impl Chunk {
    /// Creates a zeroed chunk of `len` elements.
    pub fn new(len: usize) -> Self {
        Self {
            data: vec![0.0; len],
            gradients: vec![0.0; len],
        }
    }

    /// Creates a chunk initialized from the given arrays, which must have
    /// equal lengths.
    pub fn from_parts(data: &[f32], gradients: &[f32]) -> Self {
        assert_eq!(data.len(), gradients.len(), "data/gradient length mismatch");
        Self {
            data: data.to_vec(),
            gradients: gradients.to_vec(),
        }
    }

    /// Number of elements (not bytes).
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the chunk holds no elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The values.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// The gradients.
    pub fn gradients(&self) -> &[f32] {
        &self.gradients
    }

    /// Overwrites both arrays. Lengths must match the chunk's.
    pub fn set_value(&mut self, data: &[f32], gradients: &[f32]) {
        assert_eq!(data.len(), self.data.len(), "data length mismatch");
        assert_eq!(gradients.len(), self.gradients.len(), "gradient length mismatch");
        self.data.copy_from_slice(data);
        self.gradients.copy_from_slice(gradients);
    }

    /// Byte length of the serialized form: a length word plus both arrays.
    pub fn serialized_len(&self) -> usize {
        4 + self.len() * 8
    }

    /// Serializes to a byte buffer for off-host transport. Big-endian
    /// length, then the values, then the gradients, each as bit-exact
    /// 32-bit words.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(self.serialized_len());
        buffer.extend_from_slice(&(self.len() as u32).to_be_bytes());
        for value in &self.data {
            buffer.extend_from_slice(&value.to_bits().to_be_bytes());
        }
        for gradient in &self.gradients {
            buffer.extend_from_slice(&gradient.to_bits().to_be_bytes());
        }
        buffer
    }

    /// Rebuilds a chunk from its serialized form. Returns `None` when the
    /// buffer is truncated.
    pub fn deserialize(buffer: &[u8]) -> Option<Self> {
        let len = u32::from_be_bytes(buffer.get(..4)?.try_into().ok()?) as usize;
        if buffer.len() < 4 + len * 8 {
            return None;
        }

        let word = |index: usize| {
            let at = 4 + index * 4;
            f32::from_bits(u32::from_be_bytes(buffer[at..at + 4].try_into().unwrap()))
        };
        Some(Self {
            data: (0..len).map(word).collect(),
            gradients: (len..2 * len).map(word).collect(),
        })
    }

    /// Copies the arrays into the pool and broadcasts a handle to them.
    /// Returns `Ok(false)` (with the copies released) when the queue is
    /// full or has no consumers.
    pub fn enqueue(&self, queue: &mut Queue<ChunkHandle>) -> Result<bool> {
        let pool = Pool::acquire()?;
        let handle = self.stage(pool)?;
        if queue.enqueue(handle) {
            Ok(true)
        } else {
            release(pool, &handle);
            Ok(false)
        }
    }

    /// Like [`Chunk::enqueue`], waiting for ring space. Returns `Ok(false)`
    /// only when the queue has no consumers.
    pub fn enqueue_blocking(&self, queue: &mut Queue<ChunkHandle>) -> Result<bool> {
        let pool = Pool::acquire()?;
        let handle = self.stage(pool)?;
        if queue.enqueue_blocking(handle) {
            Ok(true)
        } else {
            release(pool, &handle);
            Ok(false)
        }
    }

    /// Receives the next chunk from the queue into `self`, releasing its
    /// pool copies. Returns false when the queue is empty.
    pub fn dequeue(&mut self, queue: &Queue<ChunkHandle>) -> Result<bool> {
        match queue.dequeue() {
            Some(handle) => {
                self.unstage(Pool::acquire()?, &handle);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Like [`Chunk::dequeue`], waiting for a chunk if the queue is empty.
    pub fn dequeue_blocking(&mut self, queue: &Queue<ChunkHandle>) -> Result<()> {
        let handle = queue.dequeue_blocking();
        self.unstage(Pool::acquire()?, &handle);
        Ok(())
    }

    fn stage(&self, pool: &Pool) -> Result<ChunkHandle> {
        let bytes = self.len() * 4;
        let data_offset = pool
            .allocate(bytes)
            .ok_or(MagnonError::out_of_pool(bytes))?;
        let gradients_offset = match pool.allocate(bytes) {
            Some(offset) => offset,
            None => {
                pool.free(data_offset, bytes);
                return Err(MagnonError::out_of_pool(bytes));
            }
        };

        unsafe {
            ptr::copy_nonoverlapping(
                self.data.as_ptr(),
                pool.at_offset::<f32>(data_offset),
                self.len(),
            );
            ptr::copy_nonoverlapping(
                self.gradients.as_ptr(),
                pool.at_offset::<f32>(gradients_offset),
                self.len(),
            );
        }

        Ok(ChunkHandle {
            data_offset,
            gradients_offset,
            len: self.len() as u32,
        })
    }

    fn unstage(&mut self, pool: &Pool, handle: &ChunkHandle) {
        let len = handle.len as usize;
        self.data.resize(len, 0.0);
        self.gradients.resize(len, 0.0);

        unsafe {
            ptr::copy_nonoverlapping(
                pool.at_offset::<f32>(handle.data_offset),
                self.data.as_mut_ptr(),
                len,
            );
            ptr::copy_nonoverlapping(
                pool.at_offset::<f32>(handle.gradients_offset),
                self.gradients.as_mut_ptr(),
                len,
            );
        }
        release(pool, handle);
    }
}

fn release(pool: &Pool, handle: &ChunkHandle) {
    let bytes = handle.len as usize * 4;
    pool.free(handle.data_offset, bytes);
    pool.free(handle.gradients_offset, bytes);
}
