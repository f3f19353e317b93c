//! The queue name registry: a shared map from names to queue-header
//! offsets, living at a fixed pool offset so every process can find it.
//!
//! The registry's block is claimed by placement allocation the first time
//! any process fetches a queue by name. That block must still be free at
//! that point, so a process mixing named queues with direct pool
//! allocation should perform its first fetch early.

use crate::consts::{NAME_MAP_BUCKETS, NAME_MAP_OFFSET};
use crate::error::Result;
use crate::map::SharedHashMap;
use crate::queue::Queue;

fn name_map<'a>() -> Result<SharedHashMap<&'a str, i32>> {
    SharedHashMap::new(NAME_MAP_OFFSET, NAME_MAP_BUCKETS)
}

/// Claims the registry's pool storage without fetching anything.
#[cfg(test)]
pub(crate) fn bootstrap() -> Result<()> {
    name_map().map(|_| ())
}

/// Looks `name` up in the registry; attaches to the queue on a hit,
/// creates and registers a queue of `capacity` items per ring on a miss.
pub(crate) fn fetch_queue<T: Copy>(name: &str, consumer: bool, capacity: u32) -> Result<Queue<T>> {
    let names = name_map()?;

    if let Some(offset) = names.get(&name) {
        return Queue::load(consumer, offset);
    }

    let queue = Queue::create(consumer, capacity)?;
    names.insert_or_set(&name, queue.offset())?;
    Ok(queue)
}
