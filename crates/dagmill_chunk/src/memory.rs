// Copyright (c) the Dagmill Project Authors.
// Licensed under the MIT License.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::{ChunkError, ChunkRef, ChunkStore, OsProc, Value};

/// In-process chunk store backing the local worker pool.
///
/// One instance plays the role of every worker's store at once; the owner
/// recorded on each chunk keeps the per-worker bookkeeping honest. Releasing
/// the last reference with `cache = true` moves the datum into a cache from
/// which [`unrelease`][ChunkStore::unrelease] can revive it.
/// [`drop_worker`][Self::drop_worker] removes everything a worker owned, live
/// and cached alike, simulating the data loss of a real process death.
#[derive(Debug, Default)]
pub struct MemoryChunkStore {
    next_id: AtomicU64,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    live: HashMap<u64, Slot>,
    cached: HashMap<u64, Slot>,
}

#[derive(Debug)]
struct Slot {
    value: Value,
    owner: OsProc,
    persist: bool,
    refs: u32,
}

impl MemoryChunkStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes every chunk `proc` owns, live and cached. This is what a
    /// worker death looks like from the store's point of view.
    pub fn drop_worker(&self, proc: OsProc) {
        let mut inner = self.inner.lock();
        inner.live.retain(|_, slot| slot.owner != proc);
        inner.cached.retain(|_, slot| slot.owner != proc);
    }

    /// Number of live chunks.
    #[must_use]
    pub fn live_len(&self) -> usize {
        self.inner.lock().live.len()
    }

    /// Number of released-but-cached chunks.
    #[must_use]
    pub fn cached_len(&self) -> usize {
        self.inner.lock().cached.len()
    }
}

impl ChunkStore for MemoryChunkStore {
    async fn put(&self, owner: OsProc, value: Value, persist: bool) -> ChunkRef {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Slot {
            value,
            owner,
            persist,
            refs: 1,
        };
        self.inner.lock().live.insert(id, slot);
        ChunkRef::new(id, owner)
    }

    async fn materialize(&self, chunk: &ChunkRef) -> Result<Value, ChunkError> {
        self.inner
            .lock()
            .live
            .get(&chunk.id())
            .map(|slot| slot.value.clone())
            .ok_or(ChunkError::Missing { id: chunk.id() })
    }

    async fn free(&self, chunk: &ChunkRef, force: bool, cache: bool) {
        let mut inner = self.inner.lock();

        if force {
            inner.live.remove(&chunk.id());
            inner.cached.remove(&chunk.id());
            return;
        }

        let evict = {
            let Some(slot) = inner.live.get_mut(&chunk.id()) else {
                return;
            };
            slot.refs = slot.refs.saturating_sub(1);
            // Persistent chunks stay live with zero references.
            slot.refs == 0 && !slot.persist
        };

        if evict
            && let Some(slot) = inner.live.remove(&chunk.id())
            && cache
        {
            inner.cached.insert(chunk.id(), slot);
        }
    }

    async fn unrelease(&self, chunk: &ChunkRef) -> Option<Value> {
        let mut inner = self.inner.lock();

        if let Some(slot) = inner.live.get(&chunk.id()) {
            return Some(slot.value.clone());
        }

        // Revive from the owner's cache: live again, one reference.
        let mut slot = inner.cached.remove(&chunk.id())?;
        slot.refs = 1;
        let value = slot.value.clone();
        inner.live.insert(chunk.id(), slot);
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;
    use pretty_assertions::assert_eq;

    use super::*;

    const W1: OsProc = OsProc::new(1);
    const W2: OsProc = OsProc::new(2);

    fn put(store: &MemoryChunkStore, value: i32) -> ChunkRef {
        block_on(store.put(W1, Value::new(value), false))
    }

    #[test]
    fn put_then_materialize() {
        let store = MemoryChunkStore::new();
        let chunk = put(&store, 42);

        let value = block_on(store.materialize(&chunk)).unwrap();
        assert_eq!(value.get::<i32>(), Some(42));
        assert_eq!(chunk.owner(), W1);
    }

    #[test]
    fn free_evicts_last_reference() {
        let store = MemoryChunkStore::new();
        let chunk = put(&store, 1);

        block_on(store.free(&chunk, false, false));

        assert!(block_on(store.materialize(&chunk)).is_err());
        assert_eq!(store.cached_len(), 0);
    }

    #[test]
    fn free_with_cache_keeps_datum_reclaimable() {
        let store = MemoryChunkStore::new();
        let chunk = put(&store, 7);

        block_on(store.free(&chunk, false, true));
        assert!(block_on(store.materialize(&chunk)).is_err());

        let revived = block_on(store.unrelease(&chunk)).unwrap();
        assert_eq!(revived.get::<i32>(), Some(7));

        // Revived means live again: materialize works, and a further free
        // evicts it for good.
        assert!(block_on(store.materialize(&chunk)).is_ok());
        block_on(store.free(&chunk, false, false));
        assert_eq!(block_on(store.unrelease(&chunk)), None);
    }

    #[test]
    fn unrelease_after_plain_free_is_none() {
        let store = MemoryChunkStore::new();
        let chunk = put(&store, 7);

        block_on(store.free(&chunk, false, false));

        assert_eq!(block_on(store.unrelease(&chunk)), None);
    }

    #[test]
    fn persist_survives_release() {
        let store = MemoryChunkStore::new();
        let chunk = block_on(store.put(W1, Value::new(9), true));

        block_on(store.free(&chunk, false, false));
        assert!(block_on(store.materialize(&chunk)).is_ok());

        // Only a forced free removes a persistent chunk.
        block_on(store.free(&chunk, true, false));
        assert!(block_on(store.materialize(&chunk)).is_err());
    }

    #[test]
    fn drop_worker_loses_live_and_cached_chunks() {
        let store = MemoryChunkStore::new();
        let lost_live = put(&store, 1);
        let lost_cached = put(&store, 2);
        let kept = block_on(store.put(W2, Value::new(3), false));
        block_on(store.free(&lost_cached, false, true));

        store.drop_worker(W1);

        assert!(block_on(store.materialize(&lost_live)).is_err());
        assert_eq!(block_on(store.unrelease(&lost_cached)), None);
        assert!(block_on(store.materialize(&kept)).is_ok());
    }
}
