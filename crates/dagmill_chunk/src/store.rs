// Copyright (c) the Dagmill Project Authors.
// Licensed under the MIT License.

use thiserror::Error;

use crate::{ChunkRef, OsProc, Value};

/// An error originating in a chunk store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ChunkError {
    /// The referenced chunk no longer exists anywhere - not live, not in the
    /// owner's local cache. This happens after a release, or after the owning
    /// worker died.
    #[error("chunk {id} is gone")]
    Missing {
        /// The store-assigned chunk id.
        id: u64,
    },
}

/// The storage interface the scheduler and the workers program against.
///
/// A store admits a datum on behalf of an owning worker ([`put`][Self::put]),
/// fetches it for consumers ([`materialize`][Self::materialize]), and releases
/// it when the scheduler decides every consumer is done
/// ([`free`][Self::free]). Releasing with `cache = true` is a request, not an
/// order: the owner may keep the datum in a local cache, from which
/// [`unrelease`][Self::unrelease] can reclaim it later without a refetch.
///
/// Implementations are expected to be internally synchronized; the scheduler
/// calls these methods from multiple concurrent tasks.
#[trait_variant::make(ChunkStore: Send)]
pub trait LocalChunkStore {
    /// Admits `value` into the store on behalf of `owner`, returning the
    /// handle. The store holds one reference on the scheduler's behalf.
    ///
    /// A `persist` chunk is never evicted by a plain release; only a forced
    /// free removes it.
    async fn put(&self, owner: OsProc, value: Value, persist: bool) -> ChunkRef;

    /// Fetches the datum behind `chunk`.
    async fn materialize(&self, chunk: &ChunkRef) -> Result<Value, ChunkError>;

    /// Drops the scheduler's reference on `chunk`. When the last reference
    /// goes, the datum is evicted - unless it is persistent (and `force` is
    /// not set), or `cache` is set, in which case the owner may retain it in
    /// its local cache.
    async fn free(&self, chunk: &ChunkRef, force: bool, cache: bool);

    /// Attempts to revive a previously released chunk from the owner's local
    /// cache. On success the chunk is live again, holding one reference, and
    /// the datum is returned. `None` means the data is gone and must be
    /// recomputed.
    async fn unrelease(&self, chunk: &ChunkRef) -> Option<Value>;
}
