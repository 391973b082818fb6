// Copyright (c) the Dagmill Project Authors.
// Licensed under the MIT License.

//! Reference-counted chunk storage seam for the dagmill task-graph scheduler.
//!
//! Intermediate results of a distributed computation do not travel back to the
//! scheduler; they stay where they were produced, on some worker process, and
//! the scheduler only holds an opaque [`ChunkRef`] naming them. This crate
//! defines that handle, the [`ChunkStore`] interface through which chunks are
//! created, fetched, and released, and an in-process [`MemoryChunkStore`]
//! backend that the local worker pool and the test suites run against.
//!
//! The store is reference counted: releasing a chunk with `cache = true`
//! permits the owning worker to retain the datum in a local cache, from which
//! a later [`ChunkStore::unrelease`] call may reclaim it without a refetch.

mod chunk_ref;
mod memory;
mod osproc;
mod store;
mod value;

pub use chunk_ref::*;
pub use memory::*;
pub use osproc::*;
pub use store::*;
pub use value::*;
