// Copyright (c) the Dagmill Project Authors.
// Licensed under the MIT License.

//! A distributed task-graph scheduler.
//!
//! Dagmill takes a directed acyclic graph of deferred computations
//! ([`Thunk`]s), dispatches them across a pool of worker processes in
//! dependency order, moves intermediate results around as reference-counted
//! chunks, recovers from worker deaths mid-run, and returns the root result.
//!
//! The scheduler is a single logical controller: one main loop that
//! alternately fires ready thunks onto workers and drains a completion
//! channel, plus one background listener per worker for the dynamic control
//! channel that running tasks use to talk back (see [`SchedulerHandle`]).
//!
//! The seams to the outside world are traits: [`WorkerRuntime`] executes a
//! single thunk on a named worker process, and
//! [`ChunkStore`][dagmill_chunk::ChunkStore] holds intermediate results.
//! The `test-util` feature ships an in-process implementation of both
//! ([`testing::LocalWorkerPool`]) so whole graphs can run inside one process.

// Public API surface.
mod error;
mod handle;
mod options;
mod scheduler;
mod thunk;
mod worker;

pub use error::*;
pub use handle::*;
pub use options::*;
pub use scheduler::*;
pub use thunk::*;
pub use worker::*;

// The storage seam is a separate crate; re-export the pieces task authors touch.
pub use dagmill_chunk::{ChunkError, ChunkRef, ChunkStore, OsProc, Value};

// Internal to the crate.
mod completion;
mod dag;
mod dispatch;
mod fault;
mod ready;
mod state;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;
