// Copyright (c) the Dagmill Project Authors.
// Licensed under the MIT License.

use dagmill_chunk::ChunkError;
use thiserror::Error;

use crate::thunk::{TaskError, ThunkId};

/// A specialized `Result` type for scheduler operations that return an
/// [`Error`][enum@Error] on failure.
pub type Result<T> = std::result::Result<T, Error>;

/// An error surfaced to the caller of
/// [`compute_dag`][crate::Scheduler::compute_dag].
///
/// Worker deaths are not represented here: they are recovered internally by
/// replanning the affected subgraph onto the surviving workers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The halt flag was set - by a dynamic task sending `halt`, or by the
    /// scheduler itself after an invalid control message or a broken
    /// internal invariant.
    #[error("scheduler halted")]
    Halted,

    /// The processor list was empty at start, or every worker died before
    /// the graph could finish. Retrying on an empty pool would deadlock, so
    /// this fails fast instead.
    #[error("no live workers remain")]
    NoWorkers,

    /// A task function failed. The failure is not retriable; the run is
    /// aborted and the task's own error is carried here.
    #[error("task {id} failed: {reason}")]
    TaskFailed {
        /// The failing thunk.
        id: ThunkId,
        /// The error the task function (or its invocation wrapper) produced.
        reason: TaskError,
    },

    /// A chunk store operation failed.
    #[error(transparent)]
    Chunk(#[from] ChunkError),

    /// An internal scheduler channel closed unexpectedly.
    #[error("scheduler channel closed")]
    ChannelClosed,
}
