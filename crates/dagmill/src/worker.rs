// Copyright (c) the Dagmill Project Authors.
// Licensed under the MIT License.

use std::fmt;

use dagmill_chunk::{ChunkRef, OsProc, Value};
use thiserror::Error;

use crate::handle::SchedulerHandle;
use crate::options::{ProcKind, ThunkOptions};
use crate::thunk::{TaskError, TaskFn, ThunkId};

/// One positional argument of a remote task invocation, as it travels to the
/// worker: either a handle the worker materializes locally or an immediate
/// value shipped with the request.
#[derive(Clone, Debug)]
pub enum TaskArg {
    /// Fetch the datum behind this handle before invoking the function.
    Chunk(ChunkRef),
    /// Use the value as-is.
    Immediate(Value),
}

/// Everything a worker needs to run one thunk.
pub struct TaskRequest {
    /// The thunk being executed, for the completion record.
    pub thunk: ThunkId,

    /// The task function.
    pub f: TaskFn,

    /// Arguments, in declaration order.
    pub args: Vec<TaskArg>,

    /// When set, the worker sends the raw result value back instead of
    /// wrapping it in a chunk.
    pub send_result: bool,

    /// The new result chunk is never evicted.
    pub persist: bool,

    /// The new result chunk may be retained in the worker's local cache
    /// after release.
    pub cache: bool,

    /// Merged scheduler and thunk options.
    pub options: ThunkOptions,

    /// Control-channel capability, present for dynamic thunks. The worker
    /// hands it to the task function.
    pub handle: Option<SchedulerHandle>,
}

impl fmt::Debug for TaskRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRequest")
            .field("thunk", &self.thunk)
            .field("args", &self.args.len())
            .field("send_result", &self.send_result)
            .field("persist", &self.persist)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

/// A finished task's payload: the raw value when the request asked for it,
/// otherwise a handle to the freshly stored result chunk.
#[derive(Clone, Debug)]
pub enum TaskPayload {
    /// The raw result value.
    Value(Value),
    /// A handle to the result, stored on the executing worker.
    Chunk(ChunkRef),
}

/// Why a remote invocation produced no payload.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkerFailure {
    /// The worker process exited. Retriable: the scheduler removes the
    /// worker and replans the affected subgraph onto survivors.
    #[error("worker {proc} exited")]
    Exited {
        /// The dead worker.
        proc: OsProc,
    },

    /// The task itself raised, or its inputs could not be materialized.
    /// Fatal: surfaced to the caller unchanged.
    #[error("task failed on {proc}: {reason}")]
    Failed {
        /// The worker the task ran on.
        proc: OsProc,
        /// The underlying error.
        reason: TaskError,
    },
}

/// One record on the completion channel: which worker reports, for which
/// thunk, with what outcome.
#[derive(Debug)]
pub(crate) struct Completion {
    pub from: OsProc,
    pub thunk: ThunkId,
    pub outcome: Result<TaskPayload, WorkerFailure>,
}

/// The remote-procedure seam between the scheduler and a pool of workers.
///
/// The scheduler never sees how a worker runs a thunk; it fires a
/// [`TaskRequest`] at a named [`OsProc`] and eventually receives the
/// outcome. Implementations are expected to be internally synchronized -
/// the scheduler invokes `do_task` from one spawned task per in-flight
/// dispatch.
#[trait_variant::make(WorkerRuntime: Send)]
pub trait LocalWorkerRuntime {
    /// Runs one thunk on worker `proc`: materializes chunk arguments,
    /// selects a concrete processor within the host, invokes the task
    /// function, and either returns the raw value or stores the result as a
    /// new chunk owned by `proc`.
    ///
    /// A death of the worker process surfaces as
    /// [`WorkerFailure::Exited`]; any other failure - materialization,
    /// processor selection, the task function itself - as
    /// [`WorkerFailure::Failed`].
    async fn do_task(&self, proc: OsProc, request: TaskRequest)
    -> Result<TaskPayload, WorkerFailure>;
}

/// Picks the concrete processor within a worker host: the first available
/// class permitted by the merged options (any class, when `proctypes` is
/// empty).
///
/// This runs on the worker, not the scheduler - the scheduler only picks
/// the host.
#[must_use]
pub fn choose_processor(available: &[ProcKind], options: &ThunkOptions) -> Option<ProcKind> {
    if options.proctypes.is_empty() {
        return available.first().copied();
    }

    available
        .iter()
        .copied()
        .find(|kind| options.proctypes.contains(kind))
}
