// Copyright (c) the Dagmill Project Authors.
// Licensed under the MIT License.

use dagmill_chunk::OsProc;

/// A class of processor within a worker host.
///
/// The scheduler picks the host; the worker picks the concrete processor
/// within it, constrained by the `proctypes` of the merged options (see
/// [`choose_processor`][crate::choose_processor]).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProcKind {
    /// A general-purpose CPU thread.
    Cpu,
    /// A GPU execution stream.
    Gpu,
}

/// Run-wide scheduling options, set on the [`Scheduler`][crate::Scheduler].
#[derive(Clone, Debug, Default)]
pub struct SchedulerOptions {
    /// Confine every dispatch to this worker. Thunk-local `single` takes
    /// precedence when set.
    pub single: Option<OsProc>,

    /// Processor classes eligible to run task functions. Empty means any.
    pub proctypes: Vec<ProcKind>,
}

/// Per-thunk scheduling options, set through the
/// [`ThunkBuilder`][crate::ThunkBuilder].
#[derive(Clone, Debug, Default)]
pub struct ThunkOptions {
    /// Run this thunk on exactly this worker.
    pub single: Option<OsProc>,

    /// Processor classes eligible for this thunk. Empty means any.
    pub proctypes: Vec<ProcKind>,
}

impl SchedulerOptions {
    /// Merges scheduler-wide options with a thunk's own: the thunk-local
    /// `single` wins when set, and `proctypes` are concatenated.
    #[must_use]
    pub fn merge(&self, thunk: &ThunkOptions) -> ThunkOptions {
        ThunkOptions {
            single: thunk.single.or(self.single),
            proctypes: self
                .proctypes
                .iter()
                .chain(&thunk.proctypes)
                .copied()
                .collect(),
        }
    }
}
