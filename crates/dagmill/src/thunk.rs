// Copyright (c) the Dagmill Project Authors.
// Licensed under the MIT License.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dagmill_chunk::{ChunkRef, Value};
use parking_lot::Mutex;
use thiserror::Error;

use crate::handle::SchedulerHandle;
use crate::options::ThunkOptions;

/// Process-global unique id of a thunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThunkId(u64);

impl ThunkId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw id, as it appears on the wire and in
    /// [`dag_ids`][crate::SchedulerHandle::dag_ids] maps.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thunk:{}", self.0)
    }
}

/// The error type task functions return. Anything goes; the scheduler only
/// carries it back to the caller.
pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

/// The signature of a task function: materialized arguments in, one
/// [`Value`] out.
pub type TaskFn = Arc<dyn Fn(TaskInvocation) -> Result<Value, TaskError> + Send + Sync>;

#[derive(Debug, Error)]
#[error("argument {index}: {problem}")]
struct ArgError {
    index: usize,
    problem: &'static str,
}

/// What a task function receives when invoked on a worker (or, for meta
/// thunks, in the scheduler process).
#[derive(Debug)]
pub struct TaskInvocation {
    /// The thunk's inputs, fully materialized, in declaration order.
    pub args: Vec<Value>,

    /// Present iff the thunk was built with
    /// [`dynamic`][crate::ThunkBuilder::dynamic].
    pub handle: Option<SchedulerHandle>,
}

impl TaskInvocation {
    /// Borrows argument `index` as `T`.
    pub fn arg<T>(&self, index: usize) -> Result<&T, TaskError>
    where
        T: 'static,
    {
        let value = self.args.get(index).ok_or(ArgError {
            index,
            problem: "missing",
        })?;
        Ok(value.downcast_ref::<T>().ok_or(ArgError {
            index,
            problem: "unexpected type",
        })?)
    }

    /// Borrows the scheduler handle of a dynamic thunk.
    pub fn handle(&self) -> Result<&SchedulerHandle, TaskError> {
        Ok(self.handle.as_ref().ok_or(ArgError {
            index: 0,
            problem: "no scheduler handle (thunk is not dynamic)",
        })?)
    }
}

/// One input of a thunk.
#[derive(Clone, Debug)]
pub enum ThunkInput {
    /// The (future) result of another thunk.
    Thunk(Arc<Thunk>),
    /// A chunk that already exists on some worker.
    Chunk(ChunkRef),
    /// An immediate value, shipped with the task request.
    Immediate(Value),
}

impl From<Arc<Thunk>> for ThunkInput {
    fn from(thunk: Arc<Thunk>) -> Self {
        Self::Thunk(thunk)
    }
}

impl From<ChunkRef> for ThunkInput {
    fn from(chunk: ChunkRef) -> Self {
        Self::Chunk(chunk)
    }
}

impl From<Value> for ThunkInput {
    fn from(value: Value) -> Self {
        Self::Immediate(value)
    }
}

/// A deferred computation: a node in the task graph.
///
/// Thunks are built with [`delayed`] / [`ThunkBuilder`] and handed to
/// [`compute_dag`][crate::Scheduler::compute_dag] as a graph root. Each
/// thunk is fired at most once per run, on a worker chosen by affinity to
/// where its input chunks live.
pub struct Thunk {
    id: ThunkId,
    f: TaskFn,
    inputs: Vec<ThunkInput>,
    cache: bool,
    persist: bool,
    meta: bool,
    dynamic: bool,
    get_result: bool,
    options: ThunkOptions,

    // Last known chunk holding this thunk's result, retained across runs
    // when `cache` is set so a re-run can reclaim it without recomputing.
    cache_ref: Mutex<Option<ChunkRef>>,
}

impl Thunk {
    /// The thunk's unique id.
    #[must_use]
    pub fn id(&self) -> ThunkId {
        self.id
    }

    /// The inputs, in the order the task function receives them.
    #[must_use]
    pub fn inputs(&self) -> &[ThunkInput] {
        &self.inputs
    }

    /// Whether the result is retained in the owning worker's cache after
    /// release, for reclamation by a later run.
    #[must_use]
    pub fn cache(&self) -> bool {
        self.cache
    }

    /// Whether the result chunk is never evicted.
    #[must_use]
    pub fn persist(&self) -> bool {
        self.persist
    }

    /// Whether the thunk executes in the scheduler process instead of being
    /// dispatched to a worker.
    #[must_use]
    pub fn meta(&self) -> bool {
        self.meta
    }

    /// Whether the task function receives a [`SchedulerHandle`].
    #[must_use]
    pub fn dynamic(&self) -> bool {
        self.dynamic
    }

    /// Whether the raw value is sent back to the scheduler instead of being
    /// wrapped in a chunk on the worker.
    #[must_use]
    pub fn get_result(&self) -> bool {
        self.get_result
    }

    /// The thunk's scheduling options.
    #[must_use]
    pub fn options(&self) -> &ThunkOptions {
        &self.options
    }

    /// The last known chunk holding this thunk's result, if any.
    #[must_use]
    pub fn cache_ref(&self) -> Option<ChunkRef> {
        self.cache_ref.lock().clone()
    }

    pub(crate) fn set_cache_ref(&self, chunk: ChunkRef) {
        *self.cache_ref.lock() = Some(chunk);
    }

    pub(crate) fn clear_cache_ref(&self) {
        *self.cache_ref.lock() = None;
    }

    pub(crate) fn func(&self) -> TaskFn {
        Arc::clone(&self.f)
    }

    /// The subset of inputs that are thunks.
    pub(crate) fn thunk_inputs(&self) -> impl Iterator<Item = &Arc<Thunk>> {
        self.inputs.iter().filter_map(|input| match input {
            ThunkInput::Thunk(thunk) => Some(thunk),
            ThunkInput::Chunk(_) | ThunkInput::Immediate(_) => None,
        })
    }
}

impl fmt::Debug for Thunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thunk")
            .field("id", &self.id)
            .field("inputs", &self.inputs.len())
            .field("cache", &self.cache)
            .field("persist", &self.persist)
            .field("meta", &self.meta)
            .field("dynamic", &self.dynamic)
            .field("get_result", &self.get_result)
            .finish_non_exhaustive()
    }
}

/// Starts building a thunk around a task function.
///
/// ```
/// use dagmill::{Value, delayed};
///
/// let a = delayed(|_| Ok(Value::new(1_i64))).build();
/// let b = delayed(|inv| Ok(Value::new(inv.arg::<i64>(0)? + 1)))
///     .input(a)
///     .build();
/// assert_eq!(b.inputs().len(), 1);
/// ```
pub fn delayed<F>(f: F) -> ThunkBuilder
where
    F: Fn(TaskInvocation) -> Result<Value, TaskError> + Send + Sync + 'static,
{
    ThunkBuilder {
        f: Arc::new(f),
        inputs: Vec::new(),
        cache: false,
        persist: false,
        meta: false,
        dynamic: false,
        get_result: false,
        options: ThunkOptions::default(),
    }
}

/// Builder for [`Thunk`]s. Created by [`delayed`].
pub struct ThunkBuilder {
    f: TaskFn,
    inputs: Vec<ThunkInput>,
    cache: bool,
    persist: bool,
    meta: bool,
    dynamic: bool,
    get_result: bool,
    options: ThunkOptions,
}

impl ThunkBuilder {
    /// Appends one input.
    #[must_use]
    pub fn input(mut self, input: impl Into<ThunkInput>) -> Self {
        self.inputs.push(input.into());
        self
    }

    /// Appends several inputs.
    #[must_use]
    pub fn inputs<I>(mut self, inputs: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<ThunkInput>,
    {
        self.inputs.extend(inputs.into_iter().map(Into::into));
        self
    }

    /// Retain the result in the owner's cache after release, so a later run
    /// of the same graph can reclaim it without recomputing.
    #[must_use]
    pub fn cache(mut self, cache: bool) -> Self {
        self.cache = cache;
        self
    }

    /// Never evict the result chunk.
    #[must_use]
    pub fn persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    /// Execute in the scheduler process, skipping the worker round-trip.
    #[must_use]
    pub fn meta(mut self, meta: bool) -> Self {
        self.meta = meta;
        self
    }

    /// Pass a [`SchedulerHandle`] to the task function, letting it query and
    /// command the scheduler while running.
    #[must_use]
    pub fn dynamic(mut self, dynamic: bool) -> Self {
        self.dynamic = dynamic;
        self
    }

    /// Send the raw result value back to the scheduler instead of wrapping
    /// it in a chunk on the worker.
    #[must_use]
    pub fn get_result(mut self, get_result: bool) -> Self {
        self.get_result = get_result;
        self
    }

    /// Sets the thunk's scheduling options.
    #[must_use]
    pub fn options(mut self, options: ThunkOptions) -> Self {
        self.options = options;
        self
    }

    /// Finishes the thunk.
    #[must_use]
    pub fn build(self) -> Arc<Thunk> {
        Arc::new(Thunk {
            id: ThunkId::next(),
            f: self.f,
            inputs: self.inputs,
            cache: self.cache,
            persist: self.persist,
            meta: self.meta,
            dynamic: self.dynamic,
            get_result: self.get_result,
            options: self.options,
            cache_ref: Mutex::new(None),
        })
    }
}

impl fmt::Debug for ThunkBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThunkBuilder")
            .field("inputs", &self.inputs.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn noop() -> ThunkBuilder {
        delayed(|_| Ok(Value::new(())))
    }

    #[test]
    fn ids_are_unique() {
        let a = noop().build();
        let b = noop().build();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn builder_sets_flags() {
        let thunk = noop()
            .cache(true)
            .persist(true)
            .meta(true)
            .dynamic(true)
            .get_result(true)
            .build();

        assert!(thunk.cache());
        assert!(thunk.persist());
        assert!(thunk.meta());
        assert!(thunk.dynamic());
        assert!(thunk.get_result());
    }

    #[test]
    fn thunk_inputs_filters_non_thunks() {
        let a = noop().build();
        let thunk = noop()
            .input(Arc::clone(&a))
            .input(Value::new(5_i64))
            .build();

        let ids: Vec<_> = thunk.thunk_inputs().map(|t| t.id()).collect();
        assert_eq!(ids, vec![a.id()]);
    }

    #[test]
    fn invocation_arg_downcasts() {
        let inv = TaskInvocation {
            args: vec![Value::new(7_i64)],
            handle: None,
        };

        assert_eq!(inv.arg::<i64>(0).copied().unwrap(), 7);
        assert!(inv.arg::<String>(0).is_err());
        assert!(inv.arg::<i64>(1).is_err());
        assert!(inv.handle().is_err());
    }

    #[test]
    fn cache_ref_roundtrip() {
        use dagmill_chunk::{ChunkRef, OsProc};

        let thunk = noop().build();
        assert_eq!(thunk.cache_ref(), None);

        let chunk = ChunkRef::new(1, OsProc::new(1));
        thunk.set_cache_ref(chunk.clone());
        assert_eq!(thunk.cache_ref(), Some(chunk));

        thunk.clear_cache_ref();
        assert_eq!(thunk.cache_ref(), None);
    }
}
