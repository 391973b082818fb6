// Copyright (c) the Dagmill Project Authors.
// Licensed under the MIT License.

use std::fmt;
use std::sync::Arc;

use async_channel::Receiver;
use dagmill_chunk::{ChunkStore, OsProc, Value};
use parking_lot::Mutex;
use tracing::{Instrument, Level, event, span};

use crate::dag::DagInfo;
use crate::error::{Error, Result};
use crate::handle::run_listener;
use crate::options::SchedulerOptions;
use crate::state::{CacheEntry, ComputeState, WorkerChannels};
use crate::thunk::Thunk;
use crate::worker::{Completion, WorkerFailure, WorkerRuntime};
use crate::{completion, dispatch, fault};

/// Everything one `compute_dag` run shares between the main loop, the
/// per-worker listeners, and the spawned dispatch tasks.
pub(crate) struct Run<R, C> {
    pub runtime: Arc<R>,
    pub store: Arc<C>,
    pub options: SchedulerOptions,
    pub dag: DagInfo,
    pub state: Mutex<ComputeState>,
    pub completion_tx: async_channel::Sender<Completion>,
    pub halt_tx: async_channel::Sender<()>,
}

impl<R, C> Run<R, C> {
    /// Sets the halt flag and wakes the main loop if it is blocked on the
    /// completion channel.
    #[cfg_attr(test, mutants::skip)] // Halt tests hang if the wake-up is mutated away.
    pub fn request_halt(&self) {
        self.state.lock().halt = true;
        _ = self.halt_tx.try_send(());
    }
}

#[cfg(test)]
impl<R, C> Run<R, C> {
    pub(crate) fn for_tests(
        runtime: Arc<R>,
        store: Arc<C>,
        dag: DagInfo,
        state: ComputeState,
    ) -> Arc<Self> {
        let (completion_tx, _completion_rx) = async_channel::unbounded();
        let (halt_tx, _halt_rx) = async_channel::bounded(1);
        Arc::new(Self {
            runtime,
            store,
            options: SchedulerOptions::default(),
            dag,
            state: Mutex::new(state),
            completion_tx,
            halt_tx,
        })
    }
}

/// The task-graph scheduler: a worker runtime, a chunk store, a pool of
/// worker processes, and run-wide options.
///
/// Built with [`Scheduler::builder`]; one instance runs any number of
/// graphs, sequentially, through
/// [`compute_dag`][Self::compute_dag]. State is per-run - only thunk
/// `cache_ref`s survive from one run to the next.
pub struct Scheduler<R, C> {
    runtime: Arc<R>,
    store: Arc<C>,
    procs: Vec<OsProc>,
    options: SchedulerOptions,
}

impl<R, C> Scheduler<R, C> {
    /// Starts building a scheduler around a worker runtime and the chunk
    /// store its workers share with the scheduler.
    pub fn builder(runtime: Arc<R>, store: Arc<C>) -> SchedulerBuilder<R, C> {
        SchedulerBuilder {
            runtime,
            store,
            procs: Vec::new(),
            options: SchedulerOptions::default(),
        }
    }

    /// The workers this scheduler dispatches to.
    #[must_use]
    pub fn procs(&self) -> &[OsProc] {
        &self.procs
    }

    /// The run-wide options.
    #[must_use]
    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }
}

impl<R, C> fmt::Debug for Scheduler<R, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("procs", &self.procs)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Scheduler`]. Created by [`Scheduler::builder`].
pub struct SchedulerBuilder<R, C> {
    runtime: Arc<R>,
    store: Arc<C>,
    procs: Vec<OsProc>,
    options: SchedulerOptions,
}

impl<R, C> SchedulerBuilder<R, C> {
    /// Sets the worker processes to dispatch to.
    #[must_use]
    pub fn procs(mut self, procs: impl IntoIterator<Item = OsProc>) -> Self {
        self.procs = procs.into_iter().collect();
        self
    }

    /// Sets the run-wide options.
    #[must_use]
    pub fn options(mut self, options: SchedulerOptions) -> Self {
        self.options = options;
        self
    }

    /// Finishes the scheduler.
    #[must_use]
    pub fn build(self) -> Scheduler<R, C> {
        Scheduler {
            runtime: self.runtime,
            store: self.store,
            procs: self.procs,
            options: self.options,
        }
    }
}

impl<R, C> fmt::Debug for SchedulerBuilder<R, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerBuilder")
            .field("procs", &self.procs)
            .finish_non_exhaustive()
    }
}

impl<R, C> Scheduler<R, C>
where
    R: WorkerRuntime + Send + Sync + 'static,
    C: ChunkStore + Send + Sync + 'static,
{
    /// Computes the graph rooted at `root` and returns its materialized
    /// result.
    ///
    /// Fires ready thunks across the worker pool in dependency order,
    /// biased toward the workers already holding each thunk's input data;
    /// drains completions one at a time; recovers from worker deaths by
    /// replanning the affected subgraph onto survivors. Fails with
    /// [`Error::Halted`] when a dynamic task halts the run,
    /// [`Error::NoWorkers`] when the pool is (or becomes) empty, and
    /// [`Error::TaskFailed`] when a task function raises.
    pub async fn compute_dag(&self, root: &Arc<Thunk>) -> Result<Value> {
        if self.procs.is_empty() {
            return Err(Error::NoWorkers);
        }

        let (run, listeners, completion_rx, halt_rx) = {
            let span = span!(Level::DEBUG, "scheduler_init", root = %root.id());
            let _guard = span.enter();

            let dag = DagInfo::analyze(root);
            let mut state = ComputeState::start(&dag, &self.procs);

            let (completion_tx, completion_rx) = async_channel::unbounded();
            let (halt_tx, halt_rx) = async_channel::bounded(1);

            let mut listener_ends = Vec::with_capacity(self.procs.len());
            for &proc in &self.procs {
                let (cmd_tx, cmd_rx) = async_channel::unbounded();
                let (reply_tx, reply_rx) = async_channel::unbounded();
                state.worker_chans.insert(proc, WorkerChannels { cmd_tx, reply_rx });
                listener_ends.push((proc, cmd_rx, reply_tx));
            }

            let run = Arc::new(Run {
                runtime: Arc::clone(&self.runtime),
                store: Arc::clone(&self.store),
                options: self.options.clone(),
                dag,
                state: Mutex::new(state),
                completion_tx,
                halt_tx,
            });

            let listeners: Vec<_> = listener_ends
                .into_iter()
                .map(|(proc, cmd_rx, reply_tx)| {
                    let span = span!(Level::TRACE, "comm", processor = %proc);
                    tokio::spawn(
                        run_listener(Arc::clone(&run), proc, cmd_rx, reply_tx).instrument(span),
                    )
                })
                .collect();

            event!(Level::DEBUG, workers = self.procs.len(), "scheduler initialized");
            (run, listeners, completion_rx, halt_rx)
        };

        let result = {
            let span = span!(Level::DEBUG, "scheduler", root = %run.dag.root);
            run_loop(&run, &completion_rx, &halt_rx).instrument(span).await
        };

        // Teardown: close every channel so handle clones fail cleanly and
        // orphaned replies are discarded, then await the listeners - their
        // exit is the halt acknowledgment.
        run.state.lock().close_worker_channels();
        completion_rx.close();
        for listener in listeners {
            _ = listener.await;
        }

        result
    }
}

async fn run_loop<R, C>(
    run: &Arc<Run<R, C>>,
    completion_rx: &Receiver<Completion>,
    halt_rx: &Receiver<()>,
) -> Result<Value>
where
    R: WorkerRuntime + Send + Sync + 'static,
    C: ChunkStore + Send + Sync + 'static,
{
    dispatch::fire_available(run).await?;

    loop {
        let (halted, ready_empty, running_empty, procs_empty) = {
            let state = run.state.lock();
            (
                state.halt,
                state.ready.is_empty(),
                state.running.is_empty(),
                state.procs.is_empty(),
            )
        };

        // Safepoint: bail before blocking when a halt was requested.
        if halted {
            return Err(Error::Halted);
        }
        if ready_empty && running_empty {
            break;
        }
        if running_empty {
            if procs_empty {
                return Err(Error::NoWorkers);
            }
            // Work remains but nothing is in flight - a meta-only wave, or a
            // post-fault requeue. Fire again before blocking.
            dispatch::fire_available(run).await?;
            continue;
        }

        tokio::select! {
            biased;
            _ = halt_rx.recv() => return Err(Error::Halted),
            received = completion_rx.recv() => {
                let Completion { from, thunk, outcome } =
                    received.map_err(|_closed| Error::ChannelClosed)?;
                match outcome {
                    Err(WorkerFailure::Exited { .. }) => {
                        event!(Level::WARN, processor = %from, id = %thunk, "worker exited; recovering");
                        fault::handle_worker_death(run, from, thunk)?;
                        dispatch::fire_available(run).await?;
                    }
                    Err(WorkerFailure::Failed { reason, .. }) => {
                        return Err(Error::TaskFailed { id: thunk, reason });
                    }
                    Ok(payload) => {
                        run.state.lock().cache.insert(thunk, payload.into());
                        let hint = completion::finish_task(run, thunk, true).await?;
                        // The reporting worker most likely holds the data the
                        // unblocked dependent needs.
                        dispatch::fire_for_proc(run, from, hint).await?;
                    }
                }
            }
        }
    }

    let entry = run.state.lock().cache.get(&run.dag.root).cloned();
    match entry {
        Some(CacheEntry::Immediate(value)) => Ok(value),
        Some(CacheEntry::Chunk(chunk)) => Ok(run.store.materialize(&chunk).await?),
        None => {
            event!(Level::WARN, root = %run.dag.root, "root result missing after drain; halting");
            run.state.lock().halt = true;
            Err(Error::Halted)
        }
    }
}
