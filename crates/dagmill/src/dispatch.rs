// Copyright (c) the Dagmill Project Authors.
// Licensed under the MIT License.

use std::sync::Arc;

use dagmill_chunk::{ChunkStore, OsProc, Value};
use tracing::{Instrument, Level, event, span};

use crate::completion::finish_task;
use crate::error::{Error, Result};
use crate::scheduler::Run;
use crate::state::{CacheEntry, ComputeState};
use crate::thunk::{TaskInvocation, Thunk, ThunkInput};
use crate::worker::{Completion, TaskArg, TaskRequest, WorkerRuntime};

/// How a fire attempt ended: handed to a worker, or resolved locally (cache
/// reclaim or meta execution) and already finished.
enum Fired {
    Remote,
    Local { immediate_next: bool },
}

/// Fires up to one thunk on each live worker.
pub(crate) async fn fire_available<R, C>(run: &Arc<Run<R, C>>) -> Result<()>
where
    R: WorkerRuntime + Send + Sync + 'static,
    C: ChunkStore + Send + Sync + 'static,
{
    let procs = run.state.lock().procs.clone();
    for proc in procs {
        fire_for_proc(run, proc, false).await?;
    }
    Ok(())
}

/// Fires thunks on `proc` until the pick comes up empty or a dispatch goes
/// remote. Locally resolved thunks finish inline, possibly readying more
/// work, so the loop carries their immediate-next hint forward.
pub(crate) async fn fire_for_proc<R, C>(
    run: &Arc<Run<R, C>>,
    proc: OsProc,
    mut immediate_next: bool,
) -> Result<()>
where
    R: WorkerRuntime + Send + Sync + 'static,
    C: ChunkStore + Send + Sync + 'static,
{
    loop {
        let thunk = {
            let mut state = run.state.lock();
            if state.halt {
                return Ok(());
            }
            let Some(thunk) = state.pop_with_affinity(&run.dag, proc, immediate_next) else {
                return Ok(());
            };
            state.running.insert(thunk.id());
            state.thunk_dict.insert(thunk.id(), Arc::clone(&thunk));
            thunk
        };

        match fire_task(run, &thunk, proc).await? {
            Fired::Remote => return Ok(()),
            Fired::Local {
                immediate_next: hint,
            } => immediate_next = hint,
        }
    }
}

/// Fires one thunk, already popped from `ready` and marked running, with
/// all of its thunk inputs in the cache.
async fn fire_task<R, C>(run: &Arc<Run<R, C>>, thunk: &Arc<Thunk>, proc: OsProc) -> Result<Fired>
where
    R: WorkerRuntime + Send + Sync + 'static,
    C: ChunkStore + Send + Sync + 'static,
{
    let id = thunk.id();

    // A previous run may have left the result in the owner's cache; try to
    // reclaim it before doing any work.
    if thunk.cache()
        && let Some(chunk) = thunk.cache_ref()
    {
        if run.store.unrelease(&chunk).await.is_some() {
            event!(Level::DEBUG, id = %id, chunk = %chunk, "reclaimed cached result");
            run.state.lock().cache.insert(id, CacheEntry::Chunk(chunk));
            let hint = finish_task(run, id, false).await?;
            return Ok(Fired::Local {
                immediate_next: hint,
            });
        }
        thunk.clear_cache_ref();
    }

    // Meta thunks run here, in the scheduler process - no worker round-trip,
    // the scheduler owns the result directly.
    if thunk.meta() {
        let args = {
            let mut state = run.state.lock();
            collect_args(&mut state, thunk)?
        };
        let values = materialize_args(run, args).await?;
        let result = {
            let span = span!(Level::TRACE, "compute", id = %id, processor = "scheduler");
            let _guard = span.enter();
            (thunk.func())(TaskInvocation {
                args: values,
                handle: None,
            })
            .map_err(|reason| Error::TaskFailed { id, reason })?
        };
        run.state
            .lock()
            .cache
            .insert(id, CacheEntry::Immediate(result));
        let hint = finish_task(run, id, true).await?;
        return Ok(Fired::Local {
            immediate_next: hint,
        });
    }

    // Remote dispatch.
    let (target, request) = {
        let mut state = run.state.lock();
        let options = run.options.merge(thunk.options());
        let target = options
            .single
            .filter(|single| state.procs.contains(single))
            .unwrap_or(proc);

        let args = collect_args(&mut state, thunk)?;
        let handle = if thunk.dynamic() {
            state
                .worker_chans
                .get(&target)
                .map(|channels| channels.handle(id))
        } else {
            None
        };

        let request = TaskRequest {
            thunk: id,
            f: thunk.func(),
            args,
            send_result: thunk.get_result(),
            persist: thunk.persist(),
            cache: thunk.cache(),
            options,
            handle,
        };
        (target, request)
    };

    let runtime = Arc::clone(&run.runtime);
    let completion_tx = run.completion_tx.clone();
    let span = span!(Level::TRACE, "compute", id = %id, processor = %target);
    tokio::spawn(
        async move {
            let outcome = runtime.do_task(target, request).await;
            // The receiver is gone only during teardown; replies from
            // orphaned calls are discarded.
            _ = completion_tx
                .send(Completion {
                    from: target,
                    thunk: id,
                    outcome,
                })
                .await;
        }
        .instrument(span),
    );

    Ok(Fired::Remote)
}

/// Resolves a thunk's inputs to wire arguments: immediates ship as-is,
/// thunk inputs come out of the result cache. A missing cache entry is a
/// broken invariant - the thunk was not ready to fire - so the run halts.
fn collect_args(state: &mut ComputeState, thunk: &Thunk) -> Result<Vec<TaskArg>> {
    let mut args = Vec::with_capacity(thunk.inputs().len());
    for input in thunk.inputs() {
        let arg = match input {
            ThunkInput::Immediate(value) => TaskArg::Immediate(value.clone()),
            ThunkInput::Chunk(chunk) => TaskArg::Chunk(chunk.clone()),
            ThunkInput::Thunk(input_thunk) => {
                let cached = state.cache.get(&input_thunk.id()).map(|entry| match entry {
                    CacheEntry::Immediate(value) => TaskArg::Immediate(value.clone()),
                    CacheEntry::Chunk(chunk) => TaskArg::Chunk(chunk.clone()),
                });
                let Some(arg) = cached else {
                    event!(
                        Level::WARN,
                        id = %thunk.id(),
                        input = %input_thunk.id(),
                        "input missing from result cache; halting"
                    );
                    state.halt = true;
                    return Err(Error::Halted);
                };
                arg
            }
        };
        args.push(arg);
    }
    Ok(args)
}

/// Fetches the data behind wire arguments, for in-scheduler execution.
async fn materialize_args<R, C>(run: &Arc<Run<R, C>>, args: Vec<TaskArg>) -> Result<Vec<Value>>
where
    C: ChunkStore + Send + Sync + 'static,
{
    let mut values = Vec::with_capacity(args.len());
    for arg in args {
        match arg {
            TaskArg::Immediate(value) => values.push(value),
            TaskArg::Chunk(chunk) => values.push(run.store.materialize(&chunk).await?),
        }
    }
    Ok(values)
}
