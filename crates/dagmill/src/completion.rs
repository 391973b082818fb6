// Copyright (c) the Dagmill Project Authors.
// Licensed under the MIT License.

use std::sync::Arc;

use dagmill_chunk::ChunkStore;
use tracing::{Level, event};

use crate::error::{Error, Result};
use crate::scheduler::Run;
use crate::state::CacheEntry;
use crate::thunk::ThunkId;

/// Marks `node` finished: retains its cache ref for future runs, unlocks its
/// dependents, and frees inputs whose consumers are all done (when `free` is
/// set - a cache reclaim never computed its inputs, so there is nothing to
/// free).
///
/// Returns the immediate-next hint: exactly one dependent became ready, and
/// its data most likely sits on the worker that just reported.
pub(crate) async fn finish_task<R, C>(run: &Arc<Run<R, C>>, node: ThunkId, free: bool) -> Result<bool>
where
    C: ChunkStore + Send + Sync + 'static,
{
    let (immediate_next, to_free) = {
        let mut state = run.state.lock();

        let Some(thunk) = state.thunk_dict.get(&node).map(Arc::clone) else {
            event!(Level::WARN, id = %node, "finished thunk missing from dispatch table; halting");
            state.halt = true;
            return Err(Error::Halted);
        };

        if thunk.cache()
            && let Some(CacheEntry::Chunk(chunk)) = state.cache.get(&node)
        {
            thunk.set_cache_ref(chunk.clone());
        }

        // Unlock dependents in priority order so the highest-priority one
        // lands at the popped end of the ready queue.
        let mut dependents: Vec<ThunkId> = run
            .dag
            .dependents
            .get(&node)
            .map(|deps| deps.iter().copied().collect())
            .unwrap_or_default();
        run.dag.sort_by_priority(&mut dependents);

        let mut newly_ready = 0_usize;
        for dependent in dependents {
            let now_ready = state.waiting.get_mut(&dependent).is_some_and(|unmet| {
                unmet.remove(&node);
                unmet.is_empty()
            });
            if now_ready {
                state.waiting.remove(&dependent);
                state.ready.push(dependent);
                newly_ready += 1;
            }
        }

        // This node is done consuming; inputs with no consumers left can go.
        let mut to_free = Vec::new();
        for input in thunk.thunk_inputs() {
            let input_id = input.id();
            let emptied = state.waiting_data.get_mut(&input_id).is_some_and(|consumers| {
                consumers.remove(&node);
                consumers.is_empty()
            });
            if emptied
                && free
                && !input.persist()
                && let Some(entry) = state.cache.remove(&input_id)
                && let CacheEntry::Chunk(chunk) = entry
            {
                to_free.push((chunk, input.cache()));
            }
        }

        state.running.remove(&node);
        state.finished.insert(node);

        (newly_ready == 1, to_free)
    };

    for (chunk, cache) in to_free {
        run.store.free(&chunk, false, cache).await;
    }

    Ok(immediate_next)
}

#[cfg(test)]
mod tests {
    use dagmill_chunk::{ChunkStore, MemoryChunkStore, OsProc, Value};
    use futures::executor::block_on;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::dag::DagInfo;
    use crate::state::ComputeState;
    use crate::testing::LocalWorkerPool;
    use crate::thunk::{Thunk, delayed};

    const W1: OsProc = OsProc::new(1);

    fn run_for(root: &Arc<Thunk>) -> Arc<Run<LocalWorkerPool, MemoryChunkStore>> {
        let (pool, procs) = LocalWorkerPool::new(1);
        let store = pool.store();
        let dag = DagInfo::analyze(root);
        let state = ComputeState::start(&dag, &procs);
        Run::for_tests(pool, store, dag, state)
    }

    #[test]
    fn finishing_unlocks_single_dependent_with_hint() {
        let a = delayed(|_| Ok(Value::new(()))).build();
        let b = delayed(|_| Ok(Value::new(()))).input(Arc::clone(&a)).build();
        let run = run_for(&b);

        {
            let mut state = run.state.lock();
            state.ready.clear();
            state.running.insert(a.id());
            state.thunk_dict.insert(a.id(), Arc::clone(&a));
            state.cache.insert(a.id(), CacheEntry::Immediate(Value::new(())));
        }

        let hint = block_on(finish_task(&run, a.id(), true)).unwrap();

        assert!(hint);
        let state = run.state.lock();
        assert!(state.finished.contains(&a.id()));
        assert!(!state.running.contains(&a.id()));
        assert_eq!(state.ready, vec![b.id()]);
        assert!(!state.waiting.contains_key(&b.id()));
    }

    #[test]
    fn input_is_freed_when_last_consumer_finishes() {
        let a = delayed(|_| Ok(Value::new(()))).build();
        let b = delayed(|_| Ok(Value::new(()))).input(Arc::clone(&a)).build();
        let c = delayed(|_| Ok(Value::new(()))).input(Arc::clone(&a)).build();
        let root = delayed(|_| Ok(Value::new(())))
            .input(Arc::clone(&b))
            .input(Arc::clone(&c))
            .build();
        let run = run_for(&root);

        let chunk = block_on(run.store.put(W1, Value::new(5_i64), false));
        {
            let mut state = run.state.lock();
            state.ready.clear();
            state.finished.insert(a.id());
            state.cache.insert(a.id(), CacheEntry::Chunk(chunk.clone()));
            for node in [&b, &c] {
                state.running.insert(node.id());
                state.thunk_dict.insert(node.id(), Arc::clone(node));
                state
                    .cache
                    .insert(node.id(), CacheEntry::Immediate(Value::new(())));
                state.waiting.remove(&node.id());
            }
        }

        // First consumer done: a's result must survive.
        block_on(finish_task(&run, b.id(), true)).unwrap();
        assert!(run.state.lock().cache.contains_key(&a.id()));
        assert!(block_on(run.store.materialize(&chunk)).is_ok());

        // Last consumer done: a's result is freed everywhere.
        block_on(finish_task(&run, c.id(), true)).unwrap();
        assert!(!run.state.lock().cache.contains_key(&a.id()));
        assert!(block_on(run.store.materialize(&chunk)).is_err());
    }

    #[test]
    fn finish_without_free_keeps_inputs() {
        let a = delayed(|_| Ok(Value::new(()))).build();
        let b = delayed(|_| Ok(Value::new(()))).input(Arc::clone(&a)).build();
        let run = run_for(&b);

        let chunk = block_on(run.store.put(W1, Value::new(5_i64), false));
        {
            let mut state = run.state.lock();
            state.ready.clear();
            state.finished.insert(a.id());
            state.cache.insert(a.id(), CacheEntry::Chunk(chunk.clone()));
            state.running.insert(b.id());
            state.thunk_dict.insert(b.id(), Arc::clone(&b));
            state.cache.insert(b.id(), CacheEntry::Immediate(Value::new(())));
            state.waiting.remove(&b.id());
        }

        block_on(finish_task(&run, b.id(), false)).unwrap();

        assert!(run.state.lock().cache.contains_key(&a.id()));
        assert!(block_on(run.store.materialize(&chunk)).is_ok());
    }

    #[test]
    fn cache_flag_retains_chunk_ref_for_future_runs() {
        let a = delayed(|_| Ok(Value::new(()))).cache(true).build();
        let run = run_for(&a);

        let chunk = block_on(run.store.put(W1, Value::new(1_i64), false));
        {
            let mut state = run.state.lock();
            state.ready.clear();
            state.running.insert(a.id());
            state.thunk_dict.insert(a.id(), Arc::clone(&a));
            state.cache.insert(a.id(), CacheEntry::Chunk(chunk.clone()));
        }

        block_on(finish_task(&run, a.id(), true)).unwrap();

        assert_eq!(a.cache_ref(), Some(chunk));
    }
}
