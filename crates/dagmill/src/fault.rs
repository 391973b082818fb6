// Copyright (c) the Dagmill Project Authors.
// Licensed under the MIT License.

use std::collections::HashSet;
use std::sync::Arc;

use dagmill_chunk::OsProc;
use tracing::{Level, event};

use crate::error::{Error, Result};
use crate::scheduler::Run;
use crate::thunk::ThunkId;

/// Recovers from the death of `dead`, signaled by a worker-exited failure of
/// `failed`.
///
/// The dead worker is removed from the pool and its control channels are
/// closed. Every cached result that resided on it is lost; the failed thunk,
/// each lost result some unfinished part of the graph still needs, and -
/// transitively - any finished input whose own result is gone are moved back
/// into the pending buckets with their dependency edges restored, and the
/// ready queue is rebuilt in topological-priority order. The caller then
/// refires onto the survivors.
pub(crate) fn handle_worker_death<R, C>(
    run: &Arc<Run<R, C>>,
    dead: OsProc,
    failed: ThunkId,
) -> Result<()> {
    let mut state = run.state.lock();

    state.procs.retain(|&proc| proc != dead);
    if let Some(channels) = state.worker_chans.remove(&dead) {
        channels.close();
    }
    if state.procs.is_empty() {
        // Replanning onto nothing would leave the ready queue undrainable.
        return Err(Error::NoWorkers);
    }

    // Results that died with the worker.
    let lost: Vec<ThunkId> = state
        .cache
        .iter()
        .filter(|(_, entry)| entry.chunk().is_some_and(|chunk| chunk.owner() == dead))
        .map(|(&id, _)| id)
        .collect();
    for &id in &lost {
        state.cache.remove(&id);
        if let Some(node) = run.dag.nodes.get(&id)
            && node.cache_ref().is_some_and(|chunk| chunk.owner() == dead)
        {
            node.clear_cache_ref();
        }
    }

    // The replan set: the failed thunk, plus each lost result an unfinished
    // descendant still needs, plus - transitively - finished inputs whose
    // results are gone and must be recomputed to feed the replanned work.
    let mut work: Vec<ThunkId> = vec![failed];
    for &id in &lost {
        let needed = id == run.dag.root
            || run
                .dag
                .dependents
                .get(&id)
                .is_some_and(|deps| deps.iter().any(|dep| !state.finished.contains(dep)));
        if needed {
            work.push(id);
        }
    }

    let mut replan: HashSet<ThunkId> = HashSet::new();
    while let Some(id) = work.pop() {
        if !replan.insert(id) {
            continue;
        }
        if let Some(node) = run.dag.nodes.get(&id) {
            for input in node.thunk_inputs() {
                if state.finished.contains(&input.id()) && !state.cache.contains_key(&input.id()) {
                    work.push(input.id());
                }
            }
        }
    }

    for &id in &replan {
        state.finished.remove(&id);
        state.running.remove(&id);
        state.ready.retain(|&ready| ready != id);
    }

    // Restore the dependency edges of everything replanned.
    let mut revived: Vec<ThunkId> = replan.iter().copied().collect();
    run.dag.sort_by_priority(&mut revived);
    for &id in &revived {
        let Some(node) = run.dag.nodes.get(&id) else {
            continue;
        };

        let consumers: HashSet<ThunkId> = run
            .dag
            .dependents
            .get(&id)
            .map(|deps| {
                deps.iter()
                    .copied()
                    .filter(|dep| !state.finished.contains(dep))
                    .collect()
            })
            .unwrap_or_default();
        state.waiting_data.insert(id, consumers);

        let mut unmet: HashSet<ThunkId> = HashSet::new();
        for input in node.thunk_inputs() {
            state.waiting_data.entry(input.id()).or_default().insert(id);
            if !state.cache.contains_key(&input.id()) {
                unmet.insert(input.id());
            }
        }
        if unmet.is_empty() {
            state.ready.push(id);
        } else {
            state.waiting.insert(id, unmet);
        }
    }

    // Dependents outside the replan set that were already cleared to run
    // must wait for the recomputed inputs again.
    for &id in &revived {
        let Some(deps) = run.dag.dependents.get(&id) else {
            continue;
        };
        for &dep in deps.iter() {
            if replan.contains(&dep)
                || state.finished.contains(&dep)
                || state.running.contains(&dep)
            {
                continue;
            }
            state.ready.retain(|&ready| ready != dep);
            state.waiting.entry(dep).or_default().insert(id);
        }
    }

    let mut ready = std::mem::take(&mut state.ready);
    run.dag.sort_by_priority(&mut ready);
    state.ready = ready;

    event!(
        Level::DEBUG,
        processor = %dead,
        lost = lost.len(),
        replanned = replan.len(),
        "worker removed; affected subgraph replanned"
    );

    Ok(())
}
