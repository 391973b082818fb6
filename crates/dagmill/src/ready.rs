// Copyright (c) the Dagmill Project Authors.
// Licensed under the MIT License.

use std::collections::HashSet;
use std::sync::Arc;

use dagmill_chunk::OsProc;

use crate::dag::DagInfo;
use crate::state::{CacheEntry, ComputeState};
use crate::thunk::{Thunk, ThunkInput};

impl ComputeState {
    /// Where a thunk's input data lives: one `(worker, weight)` entry per
    /// worker holding at least one input chunk, weight = resident input
    /// count. Empty when no input is chunk-resident anywhere.
    pub(crate) fn affinity(&self, thunk: &Thunk) -> Vec<(OsProc, usize)> {
        let mut weights: Vec<(OsProc, usize)> = Vec::new();
        let mut bump = |proc: OsProc| {
            if let Some(entry) = weights.iter_mut().find(|(p, _)| *p == proc) {
                entry.1 += 1;
            } else {
                weights.push((proc, 1));
            }
        };

        for input in thunk.inputs() {
            match input {
                ThunkInput::Chunk(chunk) => bump(chunk.owner()),
                ThunkInput::Thunk(input_thunk) => {
                    if let Some(CacheEntry::Chunk(chunk)) = self.cache.get(&input_thunk.id()) {
                        bump(chunk.owner());
                    }
                }
                ThunkInput::Immediate(_) => {}
            }
        }

        weights
    }

    fn affinity_procs(&self, thunk: &Thunk) -> HashSet<OsProc> {
        self.affinity(thunk)
            .into_iter()
            .map(|(proc, _)| proc)
            .collect()
    }

    /// Picks the next thunk to fire on `proc`, or `None` if nothing in the
    /// ready queue suits it.
    ///
    /// In priority order: the fast path (the hinted, just-unblocked thunk at
    /// the back of the queue whose data is on `proc`); the first thunk, from
    /// the high-priority end, whose affinity names `proc`; the first with no
    /// placement preference at all; and the first whose preferred workers
    /// are all gone - it would otherwise never get a preferred dispatch.
    pub(crate) fn pop_with_affinity(
        &mut self,
        dag: &DagInfo,
        proc: OsProc,
        immediate_next: bool,
    ) -> Option<Arc<Thunk>> {
        if self.ready.is_empty() {
            return None;
        }

        if immediate_next
            && let Some(last) = self.ready.last().copied()
            && let Some(node) = dag.nodes.get(&last).map(Arc::clone)
            && self.affinity_procs(&node).contains(&proc)
        {
            self.ready.pop();
            return Some(node);
        }

        let affinities: Vec<HashSet<OsProc>> = self
            .ready
            .iter()
            .map(|id| {
                dag.nodes
                    .get(id)
                    .map(|node| self.affinity_procs(node))
                    .unwrap_or_default()
            })
            .collect();

        let index = (0..self.ready.len())
            .rev()
            .find(|&i| affinities[i].contains(&proc))
            .or_else(|| (0..self.ready.len()).rev().find(|&i| affinities[i].is_empty()))
            .or_else(|| {
                (0..self.ready.len())
                    .rev()
                    .find(|&i| affinities[i].iter().all(|p| !self.procs.contains(p)))
            })?;

        let id = self.ready.remove(index);
        dag.nodes.get(&id).map(Arc::clone)
    }
}

#[cfg(test)]
mod tests {
    use dagmill_chunk::{ChunkRef, Value};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::thunk::{ThunkBuilder, delayed};

    const W1: OsProc = OsProc::new(1);
    const W2: OsProc = OsProc::new(2);

    fn noop() -> ThunkBuilder {
        delayed(|_| Ok(Value::new(())))
    }

    /// Root with two leaf inputs; each leaf's result is planted in the cache
    /// as a chunk on the given worker so the root's affinity points there.
    fn state_with_ready(
        owners: &[(u64, OsProc)],
        procs: &[OsProc],
    ) -> (ComputeState, DagInfo, Arc<Thunk>) {
        let mut builder = noop();
        let mut leaves = Vec::new();
        for _ in owners {
            let leaf = noop().build();
            builder = builder.input(Arc::clone(&leaf));
            leaves.push(leaf);
        }
        let root = builder.build();
        let dag = DagInfo::analyze(&root);
        let mut state = ComputeState::start(&dag, procs);

        for (leaf, &(chunk_id, owner)) in leaves.iter().zip(owners) {
            state.cache.insert(
                leaf.id(),
                CacheEntry::Chunk(ChunkRef::new(chunk_id, owner)),
            );
            state.finished.insert(leaf.id());
        }
        state.waiting.clear();
        state.ready = vec![root.id()];
        (state, dag, root)
    }

    #[test]
    fn affinity_counts_resident_inputs_per_worker() {
        let (state, _dag, root) = state_with_ready(&[(1, W1), (2, W1), (3, W2)], &[W1, W2]);

        let mut affinity = state.affinity(&root);
        affinity.sort_by_key(|&(proc, _)| proc);
        assert_eq!(affinity, vec![(W1, 2), (W2, 1)]);
    }

    #[test]
    fn fast_path_pops_hinted_thunk() {
        let (mut state, dag, root) = state_with_ready(&[(1, W1)], &[W1, W2]);

        let popped = state.pop_with_affinity(&dag, W1, true);
        assert_eq!(popped.map(|t| t.id()), Some(root.id()));
        assert!(state.ready.is_empty());
    }

    #[test]
    fn affinity_match_skips_foreign_worker() {
        let (mut state, dag, _root) = state_with_ready(&[(1, W1)], &[W1, W2]);

        // W2 holds none of the inputs and the preferred worker is alive, so
        // W2 gets nothing.
        assert!(state.pop_with_affinity(&dag, W2, false).is_none());
        assert_eq!(state.ready.len(), 1);
    }

    #[test]
    fn orphans_go_anywhere() {
        let leaf = noop().build();
        let dag = DagInfo::analyze(&leaf);
        let mut state = ComputeState::start(&dag, &[W2]);

        let popped = state.pop_with_affinity(&dag, W2, false);
        assert_eq!(popped.map(|t| t.id()), Some(leaf.id()));
    }

    #[test]
    fn unreachable_affinity_is_dispatched_to_survivors() {
        // The only input chunk lives on a dead worker; W2 should still get
        // the thunk rather than starving it.
        let (mut state, dag, root) = state_with_ready(&[(1, W1)], &[W2]);

        let popped = state.pop_with_affinity(&dag, W2, false);
        assert_eq!(popped.map(|t| t.id()), Some(root.id()));
    }

    #[test]
    fn empty_ready_pops_nothing() {
        let leaf = noop().build();
        let dag = DagInfo::analyze(&leaf);
        let mut state = ComputeState::start(&dag, &[W1]);
        state.ready.clear();

        assert!(state.pop_with_affinity(&dag, W1, true).is_none());
    }
}
