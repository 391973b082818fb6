// Copyright (c) the Dagmill Project Authors.
// Licensed under the MIT License.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::thunk::{Thunk, ThunkId};

/// Immutable facts about the graph under computation, derived once from the
/// root before the run starts: reverse edges, subtree sizes, and the
/// priority order used to break ties between ready thunks.
#[derive(Debug)]
pub(crate) struct DagInfo {
    pub root: ThunkId,
    pub nodes: HashMap<ThunkId, Arc<Thunk>>,
    pub dependents: HashMap<ThunkId, HashSet<ThunkId>>,
    pub noffspring: HashMap<ThunkId, usize>,
    priority: HashMap<ThunkId, usize>,
}

impl DagInfo {
    pub fn analyze(root: &Arc<Thunk>) -> Self {
        let mut nodes: HashMap<ThunkId, Arc<Thunk>> = HashMap::new();
        let mut dependents: HashMap<ThunkId, HashSet<ThunkId>> = HashMap::new();

        let mut stack = vec![Arc::clone(root)];
        while let Some(node) = stack.pop() {
            if nodes.insert(node.id(), Arc::clone(&node)).is_some() {
                continue;
            }
            dependents.entry(node.id()).or_default();
            for input in node.thunk_inputs() {
                dependents.entry(input.id()).or_default().insert(node.id());
                if !nodes.contains_key(&input.id()) {
                    stack.push(Arc::clone(input));
                }
            }
        }

        // noffspring = size of the forward-reachable dependent set, counted
        // through a visited set so diamonds are not double-counted.
        let mut noffspring = HashMap::with_capacity(nodes.len());
        for &id in nodes.keys() {
            let mut seen: HashSet<ThunkId> = HashSet::new();
            let mut work = vec![id];
            while let Some(current) = work.pop() {
                if let Some(deps) = dependents.get(&current) {
                    for &dep in deps {
                        if seen.insert(dep) {
                            work.push(dep);
                        }
                    }
                }
            }
            noffspring.insert(id, seen.len());
        }

        // Priority is the rank by offspring count: a larger subtree hanging
        // off a thunk means finishing it unlocks more work, so it sorts
        // higher. Ties go to the earlier-created thunk.
        let mut ordered: Vec<ThunkId> = nodes.keys().copied().collect();
        ordered.sort_by_key(|id| (noffspring.get(id).copied().unwrap_or(0), Reverse(*id)));
        let priority: HashMap<ThunkId, usize> = ordered
            .into_iter()
            .enumerate()
            .map(|(rank, id)| (id, rank))
            .collect();

        Self {
            root: root.id(),
            nodes,
            dependents,
            noffspring,
            priority,
        }
    }

    pub fn priority(&self, id: ThunkId) -> usize {
        self.priority.get(&id).copied().unwrap_or(0)
    }

    /// Sorts ascending by priority, so the end of the slice is the
    /// highest-priority entry - the end is where the ready queue is popped.
    pub fn sort_by_priority(&self, ids: &mut [ThunkId]) {
        ids.sort_by_key(|&id| self.priority(id));
    }

    /// The wire-id view of the reverse edges, served to dynamic tasks.
    pub fn dag_ids(&self) -> HashMap<u64, HashSet<u64>> {
        self.dependents
            .iter()
            .map(|(id, deps)| {
                (
                    id.as_u64(),
                    deps.iter().map(|dep| dep.as_u64()).collect(),
                )
            })
            .collect()
    }
}
