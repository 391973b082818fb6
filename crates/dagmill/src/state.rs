// Copyright (c) the Dagmill Project Authors.
// Licensed under the MIT License.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_channel::{Receiver, Sender};
use dagmill_chunk::{ChunkRef, OsProc, Value};

use crate::dag::DagInfo;
use crate::handle::{DynamicMessage, DynamicReply, SchedulerHandle};
use crate::thunk::{Thunk, ThunkId};
use crate::worker::TaskPayload;

/// A result holding in the scheduler's cache: either the raw value (meta
/// thunks, `get_result` requests) or a handle to a chunk on some worker.
#[derive(Clone, Debug)]
pub(crate) enum CacheEntry {
    Immediate(Value),
    Chunk(ChunkRef),
}

impl CacheEntry {
    pub fn chunk(&self) -> Option<&ChunkRef> {
        match self {
            Self::Chunk(chunk) => Some(chunk),
            Self::Immediate(_) => None,
        }
    }
}

impl From<TaskPayload> for CacheEntry {
    fn from(payload: TaskPayload) -> Self {
        match payload {
            TaskPayload::Value(value) => Self::Immediate(value),
            TaskPayload::Chunk(chunk) => Self::Chunk(chunk),
        }
    }
}

/// Dynamic-channel endpoints retained for one live worker. Handles given to
/// that worker's tasks are clones of these; closing them here fails every
/// clone cleanly.
#[derive(Debug)]
pub(crate) struct WorkerChannels {
    pub cmd_tx: Sender<DynamicMessage>,
    pub reply_rx: Receiver<DynamicReply>,
}

impl WorkerChannels {
    pub fn handle(&self, thunk: ThunkId) -> SchedulerHandle {
        SchedulerHandle::new(thunk, self.cmd_tx.clone(), self.reply_rx.clone())
    }

    pub fn close(&self) {
        self.cmd_tx.close();
        self.reply_rx.close();
    }
}

/// The sole shared mutable object of a run.
///
/// Every field is guarded by the one lock wrapping the whole struct; the
/// lock is only ever held for bookkeeping, never across an await.
///
/// Lifecycle of a thunk: `waiting` (or straight to `ready` when it has no
/// thunk inputs) -> `ready` -> `running` -> `finished`, with its result
/// entering `cache` on completion and leaving once every consumer is done.
#[derive(Debug)]
pub(crate) struct ComputeState {
    /// Live workers. Shrinks as workers die.
    pub procs: Vec<OsProc>,

    /// Thunk -> inputs still unfulfilled. A key here is in no other bucket.
    pub waiting: HashMap<ThunkId, HashSet<ThunkId>>,

    /// Thunk -> consumers not yet done. Empty set means the cached result
    /// is freeable.
    pub waiting_data: HashMap<ThunkId, HashSet<ThunkId>>,

    /// Fireable now, ascending priority: popped from the end.
    pub ready: Vec<ThunkId>,

    /// Dispatched, not yet completed.
    pub running: HashSet<ThunkId>,

    /// Completed. Only the fault handler ever removes an entry.
    pub finished: HashSet<ThunkId>,

    /// Result holdings.
    pub cache: HashMap<ThunkId, CacheEntry>,

    /// Wire-id lookup, populated as thunks are dispatched.
    pub thunk_dict: HashMap<ThunkId, Arc<Thunk>>,

    /// Dynamic-channel endpoints, one entry per live worker.
    pub worker_chans: HashMap<OsProc, WorkerChannels>,

    /// Stop-the-world flag. Set once, never cleared.
    pub halt: bool,
}

impl ComputeState {
    /// Seeds the run: every node starts in `waiting`, except input-free
    /// nodes which go straight to `ready` in priority order.
    pub fn start(dag: &DagInfo, procs: &[OsProc]) -> Self {
        let mut waiting: HashMap<ThunkId, HashSet<ThunkId>> = HashMap::new();
        let mut waiting_data: HashMap<ThunkId, HashSet<ThunkId>> = HashMap::new();
        let mut ready = Vec::new();

        for (&id, node) in &dag.nodes {
            waiting_data.entry(id).or_default();
            let unmet: HashSet<ThunkId> = node.thunk_inputs().map(|input| input.id()).collect();
            for &input in &unmet {
                waiting_data.entry(input).or_default().insert(id);
            }
            if unmet.is_empty() {
                ready.push(id);
            } else {
                waiting.insert(id, unmet);
            }
        }

        dag.sort_by_priority(&mut ready);

        Self {
            procs: procs.to_vec(),
            waiting,
            waiting_data,
            ready,
            running: HashSet::new(),
            finished: HashSet::new(),
            cache: HashMap::new(),
            thunk_dict: HashMap::new(),
            worker_chans: HashMap::new(),
            halt: false,
        }
    }

    pub fn has_work(&self) -> bool {
        !self.ready.is_empty() || !self.running.is_empty()
    }

    pub fn close_worker_channels(&mut self) {
        for channels in self.worker_chans.values() {
            channels.close();
        }
        self.worker_chans.clear();
    }
}
