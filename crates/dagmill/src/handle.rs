// Copyright (c) the Dagmill Project Authors.
// Licensed under the MIT License.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_channel::{Receiver, Sender};
use dagmill_chunk::{OsProc, Value};
use tracing::{Level, event};

use crate::error::{Error, Result};
use crate::scheduler::Run;
use crate::thunk::ThunkId;

/// A control command a running task sends to the scheduler.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum DynamicCommand {
    /// Stop the whole run. The main loop exits with
    /// [`Error::Halted`][crate::Error::Halted].
    Halt,

    /// Ask for the graph's reverse edges as wire ids. Answered with
    /// [`DynamicReply::DagIds`].
    GetDagIds,

    /// Anything the scheduler does not recognize. Logged and treated as a
    /// reason to halt.
    Other(String),
}

/// One message on a worker's control channel.
#[derive(Debug)]
pub struct DynamicMessage {
    /// The task that sent the command.
    pub thunk: ThunkId,
    /// The command.
    pub command: DynamicCommand,
    /// Optional command payload.
    pub data: Option<Value>,
}

/// A scheduler reply on a worker's control channel.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum DynamicReply {
    /// Thunk id -> ids of its dependents, for the whole graph.
    DagIds(HashMap<u64, HashSet<u64>>),
}

/// The capability a dynamic task uses to talk to the scheduler while it
/// runs.
///
/// Handles are clones of the per-worker channel endpoints: clones share the
/// endpoints, and once the scheduler closes them (on halt or teardown),
/// `send`/`recv` on every clone fail cleanly with
/// [`ChannelClosed`][crate::Error::ChannelClosed].
///
/// Task functions are synchronous, so the `_blocking` variants are the ones
/// they typically call.
#[derive(Clone, Debug)]
pub struct SchedulerHandle {
    thunk: ThunkId,
    tx: Sender<DynamicMessage>,
    rx: Receiver<DynamicReply>,
}

impl SchedulerHandle {
    pub(crate) fn new(thunk: ThunkId, tx: Sender<DynamicMessage>, rx: Receiver<DynamicReply>) -> Self {
        Self { thunk, tx, rx }
    }

    /// The thunk this handle was issued to.
    #[must_use]
    pub fn thunk(&self) -> ThunkId {
        self.thunk
    }

    /// Sends a command to the scheduler.
    pub async fn send(&self, command: DynamicCommand, data: Option<Value>) -> Result<()> {
        self.tx
            .send(DynamicMessage {
                thunk: self.thunk,
                command,
                data,
            })
            .await
            .map_err(|_closed| Error::ChannelClosed)
    }

    /// Blocking [`send`][Self::send], for synchronous task bodies.
    pub fn send_blocking(&self, command: DynamicCommand, data: Option<Value>) -> Result<()> {
        self.tx
            .send_blocking(DynamicMessage {
                thunk: self.thunk,
                command,
                data,
            })
            .map_err(|_closed| Error::ChannelClosed)
    }

    /// Receives the next scheduler reply on this worker's channel.
    pub async fn recv(&self) -> Result<DynamicReply> {
        self.rx.recv().await.map_err(|_closed| Error::ChannelClosed)
    }

    /// Blocking [`recv`][Self::recv], for synchronous task bodies.
    pub fn recv_blocking(&self) -> Result<DynamicReply> {
        self.rx.recv_blocking().map_err(|_closed| Error::ChannelClosed)
    }

    /// Stops the whole run.
    pub async fn halt(&self) -> Result<()> {
        self.send(DynamicCommand::Halt, None).await
    }

    /// Blocking [`halt`][Self::halt].
    pub fn halt_blocking(&self) -> Result<()> {
        self.send_blocking(DynamicCommand::Halt, None)
    }

    /// Fetches the graph's reverse edges as wire ids.
    pub async fn dag_ids(&self) -> Result<HashMap<u64, HashSet<u64>>> {
        self.send(DynamicCommand::GetDagIds, None).await?;
        match self.recv().await? {
            DynamicReply::DagIds(ids) => Ok(ids),
        }
    }

    /// Blocking [`dag_ids`][Self::dag_ids].
    pub fn dag_ids_blocking(&self) -> Result<HashMap<u64, HashSet<u64>>> {
        self.send_blocking(DynamicCommand::GetDagIds, None)?;
        match self.recv_blocking()? {
            DynamicReply::DagIds(ids) => Ok(ids),
        }
    }
}

/// Per-worker control-channel listener. Runs until the channel closes, a
/// halt is requested, or an unknown command arrives.
pub(crate) async fn run_listener<R, C>(
    run: Arc<Run<R, C>>,
    proc: OsProc,
    cmd_rx: Receiver<DynamicMessage>,
    reply_tx: Sender<DynamicReply>,
) {
    while let Ok(message) = cmd_rx.recv().await {
        match message.command {
            DynamicCommand::Halt => {
                event!(Level::DEBUG, id = %message.thunk, processor = %proc, "halt requested");
                run.request_halt();
                break;
            }
            DynamicCommand::GetDagIds => {
                let ids = run.dag.dag_ids();
                if reply_tx.send(DynamicReply::DagIds(ids)).await.is_err() {
                    break;
                }
            }
            DynamicCommand::Other(name) => {
                event!(
                    Level::WARN,
                    command = %name,
                    id = %message.thunk,
                    processor = %proc,
                    "unknown dynamic command; halting"
                );
                run.request_halt();
                break;
            }
        }
    }
}
