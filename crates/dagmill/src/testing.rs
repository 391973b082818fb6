// Copyright (c) the Dagmill Project Authors.
// Licensed under the MIT License.

//! In-process workers for tests and examples.
//!
//! [`LocalWorkerPool`] implements [`WorkerRuntime`] over a shared
//! [`MemoryChunkStore`], simulating a pool of worker processes inside one
//! process. Worker deaths are scriptable ([`kill`][LocalWorkerPool::kill],
//! [`fail_after`][LocalWorkerPool::fail_after]), which is what the fault
//! recovery suites are built on.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

pub use dagmill_chunk::MemoryChunkStore;
use dagmill_chunk::{ChunkStore, OsProc};
use parking_lot::Mutex;

use crate::options::ProcKind;
use crate::thunk::TaskInvocation;
use crate::worker::{
    TaskArg, TaskPayload, TaskRequest, WorkerFailure, WorkerRuntime, choose_processor,
};

/// An in-process pool of simulated worker processes.
///
/// Every worker shares one [`MemoryChunkStore`], with chunk ownership
/// tracked per worker, so data loss on a simulated death behaves like the
/// real thing: the dead worker's chunks are gone, everyone else's survive.
#[derive(Debug)]
pub struct LocalWorkerPool {
    store: Arc<MemoryChunkStore>,
    workers: Mutex<HashMap<OsProc, WorkerSim>>,
}

#[derive(Debug)]
struct WorkerSim {
    kinds: Vec<ProcKind>,
    alive: bool,
    // Die after this many more completed tasks.
    fail_after: Option<u32>,
    executed: u32,
}

impl LocalWorkerPool {
    /// Creates a pool of `count` CPU workers with pids `1..=count`, plus the
    /// processor list to hand to the scheduler builder.
    #[must_use]
    pub fn new(count: u32) -> (Arc<Self>, Vec<OsProc>) {
        let procs: Vec<OsProc> = (1..=count).map(OsProc::new).collect();
        let workers = procs
            .iter()
            .map(|&proc| {
                (
                    proc,
                    WorkerSim {
                        kinds: vec![ProcKind::Cpu],
                        alive: true,
                        fail_after: None,
                        executed: 0,
                    },
                )
            })
            .collect();

        (
            Arc::new(Self {
                store: Arc::new(MemoryChunkStore::new()),
                workers: Mutex::new(workers),
            }),
            procs,
        )
    }

    /// The chunk store shared by the scheduler and every worker.
    #[must_use]
    pub fn store(&self) -> Arc<MemoryChunkStore> {
        Arc::clone(&self.store)
    }

    /// Kills `proc` immediately: its chunks are dropped and every further
    /// dispatch to it reports [`WorkerFailure::Exited`].
    pub fn kill(&self, proc: OsProc) {
        if let Some(worker) = self.workers.lock().get_mut(&proc) {
            worker.alive = false;
        }
        self.store.drop_worker(proc);
    }

    /// Scripts a death: `proc` completes `tasks` more tasks normally, then
    /// dies, taking its chunks (results included) with it.
    pub fn fail_after(&self, proc: OsProc, tasks: u32) {
        if let Some(worker) = self.workers.lock().get_mut(&proc) {
            worker.fail_after = Some(tasks);
        }
    }

    /// How many tasks `proc` has completed.
    #[must_use]
    pub fn executed(&self, proc: OsProc) -> u32 {
        self.workers
            .lock()
            .get(&proc)
            .map_or(0, |worker| worker.executed)
    }

    /// How many tasks the whole pool has completed.
    #[must_use]
    pub fn executed_total(&self) -> u32 {
        self.workers
            .lock()
            .values()
            .map(|worker| worker.executed)
            .sum()
    }

    fn after_task(&self, proc: OsProc) {
        let mut dropped = false;
        {
            let mut workers = self.workers.lock();
            if let Some(worker) = workers.get_mut(&proc) {
                worker.executed += 1;
                if let Some(remaining) = worker.fail_after.as_mut() {
                    *remaining = remaining.saturating_sub(1);
                    if *remaining == 0 {
                        worker.alive = false;
                        dropped = true;
                    }
                }
            }
        }
        if dropped {
            self.store.drop_worker(proc);
        }
    }
}

impl WorkerRuntime for LocalWorkerPool {
    async fn do_task(&self, proc: OsProc, request: TaskRequest) -> Result<TaskPayload, WorkerFailure> {
        {
            let workers = self.workers.lock();
            match workers.get(&proc) {
                Some(worker) if worker.alive => {}
                _ => return Err(WorkerFailure::Exited { proc }),
            }
        }

        let TaskRequest {
            f,
            args: wire_args,
            send_result,
            persist,
            options,
            handle,
            ..
        } = request;

        // Fetch chunk arguments from this worker's point of view.
        let mut args = Vec::with_capacity(wire_args.len());
        for arg in wire_args {
            match arg {
                TaskArg::Immediate(value) => args.push(value),
                TaskArg::Chunk(chunk) => match self.store.materialize(&chunk).await {
                    Ok(value) => args.push(value),
                    Err(err) => {
                        return Err(WorkerFailure::Failed {
                            proc,
                            reason: err.into(),
                        });
                    }
                },
            }
        }

        // The scheduler picked the host; the processor within it is picked
        // here.
        let kinds = self
            .workers
            .lock()
            .get(&proc)
            .map(|worker| worker.kinds.clone())
            .unwrap_or_default();
        if choose_processor(&kinds, &options).is_none() {
            return Err(WorkerFailure::Failed {
                proc,
                reason: "no eligible processor".into(),
            });
        }

        // Task functions are synchronous; run them off the async threads.
        // A panic is captured and reported like any other task failure.
        let invocation = TaskInvocation { args, handle };
        let outcome =
            tokio::task::spawn_blocking(move || catch_unwind(AssertUnwindSafe(|| f(invocation))))
                .await;

        let value = match outcome {
            Ok(Ok(Ok(value))) => value,
            Ok(Ok(Err(reason))) => return Err(WorkerFailure::Failed { proc, reason }),
            Ok(Err(_panic)) => {
                return Err(WorkerFailure::Failed {
                    proc,
                    reason: "task panicked".into(),
                });
            }
            Err(join_error) => {
                return Err(WorkerFailure::Failed {
                    proc,
                    reason: join_error.into(),
                });
            }
        };

        let payload = if send_result {
            TaskPayload::Value(value)
        } else {
            TaskPayload::Chunk(self.store.put(proc, value, persist).await)
        };

        self.after_task(proc);

        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use dagmill_chunk::Value;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::options::ThunkOptions;
    use crate::thunk::{TaskFn, delayed};

    const W1: OsProc = OsProc::new(1);

    fn request(f: TaskFn, send_result: bool) -> TaskRequest {
        TaskRequest {
            thunk: delayed(|_| Ok(Value::new(()))).build().id(),
            f,
            args: Vec::new(),
            send_result,
            persist: false,
            cache: false,
            options: ThunkOptions::default(),
            handle: None,
        }
    }

    fn forty_two() -> TaskFn {
        Arc::new(|_| Ok(Value::new(42_i64)))
    }

    #[tokio::test]
    async fn runs_task_and_returns_raw_value() {
        let (pool, _procs) = LocalWorkerPool::new(1);

        let payload = pool.do_task(W1, request(forty_two(), true)).await.unwrap();

        assert!(matches!(payload, TaskPayload::Value(v) if v.get::<i64>() == Some(42)));
        assert_eq!(pool.executed(W1), 1);
    }

    #[tokio::test]
    async fn wraps_result_in_owned_chunk_by_default() {
        let (pool, _procs) = LocalWorkerPool::new(1);

        let payload = pool.do_task(W1, request(forty_two(), false)).await.unwrap();

        let TaskPayload::Chunk(chunk) = payload else {
            panic!("expected a chunk payload");
        };
        assert_eq!(chunk.owner(), W1);
        let value = pool.store().materialize(&chunk).await.unwrap();
        assert_eq!(value.get::<i64>(), Some(42));
    }

    #[tokio::test]
    async fn killed_worker_reports_exited() {
        let (pool, procs) = LocalWorkerPool::new(2);
        pool.kill(procs[0]);

        let result = pool.do_task(procs[0], request(forty_two(), true)).await;

        assert!(matches!(result, Err(WorkerFailure::Exited { proc }) if proc == procs[0]));
    }

    #[tokio::test]
    async fn scripted_death_takes_result_chunks_along() {
        let (pool, _procs) = LocalWorkerPool::new(1);
        pool.fail_after(W1, 1);

        let payload = pool.do_task(W1, request(forty_two(), false)).await.unwrap();
        let TaskPayload::Chunk(chunk) = payload else {
            panic!("expected a chunk payload");
        };

        // The task completed, but the worker died right after: the chunk is
        // gone and further dispatches report the death.
        assert!(pool.store().materialize(&chunk).await.is_err());
        let result = pool.do_task(W1, request(forty_two(), true)).await;
        assert!(matches!(result, Err(WorkerFailure::Exited { .. })));
    }

    #[tokio::test]
    async fn panicking_task_is_a_task_failure() {
        let (pool, _procs) = LocalWorkerPool::new(1);
        let f: TaskFn = Arc::new(|_| panic!("boom"));

        let result = pool.do_task(W1, request(f, true)).await;

        assert!(matches!(result, Err(WorkerFailure::Failed { .. })));
    }

    #[tokio::test]
    async fn ineligible_proctypes_fail_the_task() {
        let (pool, _procs) = LocalWorkerPool::new(1);
        let mut request = request(forty_two(), true);
        request.options.proctypes = vec![ProcKind::Gpu];

        let result = pool.do_task(W1, request).await;

        assert!(matches!(result, Err(WorkerFailure::Failed { .. })));
    }
}
