// Copyright (c) the Dagmill Project Authors.
// Licensed under the MIT License.

//! The dynamic control channel: running tasks talking back to the
//! scheduler.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dagmill::testing::{LocalWorkerPool, MemoryChunkStore};
use dagmill::{
    DynamicCommand, Error, OsProc, Scheduler, SchedulerHandle, Value, delayed,
};

fn scheduler_for(
    pool: &Arc<LocalWorkerPool>,
    procs: &[OsProc],
) -> Scheduler<LocalWorkerPool, MemoryChunkStore> {
    Scheduler::builder(Arc::clone(pool), pool.store())
        .procs(procs.iter().copied())
        .build()
}

/// Halts the run and then waits for the scheduler to close the channels,
/// so the completion (if any) can only be an orphan.
fn halt_and_linger(handle: &SchedulerHandle) {
    let _ = handle.halt_blocking();
    while handle.recv_blocking().is_ok() {}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dynamic_halt_stops_the_run() {
    let (pool, procs) = LocalWorkerPool::new(2);
    let scheduler = scheduler_for(&pool, &procs);

    let escaped: Arc<Mutex<Option<SchedulerHandle>>> = Arc::new(Mutex::new(None));
    let escaped_clone = Arc::clone(&escaped);

    let halter = delayed(move |inv| {
        let handle = inv.handle()?;
        *escaped_clone.lock().unwrap() = Some(handle.clone());
        halt_and_linger(handle);
        Err("halted".into())
    })
    .dynamic(true)
    .build();

    let result = scheduler.compute_dag(&halter).await;

    assert!(matches!(result, Err(Error::Halted)));

    // Teardown closed the worker channels; every handle clone now fails
    // cleanly.
    let handle = escaped.lock().unwrap().take().unwrap();
    assert!(matches!(
        handle.send_blocking(DynamicCommand::Halt, None),
        Err(Error::ChannelClosed)
    ));
    assert!(matches!(handle.recv_blocking(), Err(Error::ChannelClosed)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn halt_prevents_further_dispatches() {
    let (pool, procs) = LocalWorkerPool::new(2);
    let scheduler = scheduler_for(&pool, &procs);

    let downstream_ran = Arc::new(AtomicBool::new(false));
    let downstream_ran_clone = Arc::clone(&downstream_ran);

    let leaf = delayed(|_| Ok(Value::new(1_i64))).build();
    let halter = delayed(move |inv| {
        halt_and_linger(inv.handle()?);
        Err("halted".into())
    })
    .input(Arc::clone(&leaf))
    .dynamic(true)
    .build();
    let downstream = delayed(move |_| {
        downstream_ran_clone.store(true, Ordering::SeqCst);
        Ok(Value::new(()))
    })
    .input(Arc::clone(&halter))
    .build();

    let result = scheduler.compute_dag(&downstream).await;

    assert!(matches!(result, Err(Error::Halted)));
    assert!(!downstream_ran.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dynamic_task_reads_the_dag() {
    let (pool, procs) = LocalWorkerPool::new(2);
    let scheduler = scheduler_for(&pool, &procs);

    let leaf = delayed(|_| Ok(Value::new(1_i64))).build();
    let root = delayed(|inv| {
        let ids = inv.handle()?.dag_ids_blocking()?;
        Ok(Value::new(ids))
    })
    .input(Arc::clone(&leaf))
    .dynamic(true)
    .build();

    let result = scheduler.compute_dag(&root).await.unwrap();

    let ids = result.get::<HashMap<u64, HashSet<u64>>>().unwrap();
    assert_eq!(ids.len(), 2);
    assert_eq!(ids[&leaf.id().as_u64()], HashSet::from([root.id().as_u64()]));
    assert_eq!(ids[&root.id().as_u64()], HashSet::new());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_command_halts_the_run() {
    let (pool, procs) = LocalWorkerPool::new(2);
    let scheduler = scheduler_for(&pool, &procs);

    let confused = delayed(|inv| {
        let handle = inv.handle()?;
        let _ = handle.send_blocking(DynamicCommand::Other("frobnicate".into()), None);
        while handle.recv_blocking().is_ok() {}
        Err("halted".into())
    })
    .dynamic(true)
    .build();

    let result = scheduler.compute_dag(&confused).await;

    assert!(matches!(result, Err(Error::Halted)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_dynamic_thunks_get_no_handle() {
    let (pool, procs) = LocalWorkerPool::new(1);
    let scheduler = scheduler_for(&pool, &procs);

    let plain = delayed(|inv| Ok(Value::new(inv.handle.is_none()))).build();

    let result = scheduler.compute_dag(&plain).await.unwrap();

    assert_eq!(result.get::<bool>(), Some(true));
}
