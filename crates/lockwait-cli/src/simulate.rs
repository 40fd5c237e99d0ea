//! Lock-wait scenarios run against a real lock manager
//!
//! Each worker runs on a blocking task, since waiting for a lock parks the
//! thread.

use anyhow::{Context, anyhow};
use lockwait_core::Error;
use lockwait_core::lock::{LockManager, LockMode, LockTag};
use lockwait_core::proc::ProcKind;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};
use tokio::task::spawn_blocking;
use tracing::debug;

/// Outcome of one simulation
#[derive(Debug, Default, Serialize)]
pub struct SimulationReport {
    pub scenario: String,
    pub workers: usize,
    pub granted: usize,
    pub deadlocks: usize,
    pub timeouts: usize,
    pub cancelled: usize,
    pub other_errors: Vec<String>,
    pub elapsed_ms: u64,
    pub events: BTreeMap<String, usize>,
}

impl SimulationReport {
    fn new(scenario: &str, workers: usize) -> Self {
        Self {
            scenario: scenario.to_string(),
            workers,
            ..Default::default()
        }
    }

    fn record(&mut self, result: lockwait_core::Result<()>) {
        match result {
            Ok(()) => self.granted += 1,
            Err(Error::Deadlock { .. }) => self.deadlocks += 1,
            Err(Error::LockTimeout { .. }) => self.timeouts += 1,
            Err(Error::Cancelled { .. }) => self.cancelled += 1,
            Err(e) => self.other_errors.push(format!("[{}] {}", e.code(), e)),
        }
    }

    fn finish(mut self, manager: &LockManager, started: Instant) -> Self {
        self.elapsed_ms = started.elapsed().as_millis() as u64;
        if let Some(mut rx) = manager.subscribe_events() {
            while let Ok(event) = rx.try_recv() {
                *self.events.entry(event.event_type.to_string()).or_insert(0) += 1;
            }
        }
        self
    }
}

fn modes(manager: &LockManager) -> anyhow::Result<(LockMode, LockMode)> {
    let conflicts = manager.conflicts();
    let shared = conflicts
        .mode("shared")
        .ok_or_else(|| anyhow!("conflict table has no shared mode"))?;
    let exclusive = conflicts
        .mode("exclusive")
        .ok_or_else(|| anyhow!("conflict table has no exclusive mode"))?;
    Ok((shared, exclusive))
}

/// Many workers mixing shared and exclusive requests on one resource
pub async fn contention(
    manager: LockManager,
    workers: usize,
    rounds: usize,
) -> anyhow::Result<SimulationReport> {
    let (shared, exclusive) = modes(&manager)?;
    let tag = LockTag::new(1);
    let started = Instant::now();

    let mut tasks = Vec::with_capacity(workers);
    for i in 0..workers {
        let mut worker = manager.attach(ProcKind::Regular)?;
        tasks.push(spawn_blocking(move || {
            let mut results = Vec::with_capacity(rounds);
            for round in 0..rounds {
                let mode = if (i + round) % 4 == 0 { exclusive } else { shared };
                let result = worker.acquire(tag, mode);
                if result.is_ok() {
                    std::thread::sleep(Duration::from_millis(1));
                    if let Err(e) = worker.release(tag, mode) {
                        results.push(Err(e));
                        continue;
                    }
                }
                results.push(result);
            }
            results
        }));
    }

    let mut report = SimulationReport::new("contention", workers);
    for task in tasks {
        for result in task.await.context("worker task panicked")? {
            report.record(result);
        }
    }
    Ok(report.finish(&manager, started))
}

/// A ring of workers, each holding one resource and wanting the next
pub async fn deadlock(manager: LockManager, workers: usize) -> anyhow::Result<SimulationReport> {
    if workers < 2 {
        return Err(anyhow!("a deadlock needs at least 2 workers"));
    }
    let (_, exclusive) = modes(&manager)?;
    let tags: Vec<LockTag> = (0..workers as u64).map(|i| LockTag::new(100 + i)).collect();
    let barrier = Arc::new(Barrier::new(workers));
    let started = Instant::now();

    let mut tasks = Vec::with_capacity(workers);
    for i in 0..workers {
        let mut worker = manager.attach(ProcKind::Regular)?;
        let barrier = barrier.clone();
        let mine = tags[i];
        let next = tags[(i + 1) % workers];
        tasks.push(spawn_blocking(move || {
            worker.acquire(mine, exclusive)?;
            barrier.wait();
            let result = worker.acquire(next, exclusive);
            debug!(worker = %worker.id(), ok = result.is_ok(), "Ring member finished waiting");
            worker.release_all()?;
            result
        }));
    }

    let mut report = SimulationReport::new("deadlock", workers);
    for task in tasks {
        report.record(task.await.context("worker task panicked")?);
    }
    Ok(report.finish(&manager, started))
}

/// One worker waiting on a resource held past its lock timeout
pub async fn timeout(manager: LockManager) -> anyhow::Result<SimulationReport> {
    if manager.config().lock_timeout().is_none() {
        return Err(anyhow!("lock timeout is disabled; pass --lock-timeout-ms"));
    }
    let (shared, exclusive) = modes(&manager)?;
    let tag = LockTag::new(200);
    let started = Instant::now();

    let mut holder = manager.attach(ProcKind::Regular)?;
    holder.acquire(tag, exclusive)?;

    let mut waiter = manager.attach(ProcKind::Regular)?;
    let result = spawn_blocking(move || waiter.acquire(tag, shared))
        .await
        .context("worker task panicked")?;
    holder.release_all()?;

    let mut report = SimulationReport::new("timeout", 2);
    report.record(result);
    Ok(report.finish(&manager, started))
}

/// One worker waiting on a held resource until it is cancelled
pub async fn cancel(manager: LockManager) -> anyhow::Result<SimulationReport> {
    let (_, exclusive) = modes(&manager)?;
    let tag = LockTag::new(300);
    let started = Instant::now();

    let mut holder = manager.attach(ProcKind::Regular)?;
    holder.acquire(tag, exclusive)?;

    let mut waiter = manager.attach(ProcKind::Regular)?;
    let waiter_id = waiter.id();
    let task = spawn_blocking(move || waiter.acquire(tag, exclusive));

    let deadline = Instant::now() + Duration::from_secs(10);
    while !manager.cancel_pending_wait(waiter_id) {
        if Instant::now() > deadline {
            return Err(anyhow!("worker {} never started waiting", waiter_id));
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let result = task.await.context("worker task panicked")?;
    holder.release_all()?;

    let mut report = SimulationReport::new("cancel", 2);
    report.record(result);
    Ok(report.finish(&manager, started))
}
