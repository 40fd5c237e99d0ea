//! Lock manager: shared state, worker attachment and the timer callbacks
//!
//! The manager owns everything workers share:
//! - the partitioned lock table and its conflict table
//! - the process registry
//! - the timer thread and the deadlock detector it triggers
//! - an optional channel of lock-wait events

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::deadlock::WaitGraph;
use super::event::LockWaitEvent;
use super::table::{LockSnapshot, LockTable, Partition};
use super::types::{ConflictTable, DeadlockState, LockTag};
use super::worker::Worker;
use crate::config::LockingConfig;
use crate::error::{Error, Result};
use crate::proc::{ProcArray, ProcId, ProcKind, ProcessHandle};
use crate::timer::{TimeoutHandler, TimeoutKind, TimerService};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// State shared by all workers and the timer thread
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) config: LockingConfig,
    pub(crate) table: LockTable,
    pub(crate) procs: ProcArray,
    events: mpsc::Sender<LockWaitEvent>,
    graph: Mutex<WaitGraph>,
}

impl Shared {
    pub(crate) fn conflicts(&self) -> &ConflictTable {
        self.table.conflicts()
    }

    /// Publish an event without blocking; dropped if nobody keeps up
    pub(crate) fn publish(&self, event: LockWaitEvent) {
        if let Err(e) = self.events.try_send(event) {
            debug!(error = %e, "Dropped lock-wait event");
        }
    }

    fn is_background(&self, proc: ProcId) -> bool {
        self.procs
            .get(proc)
            .is_some_and(|h| h.kind() == ProcKind::Background)
    }

    /// Run the deadlock check on behalf of a waiter whose timer fired
    ///
    /// Takes every partition in ascending order so the graph is a
    /// consistent snapshot, and releases them in reverse.
    pub(crate) fn check_deadlock(&self, proc: ProcId, generation: u64) {
        let Some(handle) = self.procs.get(proc) else {
            return;
        };

        let mut guards = self.table.lock_all();

        // The wait may have ended while we were acquiring the partitions.
        let Some(home) = guards.iter().position(|p| p.links().is_linked(proc)) else {
            LockTable::unlock_all(guards);
            return;
        };
        if handle.generation() != generation || !handle.is_waiting() {
            LockTable::unlock_all(guards);
            return;
        }

        let mut graph = self.graph.lock();
        graph.clear();
        for part in guards.iter() {
            add_partition(&mut graph, part);
        }
        let verdict = graph.check(proc, self.conflicts(), |p| self.is_background(p));
        drop(graph);
        handle.set_indicator(TimeoutKind::DeadlockCheck, true);

        match verdict.state {
            DeadlockState::HardDeadlock => {
                warn!(
                    proc = %proc,
                    cycle = %verdict.describe(),
                    "Deadlock detected"
                );
                handle.set_deadlock_state(DeadlockState::HardDeadlock);
                if let Err(e) = guards[home].remove_from_wait_queue(proc, self.conflicts(), &self.procs) {
                    warn!(proc = %proc, error = %e, "Failed to remove deadlocked waiter");
                }
                handle.signal();
            }
            DeadlockState::SoftDeadlock => {
                if let Some(reorder) = verdict.reorder {
                    let index = self.table.partition_index(reorder.lock);
                    let part = &mut guards[index];
                    match part.reorder_before(reorder.lock, reorder.waiter, reorder.before) {
                        Ok(()) => {
                            info!(
                                proc = %proc,
                                lock = %reorder.lock,
                                moved = %reorder.waiter,
                                before = %reorder.before,
                                "Rearranged wait queue to avoid deadlock"
                            );
                            part.wake_waiters(reorder.lock, self.conflicts(), &self.procs);
                        }
                        Err(e) => warn!(proc = %proc, error = %e, "Failed to rearrange wait queue"),
                    }
                }
                handle.set_deadlock_state(DeadlockState::SoftDeadlock);
                if self.config.log_lock_waits {
                    handle.signal();
                }
            }
            DeadlockState::BlockedByBackgroundTask => {
                handle.set_background_blocker(verdict.background_blocker);
                handle.set_deadlock_state(DeadlockState::BlockedByBackgroundTask);
                handle.signal();
            }
            DeadlockState::NoDeadlock | DeadlockState::NotYetChecked => {
                handle.set_deadlock_state(DeadlockState::NoDeadlock);
                if self.config.log_lock_waits {
                    handle.signal();
                }
            }
        }

        LockTable::unlock_all(guards);
    }

    fn lock_timeout(&self, proc: ProcId, generation: u64) {
        let Some(handle) = self.procs.get(proc) else {
            return;
        };
        if handle.generation() != generation || !handle.is_waiting() {
            debug!(proc = %proc, "Ignoring stale lock timeout");
            return;
        }
        handle.set_indicator(TimeoutKind::LockTimeout, true);
        handle.request_cancel_wait(generation);
    }
}

fn add_partition(graph: &mut WaitGraph, part: &Partition) {
    let links = part.links();
    for lock in part.locks.values() {
        if lock.queue().is_empty() {
            continue;
        }
        graph.add_lock(
            lock.tag(),
            lock.holders(),
            lock.queue().iter(links).map(|p| (p, links.slot(p).mode)),
        );
    }
}

impl TimeoutHandler for Shared {
    fn on_timeout(&self, proc: ProcId, kind: TimeoutKind, generation: u64) {
        match kind {
            TimeoutKind::DeadlockCheck => self.check_deadlock(proc, generation),
            TimeoutKind::LockTimeout => self.lock_timeout(proc, generation),
        }
    }
}

/// Entry point for workers taking locks on shared resources
///
/// Cloning is cheap; all clones share one lock table, registry and timer
/// thread.
#[derive(Debug, Clone)]
pub struct LockManager {
    pub(crate) shared: Arc<Shared>,
    pub(crate) timers: Arc<TimerService>,
    events_rx: Arc<Mutex<Option<mpsc::Receiver<LockWaitEvent>>>>,
}

impl LockManager {
    /// Create a lock manager with the given configuration
    pub fn new(config: LockingConfig, conflicts: ConflictTable) -> Result<Self> {
        config.validate()?;

        let (events, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            table: LockTable::new(conflicts, config.num_partitions, config.max_workers),
            procs: ProcArray::new(config.max_workers),
            graph: Mutex::new(WaitGraph::with_capacity(config.max_workers)),
            events,
            config,
        });
        let timers = TimerService::start(shared.clone())
            .map_err(|e| Error::TimerUnavailable(e.to_string()))?;

        info!(
            max_workers = shared.config.max_workers,
            partitions = shared.config.num_partitions,
            modes = shared.conflicts().num_modes(),
            "Lock manager started"
        );

        Ok(Self {
            shared,
            timers: Arc::new(timers),
            events_rx: Arc::new(Mutex::new(Some(events_rx))),
        })
    }

    /// Create a lock manager with default configuration and shared/exclusive modes
    pub fn with_defaults() -> Result<Self> {
        Self::new(LockingConfig::default(), ConflictTable::shared_exclusive())
    }

    pub fn config(&self) -> &LockingConfig {
        &self.shared.config
    }

    pub fn conflicts(&self) -> &ConflictTable {
        self.shared.conflicts()
    }

    /// Attach a new worker, taking a registry slot
    pub fn attach(&self, kind: ProcKind) -> Result<Worker> {
        let handle = self.shared.procs.attach(kind)?;
        Ok(Worker::new(self.clone(), handle))
    }

    /// Take the receiving end of the lock-wait event channel
    ///
    /// Only the first caller gets it.
    pub fn subscribe_events(&self) -> Option<mpsc::Receiver<LockWaitEvent>> {
        self.events_rx.lock().take()
    }

    /// Interrupt a worker that is currently waiting for a lock
    ///
    /// Returns false if the worker is not attached or not waiting.
    pub fn cancel_pending_wait(&self, proc: ProcId) -> bool {
        let Some(handle) = self.shared.procs.lookup(proc) else {
            return false;
        };
        // The wait seen as waiting must be the one the cancel is aimed at.
        let generation = handle.generation();
        if !handle.is_waiting() || handle.generation() != generation {
            return false;
        }
        debug!(proc = %proc, generation, "Cancelling lock wait");
        handle.request_cancel_wait(generation);
        true
    }

    pub fn lookup_handle(&self, proc: ProcId) -> Option<Arc<ProcessHandle>> {
        self.shared.procs.lookup(proc)
    }

    /// Holders and waiters of one lock, or `None` if it is unused
    pub fn lock_status(&self, tag: LockTag) -> Option<LockSnapshot> {
        self.shared.table.snapshot(tag)
    }

    /// Snapshot of every lock currently in the table
    pub fn all_locks(&self) -> Vec<LockSnapshot> {
        let guards = self.shared.table.lock_all();
        let mut snapshots: Vec<_> = guards
            .iter()
            .flat_map(|part| {
                part.locks
                    .keys()
                    .filter_map(|tag| part.snapshot(*tag))
                    .collect::<Vec<_>>()
            })
            .collect();
        LockTable::unlock_all(guards);
        snapshots.sort_by_key(|s| s.tag);
        snapshots
    }

    /// Number of registry slots still free
    pub fn free_slots(&self) -> usize {
        self.shared.procs.free_count()
    }

    /// Whether at least `n` registry slots are free
    pub fn have_free_slots(&self, n: usize) -> bool {
        self.shared.procs.have_free(n)
    }

    /// Count of waiters per lock, for diagnostics
    pub fn wait_counts(&self) -> HashMap<LockTag, usize> {
        self.all_locks()
            .into_iter()
            .filter(|s| !s.waiters.is_empty())
            .map(|s| (s.tag, s.waiters.len()))
            .collect()
    }
}
