//! Per-worker lock bookkeeping and the immediate acquire/release paths
//!
//! A `Worker` owns one registry slot for its lifetime. Besides the shared
//! lock table it keeps a local count of how often it took each
//! `(resource, mode)` pair, so repeated acquisitions of a mode it already
//! holds never touch shared state.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::manager::LockManager;
use super::types::{AcquireOutcome, LockMask, LockMode, LockTag, QueueDiscipline};
use crate::error::{Error, Result};
use crate::proc::{ProcId, ProcKind, ProcessHandle};

/// A registered participant that can take, wait for and release locks
#[derive(Debug)]
pub struct Worker {
    pub(super) manager: LockManager,
    pub(super) handle: Arc<ProcessHandle>,
    pub(super) held: HashMap<(LockTag, LockMode), u32>,
    /// Lock this worker is queued for, cleared once the wait is resolved
    pub(super) awaited: Option<(LockTag, LockMode)>,
    detached: bool,
}

impl Worker {
    pub(super) fn new(manager: LockManager, handle: Arc<ProcessHandle>) -> Self {
        Self {
            manager,
            handle,
            held: HashMap::new(),
            awaited: None,
            detached: false,
        }
    }

    pub fn id(&self) -> ProcId {
        self.handle.id()
    }

    pub fn kind(&self) -> ProcKind {
        self.handle.kind()
    }

    pub fn handle(&self) -> &Arc<ProcessHandle> {
        &self.handle
    }

    pub fn manager(&self) -> &LockManager {
        &self.manager
    }

    /// Lock currently being waited for, if any
    pub fn awaited(&self) -> Option<(LockTag, LockMode)> {
        self.awaited
    }

    /// Whether another worker asked this one to give up
    ///
    /// Background workers poll this between units of work.
    pub fn cancel_requested(&self) -> bool {
        self.handle.cancel_requested()
    }

    /// Modes this worker holds on `tag`
    pub fn held_modes(&self, tag: LockTag) -> LockMask {
        self.held
            .keys()
            .filter(|(t, _)| *t == tag)
            .fold(LockMask::EMPTY, |mask, (_, mode)| mask.with(*mode))
    }

    /// Every `(resource, mode)` this worker holds, with its local count
    pub fn held_locks(&self) -> Vec<(LockTag, LockMode, u32)> {
        let mut locks: Vec<_> = self
            .held
            .iter()
            .map(|((tag, mode), count)| (*tag, *mode, *count))
            .collect();
        locks.sort();
        locks
    }

    pub(super) fn record_grant(&mut self, tag: LockTag, mode: LockMode) {
        *self.held.entry((tag, mode)).or_insert(0) += 1;
    }

    /// Try to take `mode` on `tag` without waiting
    ///
    /// With `RespectQueue` a request that conflicts with any queued
    /// waiter's mode is refused even if the holders would allow it.
    pub fn try_acquire(
        &mut self,
        tag: LockTag,
        mode: LockMode,
        discipline: QueueDiscipline,
    ) -> Result<AcquireOutcome> {
        let shared = self.manager.shared.clone();
        let conflicts = shared.conflicts();
        conflicts.validate(mode)?;

        if let Some(count) = self.held.get_mut(&(tag, mode)) {
            *count += 1;
            return Ok(AcquireOutcome::Granted);
        }

        let me = self.id();
        let mut part = shared.table.partition_for(tag);
        let lock = part.lock_or_insert(tag);

        let queue_blocks = discipline == QueueDiscipline::RespectQueue
            && conflicts.conflicts_with(mode, lock.wait_mask());
        if queue_blocks || lock.conflicts_with_holders(conflicts, mode, me) {
            part.collect_garbage(tag);
            debug!(proc = %me, lock = %tag, mode = %mode, "Lock request would block");
            return Ok(AcquireOutcome::WouldBlock);
        }

        lock.grant(me, mode);
        drop(part);

        self.record_grant(tag, mode);
        debug!(proc = %me, lock = %tag, mode = %mode, "Granted lock immediately");
        Ok(AcquireOutcome::Granted)
    }

    /// Take `mode` on `tag`, waiting if necessary
    pub fn acquire(&mut self, tag: LockTag, mode: LockMode) -> Result<()> {
        match self.try_acquire(tag, mode, QueueDiscipline::RespectQueue)? {
            AcquireOutcome::Granted => Ok(()),
            AcquireOutcome::WouldBlock => self.sleep_until_granted(tag, mode),
        }
    }

    /// Release one hold of `mode` on `tag` and wake whoever it unblocks
    pub fn release(&mut self, tag: LockTag, mode: LockMode) -> Result<()> {
        let key = (tag, mode);
        match self.held.get_mut(&key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                return Ok(());
            }
            Some(_) => {
                self.held.remove(&key);
            }
            None => {
                return Err(Error::NotHeld {
                    worker: self.id(),
                    resource: tag,
                    mode,
                });
            }
        }
        self.release_shared(tag, mode)
    }

    fn release_shared(&self, tag: LockTag, mode: LockMode) -> Result<()> {
        let shared = &self.manager.shared;
        let me = self.id();
        let mut part = shared.table.partition_for(tag);

        let released = part.lock_mut(tag).is_some_and(|lock| lock.ungrant(me, mode));
        if !released {
            return Err(Error::InvariantViolation(format!(
                "worker {} recorded mode {} on {} but the lock table disagrees",
                me, mode, tag
            )));
        }

        let woken = part.wake_waiters(tag, shared.conflicts(), &shared.procs);
        part.collect_garbage(tag);
        debug!(proc = %me, lock = %tag, mode = %mode, woken, "Released lock");
        Ok(())
    }

    /// Release every lock this worker holds
    ///
    /// Keeps going after a failure and reports the first one.
    pub fn release_all(&mut self) -> Result<()> {
        let mut first_err = None;
        let held: Vec<_> = self.held.drain().map(|(key, _)| key).collect();
        for (tag, mode) in held {
            if let Err(e) = self.release_shared(tag, mode) {
                warn!(proc = %self.id(), error = %e, "Failed to release lock");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Abandon any wait, release all locks and give the slot back
    pub fn detach(mut self) -> Result<()> {
        let result = self.shutdown();
        self.detached = true;
        result
    }

    fn shutdown(&mut self) -> Result<()> {
        let me = self.id();
        let cleanup = self.cleanup_pending_wait();
        let release = self.release_all();

        self.manager.timers.forget(me);
        self.manager.shared.procs.detach(me);
        debug!(proc = %me, "Worker detached");

        cleanup.and(release)
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        if let Err(e) = self.shutdown() {
            warn!(proc = %self.id(), error = %e, "Worker shutdown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LockingConfig;
    use crate::lock::types::ConflictTable;

    const SHARED: LockMode = LockMode::new(1);
    const EXCLUSIVE: LockMode = LockMode::new(2);

    fn manager() -> LockManager {
        LockManager::new(
            LockingConfig::default().with_max_workers(4),
            ConflictTable::shared_exclusive(),
        )
        .unwrap()
    }

    #[test]
    fn test_reentrant_acquire_counts_locally() {
        let manager = manager();
        let mut worker = manager.attach(ProcKind::Regular).unwrap();
        let tag = LockTag::new(1);

        worker.acquire(tag, EXCLUSIVE).unwrap();
        worker.acquire(tag, EXCLUSIVE).unwrap();
        assert_eq!(worker.held_locks(), vec![(tag, EXCLUSIVE, 2)]);

        worker.release(tag, EXCLUSIVE).unwrap();
        assert!(manager.lock_status(tag).is_some());
        worker.release(tag, EXCLUSIVE).unwrap();
        assert!(manager.lock_status(tag).is_none());

        let err = worker.release(tag, EXCLUSIVE).unwrap_err();
        assert_eq!(err.code(), "E322");
    }

    #[test]
    fn test_try_acquire_reports_would_block() {
        let manager = manager();
        let mut a = manager.attach(ProcKind::Regular).unwrap();
        let mut b = manager.attach(ProcKind::Regular).unwrap();
        let tag = LockTag::new(2);

        a.acquire(tag, SHARED).unwrap();
        assert_eq!(
            b.try_acquire(tag, EXCLUSIVE, QueueDiscipline::RespectQueue).unwrap(),
            AcquireOutcome::WouldBlock
        );
        assert_eq!(
            b.try_acquire(tag, SHARED, QueueDiscipline::RespectQueue).unwrap(),
            AcquireOutcome::Granted
        );
        assert_eq!(b.held_modes(tag), LockMask::bit(SHARED));
    }

    #[test]
    fn test_upgrade_without_other_holders() {
        let manager = manager();
        let mut worker = manager.attach(ProcKind::Regular).unwrap();
        let tag = LockTag::new(3);

        worker.acquire(tag, SHARED).unwrap();
        worker.acquire(tag, EXCLUSIVE).unwrap();
        assert_eq!(worker.held_modes(tag), LockMask::bit(SHARED).with(EXCLUSIVE));
    }

    #[test]
    fn test_invalid_mode_rejected() {
        let manager = manager();
        let mut worker = manager.attach(ProcKind::Regular).unwrap();
        let err = worker
            .try_acquire(LockTag::new(1), LockMode::new(7), QueueDiscipline::IgnoreQueue)
            .unwrap_err();
        assert_eq!(err.code(), "E321");
    }

    #[test]
    fn test_drop_releases_locks_and_slot() {
        let manager = manager();
        let tag = LockTag::new(4);
        {
            let mut worker = manager.attach(ProcKind::Regular).unwrap();
            worker.acquire(tag, EXCLUSIVE).unwrap();
            assert_eq!(manager.free_slots(), 3);
        }
        assert_eq!(manager.free_slots(), 4);
        assert!(manager.lock_status(tag).is_none());
    }

    #[test]
    fn test_detach_reports_success() {
        let manager = manager();
        let mut worker = manager.attach(ProcKind::Background).unwrap();
        worker.acquire(LockTag::new(5), SHARED).unwrap();
        assert!(worker.detach().is_ok());
        assert_eq!(manager.free_slots(), 4);
    }
}
