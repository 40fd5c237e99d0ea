//! Tearing down an abandoned wait

use tracing::debug;

use super::types::WaitStatus;
use super::worker::Worker;
use crate::error::{Error, Result};
use crate::timer::TimeoutKind;

impl Worker {
    /// Stop waiting for the awaited lock, if any
    ///
    /// Called when a wait is interrupted and on detach. If the worker is
    /// still queued it is unlinked and the waiters behind it are offered the
    /// lock. If a releaser granted the lock in the meantime the grant is
    /// kept and recorded locally. Calling this with no wait outstanding does
    /// nothing.
    pub fn cleanup_pending_wait(&mut self) -> Result<()> {
        let Some((tag, mode)) = self.awaited else {
            return Ok(());
        };
        let shared = self.manager.shared.clone();
        let me = self.id();

        self.manager.timers.disarm_many(
            &self.handle,
            &[
                (TimeoutKind::DeadlockCheck, false),
                (TimeoutKind::LockTimeout, true),
            ],
        );

        let mut part = shared.table.partition_for(tag);
        let mut granted = false;

        if part.links().is_linked(me) {
            let queued_on = part.links().slot(me).lock;
            if queued_on != Some(tag) {
                return Err(Error::InvariantViolation(format!(
                    "worker {} awaits {} but is queued on {:?}",
                    me, tag, queued_on
                )));
            }
            part.remove_from_wait_queue(me, shared.conflicts(), &shared.procs)?;
            debug!(proc = %me, lock = %tag, "Removed abandoned waiter from queue");
        } else if self.handle.wait_status() == WaitStatus::Granted {
            granted = true;
        }

        self.handle.set_wait_status(WaitStatus::Idle);
        self.awaited = None;
        drop(part);

        if granted {
            debug!(proc = %me, lock = %tag, mode = %mode, "Keeping lock granted during cleanup");
            self.record_grant(tag, mode);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::LockingConfig;
    use crate::lock::table::Partition;
    use crate::lock::{ConflictTable, LockManager, LockMode, LockTag, WaitStatus};
    use crate::proc::ProcKind;

    const EXCLUSIVE: LockMode = LockMode::new(2);

    #[test]
    fn test_cleanup_without_wait_is_noop() {
        let manager = LockManager::new(
            LockingConfig::default().with_max_workers(1),
            ConflictTable::shared_exclusive(),
        )
        .unwrap();
        let mut worker = manager.attach(ProcKind::Regular).unwrap();
        worker.acquire(LockTag::new(1), LockMode::new(1)).unwrap();

        worker.cleanup_pending_wait().unwrap();
        worker.cleanup_pending_wait().unwrap();
        assert_eq!(worker.held_locks().len(), 1);
        assert!(worker.awaited().is_none());
    }

    #[test]
    fn test_grant_racing_cancel_is_kept_and_released() {
        let manager = LockManager::new(
            LockingConfig::default().with_max_workers(2),
            ConflictTable::shared_exclusive(),
        )
        .unwrap();
        let tag = LockTag::new(7);
        let mut holder = manager.attach(ProcKind::Regular).unwrap();
        holder.acquire(tag, EXCLUSIVE).unwrap();
        let mut waiter = manager.attach(ProcKind::Regular).unwrap();
        let me = waiter.id();

        // Queue the waiter by hand, as the sleep path would.
        {
            let mut part = manager.shared.table.partition_for(tag);
            let Partition { locks, links, .. } = &mut *part;
            let lock = locks.get_mut(&tag).unwrap();
            lock.queue.insert_before(links, me, None);
            let slot = links.slot_mut(me);
            slot.lock = Some(tag);
            slot.mode = EXCLUSIVE;
            lock.add_wait_mode(EXCLUSIVE);
            waiter.handle.begin_wait();
            waiter.handle.set_wait_status(WaitStatus::Waiting);
        }
        waiter.awaited = Some((tag, EXCLUSIVE));

        // The release grants the lock, then the cancel arrives.
        holder.release(tag, EXCLUSIVE).unwrap();
        assert_eq!(waiter.handle().wait_status(), WaitStatus::Granted);
        waiter.handle().request_cancel();

        waiter.cleanup_pending_wait().unwrap();
        assert!(waiter.awaited().is_none());
        assert_eq!(waiter.held_locks(), vec![(tag, EXCLUSIVE, 1)]);
        let status = manager.lock_status(tag).unwrap();
        assert_eq!(status.holders.len(), 1);
        assert_eq!(status.holders[0].0, me);
        assert!(status.waiters.is_empty());

        waiter.release_all().unwrap();
        assert!(waiter.held_locks().is_empty());
        assert!(manager.lock_status(tag).is_none());
    }
}
