//! Sleeping until a lock is granted
//!
//! A waiter first decides where it belongs in the queue. Workers that
//! already hold modes on the lock are let in ahead of any waiter that would
//! otherwise be stuck behind those very holds; if that waiter in turn holds
//! something the newcomer needs, both would wait forever and the request
//! fails right away. Everyone else queues at the tail.
//!
//! Once queued the waiter arms its timers and blocks on its semaphore. A
//! wakeup may come from a releaser granting the lock, from the deadlock
//! check, from a lock timeout or from a cancel; the waiter re-reads its
//! status after every one.

use std::time::Instant;
use tracing::{debug, info, warn};

use super::event::{LockWaitEvent, LockWaitEventType};
use super::queue::WaitLinks;
use super::table::{Lock, Partition};
use super::types::{ConflictTable, DeadlockState, LockMask, LockMode, LockTag, WaitStatus};
use super::worker::Worker;
use crate::error::{Error, Result};
use crate::proc::ProcId;
use crate::timer::TimeoutKind;

/// Where a new waiter goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// The request can be granted on the spot
    GrantNow,
    /// Link in front of the given waiter, or at the tail
    Enqueue(Option<ProcId>),
    /// Queuing would deadlock with the given waiter
    EarlyDeadlock(ProcId),
}

/// Decide where `me` should wait for `mode` on `lock`
pub fn choose_placement(
    lock: &Lock,
    links: &WaitLinks,
    conflicts: &ConflictTable,
    me: ProcId,
    mode: LockMode,
) -> Placement {
    let my_held = lock.held_by(me);
    if my_held.is_empty() {
        return Placement::Enqueue(None);
    }

    let my_conflicts = conflicts.conflicts(mode);
    let mut ahead = LockMask::EMPTY;

    for proc in lock.queue().iter(links) {
        let slot = links.slot(proc);
        if conflicts.conflicts(slot.mode).intersects(my_held) {
            // This waiter is blocked by something we hold.
            if my_conflicts.intersects(slot.held) {
                return Placement::EarlyDeadlock(proc);
            }
            if !my_conflicts.intersects(ahead)
                && !lock.conflicts_with_holders(conflicts, mode, me)
            {
                return Placement::GrantNow;
            }
            return Placement::Enqueue(Some(proc));
        }
        ahead = ahead.with(slot.mode);
    }

    Placement::Enqueue(None)
}

/// Outcome of the wait loop, before the wait is torn down
enum WakeReason {
    Resolved,
    Cancelled,
}

impl Worker {
    /// Queue for `mode` on `tag` and block until granted or failed
    ///
    /// Fails with `Deadlock`, `LockTimeout` or `Cancelled`. A grant that
    /// races a cancel is still recorded so that `release_all` frees it.
    pub fn sleep_until_granted(&mut self, tag: LockTag, mode: LockMode) -> Result<()> {
        let shared = self.manager.shared.clone();
        let conflicts = shared.conflicts();
        conflicts.validate(mode)?;
        let me = self.id();

        if let Some(count) = self.held.get_mut(&(tag, mode)) {
            *count += 1;
            return Ok(());
        }

        // An untargeted cancel delivered between waits is honoured by the
        // next one.
        if self.handle.interrupt_pending() {
            self.handle.clear_cancel();
            return Err(Error::Cancelled {
                worker: me,
                resource: tag,
            });
        }

        {
            let mut part = shared.table.partition_for(tag);
            let Partition { locks, links, .. } = &mut *part;
            let lock = locks
                .entry(tag)
                .or_insert_with(|| Lock::new(tag, conflicts.num_modes()));

            let grantable = !conflicts.conflicts_with(mode, lock.wait_mask())
                && !lock.conflicts_with_holders(conflicts, mode, me);
            let placement = if grantable {
                Placement::GrantNow
            } else {
                choose_placement(lock, links, conflicts, me, mode)
            };

            match placement {
                Placement::GrantNow => {
                    lock.grant(me, mode);
                    drop(part);
                    self.record_grant(tag, mode);
                    debug!(proc = %me, lock = %tag, mode = %mode, "Granted lock without waiting");
                    return Ok(());
                }
                Placement::EarlyDeadlock(other) => {
                    part.collect_garbage(tag);
                    warn!(
                        proc = %me,
                        lock = %tag,
                        mode = %mode,
                        other = %other,
                        "Deadlock detected before waiting"
                    );
                    return Err(Error::Deadlock {
                        worker: me,
                        resource: tag,
                        mode,
                    });
                }
                Placement::Enqueue(before) => {
                    let held = lock.held_by(me);
                    lock.queue.insert_before(links, me, before);
                    let slot = links.slot_mut(me);
                    slot.lock = Some(tag);
                    slot.mode = mode;
                    slot.held = held;
                    lock.add_wait_mode(mode);

                    self.handle.begin_wait();
                    self.handle.set_wait_status(WaitStatus::Waiting);
                    debug!(
                        proc = %me,
                        lock = %tag,
                        mode = %mode,
                        before = ?before,
                        "Queued for lock"
                    );
                }
            }
        }
        self.awaited = Some((tag, mode));

        let config = &shared.config;
        let mut timers = vec![(TimeoutKind::DeadlockCheck, config.deadlock_timeout())];
        if let Some(timeout) = config.lock_timeout() {
            timers.push((TimeoutKind::LockTimeout, timeout));
        }
        self.manager.timers.arm_many(&self.handle, &timers);

        let reason = self.wait_loop(tag, mode);

        if let WakeReason::Cancelled = reason {
            let timed_out = self.handle.indicator(TimeoutKind::LockTimeout);
            let waited_ms = self.waited_ms(TimeoutKind::LockTimeout);
            self.cleanup_pending_wait()?;
            self.handle.clear_cancel();
            return Err(if timed_out {
                Error::LockTimeout {
                    worker: me,
                    resource: tag,
                    mode,
                    waited_ms,
                }
            } else {
                Error::Cancelled {
                    worker: me,
                    resource: tag,
                }
            });
        }

        self.manager.timers.disarm_many(
            &self.handle,
            &[
                (TimeoutKind::DeadlockCheck, false),
                (TimeoutKind::LockTimeout, true),
            ],
        );

        let status = {
            let _part = shared.table.partition_for(tag);
            self.awaited = None;
            let status = self.handle.wait_status();
            self.handle.set_wait_status(WaitStatus::Idle);
            self.handle.clear_wait_cancel();
            status
        };

        match status {
            WaitStatus::Granted => {
                self.record_grant(tag, mode);
                Ok(())
            }
            WaitStatus::Error => Err(Error::Deadlock {
                worker: me,
                resource: tag,
                mode,
            }),
            other => Err(Error::InvariantViolation(format!(
                "worker {} woke with status {} while waiting on {}",
                me, other, tag
            ))),
        }
    }

    fn wait_loop(&self, tag: LockTag, mode: LockMode) -> WakeReason {
        let mut background_cancel_sent = false;

        loop {
            self.handle.semaphore().wait();

            if self.handle.cancel_requested() {
                return WakeReason::Cancelled;
            }

            let status = self.handle.wait_status();
            let state = self.handle.deadlock_state();

            if state == DeadlockState::BlockedByBackgroundTask && !background_cancel_sent {
                background_cancel_sent = true;
                self.cancel_background_blocker(tag, mode);
            }

            let checked = self.handle.indicator(TimeoutKind::DeadlockCheck);
            if self.manager.shared.config.log_lock_waits && checked {
                self.report_wait(tag, mode, state, status);
                self.handle.set_deadlock_state(DeadlockState::NoDeadlock);
            }

            if status != WaitStatus::Waiting {
                return WakeReason::Resolved;
            }
        }
    }

    fn cancel_background_blocker(&self, tag: LockTag, mode: LockMode) {
        let Some(blocker) = self.handle.background_blocker() else {
            return;
        };
        let Some(handle) = self.manager.shared.procs.lookup(blocker) else {
            return;
        };
        info!(
            proc = %self.id(),
            blocker = %blocker,
            lock = %tag,
            "Sending cancel to blocking background worker"
        );
        handle.request_cancel();
        self.manager
            .shared
            .publish(LockWaitEvent::background_cancelled(self.id(), tag, mode, blocker));
    }

    fn waited_ms(&self, kind: TimeoutKind) -> u64 {
        self.manager
            .timers
            .start_time(self.id(), kind)
            .map(|start| Instant::now().saturating_duration_since(start).as_millis() as u64)
            .unwrap_or(0)
    }

    fn report_wait(&self, tag: LockTag, mode: LockMode, state: DeadlockState, status: WaitStatus) {
        let shared = &self.manager.shared;
        let (holders, waiters) = match shared.table.snapshot(tag) {
            Some(snap) => (
                snap.holders.iter().map(|(p, _)| *p).collect::<Vec<_>>(),
                snap.waiters.iter().map(|(p, _)| *p).collect::<Vec<_>>(),
            ),
            None => (Vec::new(), Vec::new()),
        };
        let waited_ms = self.waited_ms(TimeoutKind::DeadlockCheck);
        let mode_name = shared.conflicts().mode_name(mode);
        let me = self.id();

        let event_type = match (state, status) {
            (DeadlockState::SoftDeadlock, _) => {
                info!(
                    proc = %me, lock = %tag, mode = mode_name, waited_ms,
                    holders = ?holders, waiters = ?waiters,
                    "Avoided deadlock by rearranging queue order"
                );
                LockWaitEventType::AvoidedDeadlock
            }
            (DeadlockState::HardDeadlock, _) => {
                warn!(
                    proc = %me, lock = %tag, mode = mode_name, waited_ms,
                    holders = ?holders, waiters = ?waiters,
                    "Detected deadlock while waiting"
                );
                LockWaitEventType::DeadlockDetected
            }
            (_, WaitStatus::Waiting) => {
                info!(
                    proc = %me, lock = %tag, mode = mode_name, waited_ms,
                    holders = ?holders, waiters = ?waiters,
                    "Still waiting for lock"
                );
                LockWaitEventType::StillWaiting
            }
            (_, WaitStatus::Granted) => {
                info!(proc = %me, lock = %tag, mode = mode_name, waited_ms, "Acquired lock");
                LockWaitEventType::Acquired
            }
            _ => {
                warn!(
                    proc = %me, lock = %tag, mode = mode_name, waited_ms,
                    holders = ?holders, waiters = ?waiters,
                    "Failed to acquire lock"
                );
                LockWaitEventType::FailedToAcquire
            }
        };

        shared.publish(LockWaitEvent::wait_report(
            event_type, me, tag, mode, waited_ms, &holders, &waiters,
        ));
    }
}
