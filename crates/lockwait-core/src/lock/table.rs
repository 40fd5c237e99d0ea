//! Shared lock table: partitions, per-resource locks, grants and wakeups
//!
//! Each `Lock` lives in the partition its tag hashes to and is only touched
//! while that partition's mutex is held. Code that needs more than one
//! partition at a time (the deadlock detector) takes them all in ascending
//! index order through `LockTable::lock_all` and releases them in reverse.

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use super::queue::{WaitLinks, WaitQueue};
use super::types::{ConflictTable, LockMask, LockMode, LockTag, WaitStatus};
use crate::error::{Error, Result};
use crate::proc::{ProcArray, ProcId};

/// One contended resource
#[derive(Debug, Clone)]
pub struct Lock {
    tag: LockTag,
    holders: HashMap<ProcId, LockMask>,
    /// Number of holders per mode
    granted: Vec<u32>,
    grant_mask: LockMask,
    wait_mask: LockMask,
    pub(crate) queue: WaitQueue,
}

impl Lock {
    pub fn new(tag: LockTag, num_modes: u8) -> Self {
        Self {
            tag,
            holders: HashMap::new(),
            granted: vec![0; num_modes as usize + 1],
            grant_mask: LockMask::EMPTY,
            wait_mask: LockMask::EMPTY,
            queue: WaitQueue::new(),
        }
    }

    pub fn tag(&self) -> LockTag {
        self.tag
    }

    /// Modes `proc` holds on this lock
    pub fn held_by(&self, proc: ProcId) -> LockMask {
        self.holders.get(&proc).copied().unwrap_or(LockMask::EMPTY)
    }

    pub fn holders(&self) -> impl Iterator<Item = (ProcId, LockMask)> + '_ {
        self.holders.iter().map(|(p, m)| (*p, *m))
    }

    pub fn grant_mask(&self) -> LockMask {
        self.grant_mask
    }

    /// OR of the modes requested by queued waiters
    pub fn wait_mask(&self) -> LockMask {
        self.wait_mask
    }

    pub fn queue(&self) -> &WaitQueue {
        &self.queue
    }

    /// Modes held by anyone other than `proc`
    pub fn other_holders_mask(&self, proc: ProcId) -> LockMask {
        let mine = self.held_by(proc);
        let mut mask = LockMask::EMPTY;
        for mode in self.grant_mask.iter() {
            let others = self.granted[mode.index()] - u32::from(mine.contains(mode));
            if others > 0 {
                mask = mask.with(mode);
            }
        }
        mask
    }

    /// Whether a request by `proc` for `mode` conflicts with modes other
    /// workers hold. A worker never conflicts with its own holds.
    pub fn conflicts_with_holders(
        &self,
        conflicts: &ConflictTable,
        mode: LockMode,
        proc: ProcId,
    ) -> bool {
        let wanted = conflicts.conflicts(mode);
        if !wanted.intersects(self.grant_mask) {
            return false;
        }
        wanted.intersects(self.other_holders_mask(proc))
    }

    /// Record that `proc` now holds `mode`
    pub fn grant(&mut self, proc: ProcId, mode: LockMode) {
        let held = self.holders.entry(proc).or_default();
        if held.contains(mode) {
            return;
        }
        *held = held.with(mode);
        self.granted[mode.index()] += 1;
        self.grant_mask = self.grant_mask.with(mode);
    }

    /// Drop `proc`'s hold on `mode`; false if it did not hold it
    pub fn ungrant(&mut self, proc: ProcId, mode: LockMode) -> bool {
        let Some(held) = self.holders.get_mut(&proc) else {
            return false;
        };
        if !held.contains(mode) {
            return false;
        }
        *held = held.without(mode);
        if held.is_empty() {
            self.holders.remove(&proc);
        }
        self.granted[mode.index()] -= 1;
        if self.granted[mode.index()] == 0 {
            self.grant_mask = self.grant_mask.without(mode);
        }
        true
    }

    /// Rebuild the wait mask from the queued waiters
    pub fn recompute_wait_mask(&mut self, links: &WaitLinks) {
        self.wait_mask = self
            .queue
            .iter(links)
            .fold(LockMask::EMPTY, |mask, p| mask.with(links.slot(p).mode));
    }

    pub(crate) fn add_wait_mode(&mut self, mode: LockMode) {
        self.wait_mask = self.wait_mask.with(mode);
    }

    /// No holders and no waiters
    pub fn is_unused(&self) -> bool {
        self.holders.is_empty() && self.queue.is_empty()
    }
}

/// Point-in-time view of a lock, for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSnapshot {
    pub tag: LockTag,
    pub holders: Vec<(ProcId, LockMask)>,
    pub waiters: Vec<(ProcId, LockMode)>,
    pub grant_mask: LockMask,
    pub wait_mask: LockMask,
}

/// A hashed subset of the lock table
#[derive(Debug)]
pub struct Partition {
    pub(crate) locks: HashMap<LockTag, Lock>,
    pub(crate) links: WaitLinks,
    num_modes: u8,
}

impl Partition {
    pub fn new(max_procs: usize, num_modes: u8) -> Self {
        Self {
            locks: HashMap::new(),
            links: WaitLinks::new(max_procs),
            num_modes,
        }
    }

    pub fn lock(&self, tag: LockTag) -> Option<&Lock> {
        self.locks.get(&tag)
    }

    pub fn lock_mut(&mut self, tag: LockTag) -> Option<&mut Lock> {
        self.locks.get_mut(&tag)
    }

    /// Find or create the lock for `tag`
    pub fn lock_or_insert(&mut self, tag: LockTag) -> &mut Lock {
        let num_modes = self.num_modes;
        self.locks
            .entry(tag)
            .or_insert_with(|| Lock::new(tag, num_modes))
    }

    pub fn links(&self) -> &WaitLinks {
        &self.links
    }

    /// Drop the lock entry once nobody holds or awaits it
    pub fn collect_garbage(&mut self, tag: LockTag) {
        if self.locks.get(&tag).is_some_and(Lock::is_unused) {
            self.locks.remove(&tag);
        }
    }

    /// Grant every waiter on `tag` that is no longer blocked
    ///
    /// Walks the queue once from the head. A waiter is granted when its
    /// mode conflicts neither with the requests of waiters left ahead of it
    /// in this pass nor with modes held by others. Returns the number of
    /// waiters woken.
    pub fn wake_waiters(
        &mut self,
        tag: LockTag,
        conflicts: &ConflictTable,
        procs: &ProcArray,
    ) -> usize {
        let Partition { locks, links, .. } = &mut *self;
        let Some(lock) = locks.get_mut(&tag) else {
            return 0;
        };
        if lock.queue.is_empty() {
            return 0;
        }

        let mut ahead = LockMask::EMPTY;
        let mut woken = 0;
        let mut cursor = lock.queue.head();

        while let Some(proc) = cursor {
            let next = lock.queue.next_of(links, proc);
            let mode = links.slot(proc).mode;

            if !conflicts.conflicts_with(mode, ahead)
                && !lock.conflicts_with_holders(conflicts, mode, proc)
            {
                lock.grant(proc, mode);
                lock.queue.remove(links, proc);
                let slot = links.slot_mut(proc);
                slot.lock = None;
                slot.held = LockMask::EMPTY;

                if let Some(handle) = procs.get(proc) {
                    handle.set_wait_status(WaitStatus::Granted);
                    handle.signal();
                }
                debug!(lock = %tag, proc = %proc, mode = %mode, "Granted lock to waiter");
                woken += 1;
            } else {
                ahead = ahead.with(mode);
            }
            cursor = next;
        }

        // Only the waiters that were not granted remain, and `ahead` is
        // exactly the OR of their modes.
        lock.wait_mask = ahead;
        woken
    }

    /// Kick `proc` out of the queue it is waiting in with an error status
    ///
    /// Waiters behind it may have been blocked only by its request, so
    /// they are offered the lock afterwards.
    pub fn remove_from_wait_queue(
        &mut self,
        proc: ProcId,
        conflicts: &ConflictTable,
        procs: &ProcArray,
    ) -> Result<LockTag> {
        let slot = *self.links.slot(proc);
        let tag = match (slot.linked, slot.lock) {
            (true, Some(tag)) => tag,
            _ => {
                return Err(Error::InvariantViolation(format!(
                    "worker {} is not linked into any wait queue",
                    proc
                )));
            }
        };

        let Partition { locks, links, .. } = &mut *self;
        let lock = locks.get_mut(&tag).ok_or_else(|| {
            Error::InvariantViolation(format!(
                "worker {} waits on {} which is not in the lock table",
                proc, tag
            ))
        })?;
        if !lock.queue.remove(links, proc) {
            return Err(Error::InvariantViolation(format!(
                "worker {} is marked linked but missing from the queue of {}",
                proc, tag
            )));
        }
        let slot = links.slot_mut(proc);
        slot.lock = None;
        slot.held = LockMask::EMPTY;
        lock.recompute_wait_mask(links);

        if let Some(handle) = procs.get(proc) {
            handle.set_wait_status(WaitStatus::Error);
        }

        self.wake_waiters(tag, conflicts, procs);
        self.collect_garbage(tag);
        Ok(tag)
    }

    /// Move queued `proc` to just before `before` in the queue of `tag`
    pub fn reorder_before(&mut self, tag: LockTag, proc: ProcId, before: ProcId) -> Result<()> {
        let Partition { locks, links, .. } = &mut *self;
        let lock = locks
            .get_mut(&tag)
            .ok_or_else(|| Error::InvariantViolation(format!("{} vanished during reorder", tag)))?;
        if !lock.queue.contains(links, before) || !lock.queue.remove(links, proc) {
            return Err(Error::InvariantViolation(format!(
                "cannot move worker {} before {} in the queue of {}",
                proc, before, tag
            )));
        }
        lock.queue.insert_before(links, proc, Some(before));
        Ok(())
    }

    pub fn snapshot(&self, tag: LockTag) -> Option<LockSnapshot> {
        let lock = self.locks.get(&tag)?;
        let mut holders: Vec<_> = lock.holders().collect();
        holders.sort_by_key(|(p, _)| *p);
        Some(LockSnapshot {
            tag,
            holders,
            waiters: lock
                .queue
                .iter(&self.links)
                .map(|p| (p, self.links.slot(p).mode))
                .collect(),
            grant_mask: lock.grant_mask,
            wait_mask: lock.wait_mask,
        })
    }
}

/// All partitions plus the conflict table they share
#[derive(Debug)]
pub struct LockTable {
    conflicts: ConflictTable,
    partitions: Vec<Mutex<Partition>>,
}

impl LockTable {
    pub fn new(conflicts: ConflictTable, num_partitions: usize, max_procs: usize) -> Self {
        let num_modes = conflicts.num_modes();
        let partitions = (0..num_partitions)
            .map(|_| Mutex::new(Partition::new(max_procs, num_modes)))
            .collect();
        Self {
            conflicts,
            partitions,
        }
    }

    pub fn conflicts(&self) -> &ConflictTable {
        &self.conflicts
    }

    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    pub fn partition_index(&self, tag: LockTag) -> usize {
        tag.partition(self.partitions.len())
    }

    /// Lock the partition that owns `tag`
    pub fn partition_for(&self, tag: LockTag) -> MutexGuard<'_, Partition> {
        self.partitions[self.partition_index(tag)].lock()
    }

    /// Lock every partition in ascending index order
    pub fn lock_all(&self) -> Vec<MutexGuard<'_, Partition>> {
        self.partitions.iter().map(|p| p.lock()).collect()
    }

    /// Release partitions taken by `lock_all`, highest index first
    pub fn unlock_all(mut guards: Vec<MutexGuard<'_, Partition>>) {
        while let Some(guard) = guards.pop() {
            drop(guard);
        }
    }

    pub fn snapshot(&self, tag: LockTag) -> Option<LockSnapshot> {
        self.partition_for(tag).snapshot(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::ProcKind;

    const SHARED: LockMode = LockMode::new(1);
    const EXCLUSIVE: LockMode = LockMode::new(2);

    fn enqueue(part: &mut Partition, tag: LockTag, proc: ProcId, mode: LockMode) {
        let Partition { locks, links, .. } = &mut *part;
        let lock = locks.get_mut(&tag).unwrap();
        lock.queue.push_back(links, proc);
        let slot = links.slot_mut(proc);
        slot.lock = Some(tag);
        slot.mode = mode;
        lock.add_wait_mode(mode);
    }

    fn setup(n: usize) -> (ProcArray, Vec<ProcId>) {
        let procs = ProcArray::new(n);
        let ids = (0..n)
            .map(|_| {
                let h = procs.attach(ProcKind::Regular).unwrap();
                h.set_wait_status(WaitStatus::Waiting);
                h.id()
            })
            .collect();
        (procs, ids)
    }

    #[test]
    fn test_holder_does_not_conflict_with_itself() {
        let conflicts = ConflictTable::shared_exclusive();
        let mut lock = Lock::new(LockTag::new(1), 2);
        let me = ProcId::new(0);
        let other = ProcId::new(1);

        lock.grant(me, SHARED);
        assert!(!lock.conflicts_with_holders(&conflicts, EXCLUSIVE, me));
        assert!(lock.conflicts_with_holders(&conflicts, EXCLUSIVE, other));

        lock.grant(other, SHARED);
        assert!(lock.conflicts_with_holders(&conflicts, EXCLUSIVE, me));

        assert!(lock.ungrant(other, SHARED));
        assert!(!lock.ungrant(other, SHARED));
        assert_eq!(lock.grant_mask(), LockMask::bit(SHARED));
    }

    #[test]
    fn test_wake_grants_all_compatible_shared_waiters() {
        let conflicts = ConflictTable::shared_exclusive();
        let (procs, ids) = setup(4);
        let tag = LockTag::new(9);
        let mut part = Partition::new(4, 2);

        part.lock_or_insert(tag).grant(ids[0], EXCLUSIVE);
        enqueue(&mut part, tag, ids[1], SHARED);
        enqueue(&mut part, tag, ids[2], SHARED);
        enqueue(&mut part, tag, ids[3], EXCLUSIVE);

        assert_eq!(part.wake_waiters(tag, &conflicts, &procs), 0);

        part.lock_mut(tag).unwrap().ungrant(ids[0], EXCLUSIVE);
        assert_eq!(part.wake_waiters(tag, &conflicts, &procs), 2);

        let snap = part.snapshot(tag).unwrap();
        assert_eq!(snap.waiters, vec![(ids[3], EXCLUSIVE)]);
        assert_eq!(snap.wait_mask, LockMask::bit(EXCLUSIVE));
        assert_eq!(procs.get(ids[1]).unwrap().wait_status(), WaitStatus::Granted);
        assert_eq!(procs.get(ids[3]).unwrap().wait_status(), WaitStatus::Waiting);
    }

    #[test]
    fn test_wake_waiters_exhaustive() {
        let conflicts = ConflictTable::shared_update_exclusive();
        let tag = LockTag::new(1);

        for held in 0..=conflicts.num_modes() {
            for n in 1..=5u32 {
                for combo in 0..3u32.pow(n) {
                    let modes: Vec<LockMode> = (0..n)
                        .map(|i| LockMode::new((combo / 3u32.pow(i) % 3) as u8 + 1))
                        .collect();

                    let (procs, ids) = setup(n as usize + 1);
                    let mut part = Partition::new(n as usize + 1, conflicts.num_modes());
                    let lock = part.lock_or_insert(tag);
                    if held > 0 {
                        lock.grant(ids[0], LockMode::new(held));
                    }
                    for (i, mode) in modes.iter().enumerate() {
                        enqueue(&mut part, tag, ids[i + 1], *mode);
                    }

                    let woken = part.wake_waiters(tag, &conflicts, &procs);
                    let snap = part.snapshot(tag).unwrap();

                    // Holders are pairwise compatible.
                    for (a, a_mask) in &snap.holders {
                        for (b, b_mask) in &snap.holders {
                            if a != b {
                                for mode in a_mask.iter() {
                                    assert!(!conflicts.conflicts_with(mode, *b_mask), "{modes:?}");
                                }
                            }
                        }
                    }

                    // Every waiter left behind is blocked by a holder or by
                    // a waiter still ahead of it.
                    let lock = part.lock(tag).unwrap();
                    let mut ahead = LockMask::EMPTY;
                    for (proc, mode) in &snap.waiters {
                        assert!(
                            conflicts.conflicts_with(*mode, ahead)
                                || lock.conflicts_with_holders(&conflicts, *mode, *proc),
                            "held {held} waiters {modes:?}"
                        );
                        ahead = ahead.with(*mode);
                    }
                    assert_eq!(snap.wait_mask, ahead);
                    assert_eq!(woken + snap.waiters.len(), n as usize);

                    for id in &ids[1..] {
                        let granted = procs.get(*id).unwrap().wait_status() == WaitStatus::Granted;
                        assert_eq!(granted, !snap.waiters.iter().any(|(p, _)| p == id));
                    }
                }
            }
        }
    }

    #[test]
    fn test_remove_from_wait_queue_wakes_followers() {
        let conflicts = ConflictTable::shared_exclusive();
        let (procs, ids) = setup(3);
        let tag = LockTag::new(3);
        let mut part = Partition::new(3, 2);

        part.lock_or_insert(tag).grant(ids[0], SHARED);
        enqueue(&mut part, tag, ids[1], EXCLUSIVE);
        enqueue(&mut part, tag, ids[2], SHARED);

        // The shared request is stuck behind the exclusive one until the
        // exclusive waiter is removed.
        assert_eq!(part.wake_waiters(tag, &conflicts, &procs), 0);
        part.remove_from_wait_queue(ids[1], &conflicts, &procs).unwrap();

        assert_eq!(procs.get(ids[1]).unwrap().wait_status(), WaitStatus::Error);
        assert_eq!(procs.get(ids[2]).unwrap().wait_status(), WaitStatus::Granted);
        assert!(part.snapshot(tag).unwrap().waiters.is_empty());
    }

    #[test]
    fn test_remove_unlinked_is_invariant_violation() {
        let conflicts = ConflictTable::shared_exclusive();
        let (procs, ids) = setup(1);
        let mut part = Partition::new(1, 2);

        let err = part
            .remove_from_wait_queue(ids[0], &conflicts, &procs)
            .unwrap_err();
        assert_eq!(err.code(), "E320");
    }

    #[test]
    fn test_unused_lock_is_collected() {
        let mut part = Partition::new(1, 2);
        let tag = LockTag::new(5);
        part.lock_or_insert(tag).grant(ProcId::new(0), SHARED);
        part.collect_garbage(tag);
        assert!(part.lock(tag).is_some());

        part.lock_mut(tag).unwrap().ungrant(ProcId::new(0), SHARED);
        part.collect_garbage(tag);
        assert!(part.lock(tag).is_none());
    }

    #[test]
    fn test_lock_all_covers_every_partition() {
        let table = LockTable::new(ConflictTable::shared_exclusive(), 4, 2);
        let guards = table.lock_all();
        assert_eq!(guards.len(), 4);
        LockTable::unlock_all(guards);
        assert!(table.snapshot(LockTag::new(1)).is_none());
    }
}
