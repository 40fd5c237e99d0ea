//! Wait queues as index-linked lists over a per-partition arena
//!
//! A worker waits on at most one lock at a time, so the partition that
//! owns that lock can keep the worker's queue links in a slot indexed by
//! its `ProcId`. A `WaitQueue` is then only a head, a tail and a length.
//!
//! Nothing here is synchronised; the caller holds the partition mutex.

use super::types::{LockMask, LockMode, LockTag};
use crate::proc::ProcId;

/// Queue links and pending request of one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitSlot {
    pub prev: Option<ProcId>,
    pub next: Option<ProcId>,
    pub linked: bool,
    /// Lock being waited on, set while linked
    pub lock: Option<LockTag>,
    /// Requested mode
    pub mode: LockMode,
    /// Modes this worker already held on `lock` when it queued
    pub held: LockMask,
}

impl Default for WaitSlot {
    fn default() -> Self {
        Self {
            prev: None,
            next: None,
            linked: false,
            lock: None,
            mode: LockMode::new(0),
            held: LockMask::EMPTY,
        }
    }
}

/// Arena of wait slots, one per registry entry
#[derive(Debug, Clone)]
pub struct WaitLinks {
    slots: Vec<WaitSlot>,
}

impl WaitLinks {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![WaitSlot::default(); capacity],
        }
    }

    pub fn slot(&self, proc: ProcId) -> &WaitSlot {
        &self.slots[proc.index()]
    }

    pub fn slot_mut(&mut self, proc: ProcId) -> &mut WaitSlot {
        &mut self.slots[proc.index()]
    }

    pub fn is_linked(&self, proc: ProcId) -> bool {
        self.slots
            .get(proc.index())
            .map(|s| s.linked)
            .unwrap_or(false)
    }
}

/// Ordered list of workers waiting on one lock
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaitQueue {
    head: Option<ProcId>,
    tail: Option<ProcId>,
    size: usize,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn head(&self) -> Option<ProcId> {
        self.head
    }

    /// Successor of `proc` in this queue
    pub fn next_of(&self, links: &WaitLinks, proc: ProcId) -> Option<ProcId> {
        links.slot(proc).next
    }

    /// Link `proc` at the tail
    pub fn push_back(&mut self, links: &mut WaitLinks, proc: ProcId) {
        self.insert_before(links, proc, None);
    }

    /// Link `proc` immediately before `before`, or at the tail when `None`
    ///
    /// `proc` must not be linked and `before` must be in this queue.
    pub fn insert_before(&mut self, links: &mut WaitLinks, proc: ProcId, before: Option<ProcId>) {
        debug_assert!(!links.slot(proc).linked);

        let prev = match before {
            Some(b) => links.slot(b).prev,
            None => self.tail,
        };

        {
            let slot = links.slot_mut(proc);
            slot.prev = prev;
            slot.next = before;
            slot.linked = true;
        }

        match prev {
            Some(p) => links.slot_mut(p).next = Some(proc),
            None => self.head = Some(proc),
        }
        match before {
            Some(b) => links.slot_mut(b).prev = Some(proc),
            None => self.tail = Some(proc),
        }

        self.size += 1;
    }

    /// Unlink `proc`; returns false if it was not linked
    ///
    /// The lock's aggregate wait mask is left untouched.
    pub fn remove(&mut self, links: &mut WaitLinks, proc: ProcId) -> bool {
        let slot = *links.slot(proc);
        if !slot.linked {
            return false;
        }

        match slot.prev {
            Some(p) => links.slot_mut(p).next = slot.next,
            None => self.head = slot.next,
        }
        match slot.next {
            Some(n) => links.slot_mut(n).prev = slot.prev,
            None => self.tail = slot.prev,
        }

        let slot = links.slot_mut(proc);
        slot.prev = None;
        slot.next = None;
        slot.linked = false;

        self.size -= 1;
        true
    }

    /// Whether `proc` is linked into this queue
    pub fn contains(&self, links: &WaitLinks, proc: ProcId) -> bool {
        self.iter(links).any(|p| p == proc)
    }

    /// Walk the queue from the head
    pub fn iter<'a>(&self, links: &'a WaitLinks) -> QueueIter<'a> {
        QueueIter {
            links,
            next: self.head,
            remaining: self.size,
        }
    }

    /// Queue members in order
    pub fn to_vec(&self, links: &WaitLinks) -> Vec<ProcId> {
        self.iter(links).collect()
    }
}

/// Iterator over a wait queue
#[derive(Debug)]
pub struct QueueIter<'a> {
    links: &'a WaitLinks,
    next: Option<ProcId>,
    remaining: usize,
}

impl Iterator for QueueIter<'_> {
    type Item = ProcId;

    fn next(&mut self) -> Option<ProcId> {
        if self.remaining == 0 {
            return None;
        }
        let current = self.next?;
        self.next = self.links.slot(current).next;
        self.remaining -= 1;
        Some(current)
    }
}
