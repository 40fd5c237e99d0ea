//! Deadlock detection over the wait-for graph
//!
//! The graph has a node per worker and two kinds of edge out of every
//! waiter:
//!
//! - **hard**: to each other holder of the awaited lock whose held modes
//!   conflict with the request. Only that holder releasing can unblock us.
//! - **soft**: to each waiter queued *ahead* of us on the same lock whose
//!   requested mode conflicts with ours. Reordering the queue can remove
//!   a soft edge.
//!
//! `WaitGraph::check` looks for a cycle through the worker running the
//! check. A cycle made only of hard edges is a hard deadlock. If the cycle
//! has a soft edge, the checker tries moving the waiter behind directly in
//! front of the waiter ahead; if that leaves no cycle through the checker,
//! the deadlock is soft and the reorder is the proposed fix.
//!
//! The graph's buffers are allocated once and reused across checks.

use serde::{Deserialize, Serialize};
use std::ops::Range;

use super::types::{ConflictTable, DeadlockState, LockMask, LockMode, LockTag};
use crate::proc::ProcId;

/// An edge of the wait-for graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitEdge {
    pub waiter: ProcId,
    pub blocker: ProcId,
    pub lock: LockTag,
    pub soft: bool,
}

/// Queue rearrangement that resolves a soft deadlock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reorder {
    pub lock: LockTag,
    /// Waiter to move
    pub waiter: ProcId,
    /// Waiter it moves in front of
    pub before: ProcId,
}

/// Outcome of one deadlock check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub state: DeadlockState,
    pub reorder: Option<Reorder>,
    pub background_blocker: Option<ProcId>,
    /// The cycle that was found, if any, before any reorder
    pub cycle: Vec<WaitEdge>,
}

impl Verdict {
    /// One-line description of the cycle for log output
    pub fn describe(&self) -> String {
        self.cycle
            .iter()
            .map(|e| {
                format!(
                    "worker {} waits for worker {} on {}{}",
                    e.waiter,
                    e.blocker,
                    e.lock,
                    if e.soft { " (queue order)" } else { "" }
                )
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone)]
struct LockNode {
    tag: LockTag,
    holders: Range<usize>,
    queue: Range<usize>,
}

/// A waiter moved forward in a snapshot queue, by position within the queue
#[derive(Debug, Clone, Copy)]
struct QueueMove {
    start: usize,
    from: usize,
    to: usize,
}

#[derive(Debug, Clone, Copy)]
struct WaitNode {
    lock: usize,
    mode: LockMode,
}

/// Reusable wait-for graph
#[derive(Debug, Clone)]
pub struct WaitGraph {
    locks: Vec<LockNode>,
    holders: Vec<(ProcId, LockMask)>,
    queue: Vec<ProcId>,
    waits: Vec<Option<WaitNode>>,
    // DFS scratch
    visited: Vec<bool>,
    path: Vec<WaitEdge>,
    blockers: Vec<Vec<WaitEdge>>,
}

impl WaitGraph {
    pub fn with_capacity(max_procs: usize) -> Self {
        Self {
            locks: Vec::with_capacity(max_procs),
            holders: Vec::with_capacity(max_procs * 2),
            queue: Vec::with_capacity(max_procs),
            waits: vec![None; max_procs],
            visited: vec![false; max_procs],
            path: Vec::with_capacity(max_procs),
            blockers: (0..max_procs).map(|_| Vec::new()).collect(),
        }
    }

    /// Forget the previous snapshot, keeping the allocations
    pub fn clear(&mut self) {
        self.locks.clear();
        self.holders.clear();
        self.queue.clear();
        self.waits.iter_mut().for_each(|w| *w = None);
        self.path.clear();
    }

    /// Add a lock that has at least one waiter
    ///
    /// `waiters` must be in queue order.
    pub fn add_lock(
        &mut self,
        tag: LockTag,
        holders: impl IntoIterator<Item = (ProcId, LockMask)>,
        waiters: impl IntoIterator<Item = (ProcId, LockMode)>,
    ) {
        let index = self.locks.len();

        let h_start = self.holders.len();
        self.holders.extend(holders);
        let h_end = self.holders.len();

        let q_start = self.queue.len();
        for (proc, mode) in waiters {
            if proc.index() >= self.waits.len() {
                self.grow(proc.index() + 1);
            }
            self.queue.push(proc);
            self.waits[proc.index()] = Some(WaitNode { lock: index, mode });
        }
        let q_end = self.queue.len();

        self.locks.push(LockNode {
            tag,
            holders: h_start..h_end,
            queue: q_start..q_end,
        });
    }

    fn grow(&mut self, len: usize) {
        self.waits.resize(len, None);
        self.visited.resize(len, false);
        self.blockers.resize_with(len, Vec::new);
    }

    /// Whether `proc` is waiting in this snapshot
    pub fn is_waiting(&self, proc: ProcId) -> bool {
        self.waits.get(proc.index()).is_some_and(|w| w.is_some())
    }

    /// Queue of `tag` in the snapshot, for inspection
    pub fn queue_of(&self, tag: LockTag) -> Option<&[ProcId]> {
        self.locks
            .iter()
            .find(|l| l.tag == tag)
            .map(|l| &self.queue[l.queue.clone()])
    }

    /// Edges out of `proc`: hard ones first, then soft ones
    pub fn edges_from(&self, proc: ProcId, conflicts: &ConflictTable, out: &mut Vec<WaitEdge>) {
        out.clear();
        let Some(Some(wait)) = self.waits.get(proc.index()).copied() else {
            return;
        };
        let lock = &self.locks[wait.lock];
        let conflict = conflicts.conflicts(wait.mode);

        for (holder, held) in &self.holders[lock.holders.clone()] {
            if *holder != proc && conflict.intersects(*held) {
                out.push(WaitEdge {
                    waiter: proc,
                    blocker: *holder,
                    lock: lock.tag,
                    soft: false,
                });
            }
        }

        for ahead in &self.queue[lock.queue.clone()] {
            if *ahead == proc {
                break;
            }
            let Some(ahead_wait) = self.waits[ahead.index()] else {
                continue;
            };
            if conflict.contains(ahead_wait.mode) {
                out.push(WaitEdge {
                    waiter: proc,
                    blocker: *ahead,
                    lock: lock.tag,
                    soft: true,
                });
            }
        }
    }

    /// Look for a cycle that passes through `start`
    ///
    /// On success the cycle's edges are left in order starting at `start`.
    pub fn find_cycle(&mut self, start: ProcId, conflicts: &ConflictTable) -> Option<Vec<WaitEdge>> {
        self.visited.iter_mut().for_each(|v| *v = false);
        self.path.clear();
        if self.visit(start, start, conflicts) {
            Some(self.path.clone())
        } else {
            None
        }
    }

    fn visit(&mut self, node: ProcId, start: ProcId, conflicts: &ConflictTable) -> bool {
        if node.index() >= self.visited.len() {
            return false;
        }
        self.visited[node.index()] = true;

        let mut edges = std::mem::take(&mut self.blockers[node.index()]);
        self.edges_from(node, conflicts, &mut edges);

        let mut found = false;
        for edge in &edges {
            self.path.push(*edge);
            if edge.blocker == start {
                found = true;
                break;
            }
            // A visited node either already failed to reach `start` or is on
            // the current path, making a cycle that excludes `start`.
            if edge.blocker.index() < self.visited.len()
                && !self.visited[edge.blocker.index()]
                && self.visit(edge.blocker, start, conflicts)
            {
                found = true;
                break;
            }
            self.path.pop();
        }

        self.blockers[node.index()] = edges;
        found
    }

    /// Move `waiter` to just before `before` in the snapshot queue of `lock`
    ///
    /// Returns the positions involved so the move can be undone exactly.
    fn move_before(&mut self, lock: LockTag, waiter: ProcId, before: ProcId) -> Option<QueueMove> {
        let node = self.locks.iter().position(|l| l.tag == lock)?;
        let range = self.locks[node].queue.clone();
        let queue = &mut self.queue[range.clone()];
        let from = queue.iter().position(|p| *p == waiter)?;
        let to = queue.iter().position(|p| *p == before)?;
        if from > to {
            queue[to..=from].rotate_right(1);
        }
        Some(QueueMove {
            start: range.start,
            from,
            to,
        })
    }

    /// Put the queue back the way it was before `moved`
    fn undo_move(&mut self, moved: QueueMove) {
        if moved.from > moved.to {
            self.queue[moved.start + moved.to..=moved.start + moved.from].rotate_left(1);
        }
    }

    /// Classify the situation of `start`
    ///
    /// `is_background` tells whether a worker may be cancelled by a waiter
    /// it blocks.
    pub fn check(
        &mut self,
        start: ProcId,
        conflicts: &ConflictTable,
        is_background: impl Fn(ProcId) -> bool,
    ) -> Verdict {
        let Some(cycle) = self.find_cycle(start, conflicts) else {
            let mut edges = Vec::new();
            self.edges_from(start, conflicts, &mut edges);
            let background_blocker = edges
                .iter()
                .find(|e| !e.soft && is_background(e.blocker))
                .map(|e| e.blocker);
            let state = if background_blocker.is_some() {
                DeadlockState::BlockedByBackgroundTask
            } else {
                DeadlockState::NoDeadlock
            };
            return Verdict {
                state,
                reorder: None,
                background_blocker,
                cycle: Vec::new(),
            };
        };

        for edge in cycle.iter().filter(|e| e.soft) {
            let Some(moved) = self.move_before(edge.lock, edge.waiter, edge.blocker) else {
                continue;
            };
            if self.find_cycle(start, conflicts).is_none() {
                return Verdict {
                    state: DeadlockState::SoftDeadlock,
                    reorder: Some(Reorder {
                        lock: edge.lock,
                        waiter: edge.waiter,
                        before: edge.blocker,
                    }),
                    background_blocker: None,
                    cycle,
                };
            }
            self.undo_move(moved);
        }

        Verdict {
            state: DeadlockState::HardDeadlock,
            reorder: None,
            background_blocker: None,
            cycle,
        }
    }
}
