//! Per-worker wakeable handle

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};

use super::semaphore::BinarySemaphore;
use crate::lock::{DeadlockState, WaitStatus};
use crate::timer::TimeoutKind;

const NO_BLOCKER: u32 = u32::MAX;

/// Stable index of a process handle in the registry arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcId(u32);

impl ProcId {
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ProcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What kind of worker owns a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ProcKind {
    #[default]
    Regular = 0,
    /// Maintenance work that a blocked waiter is allowed to cancel
    Background = 1,
}

/// Wakeable handle of one worker
///
/// `status` is written by the owning worker, by a releaser granting the
/// lock, or by the deadlock detector, always under the partition mutex of
/// the awaited lock. The owner reads it once per wakeup without the mutex.
#[derive(Debug)]
pub struct ProcessHandle {
    id: ProcId,
    kind: AtomicU8,
    sem: BinarySemaphore,
    status: AtomicU8,
    deadlock_state: AtomicU8,
    cancel_requested: AtomicBool,
    // Generation of the wait a targeted cancel was aimed at; 0 when none
    cancel_wait: AtomicU64,
    indicators: [AtomicBool; 2],
    generation: AtomicU64,
    background_blocker: AtomicU32,
}

impl ProcessHandle {
    pub(crate) fn new(id: ProcId) -> Self {
        Self {
            id,
            kind: AtomicU8::new(ProcKind::Regular as u8),
            sem: BinarySemaphore::new(),
            status: AtomicU8::new(WaitStatus::Idle as u8),
            deadlock_state: AtomicU8::new(DeadlockState::NotYetChecked as u8),
            cancel_requested: AtomicBool::new(false),
            cancel_wait: AtomicU64::new(0),
            indicators: [AtomicBool::new(false), AtomicBool::new(false)],
            generation: AtomicU64::new(0),
            background_blocker: AtomicU32::new(NO_BLOCKER),
        }
    }

    pub fn id(&self) -> ProcId {
        self.id
    }

    pub fn kind(&self) -> ProcKind {
        match self.kind.load(Ordering::Acquire) {
            1 => ProcKind::Background,
            _ => ProcKind::Regular,
        }
    }

    pub(crate) fn set_kind(&self, kind: ProcKind) {
        self.kind.store(kind as u8, Ordering::Release);
    }

    pub fn semaphore(&self) -> &BinarySemaphore {
        &self.sem
    }

    /// Wake the owning worker
    pub fn signal(&self) {
        self.sem.signal();
    }

    pub fn wait_status(&self) -> WaitStatus {
        WaitStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_wait_status(&self, status: WaitStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn is_waiting(&self) -> bool {
        self.wait_status() == WaitStatus::Waiting
    }

    pub fn deadlock_state(&self) -> DeadlockState {
        DeadlockState::from_u8(self.deadlock_state.load(Ordering::Acquire))
    }

    pub(crate) fn set_deadlock_state(&self, state: DeadlockState) {
        self.deadlock_state.store(state as u8, Ordering::Release);
    }

    /// Whether a cancel applies to the worker right now
    ///
    /// Either an untargeted cancel, or one aimed at the wait in progress.
    pub fn cancel_requested(&self) -> bool {
        if self.cancel_requested.load(Ordering::Acquire) {
            return true;
        }
        let target = self.cancel_wait.load(Ordering::Acquire);
        target != 0 && target == self.generation() && self.wait_status() != WaitStatus::Idle
    }

    /// Untargeted cancel still pending from before the current wait
    pub(crate) fn interrupt_pending(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    /// Ask the worker to stop whatever it is doing and wake it so it notices
    pub fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::Release);
        self.sem.signal();
    }

    /// Cancel only the wait of the given generation
    ///
    /// Has no effect once the worker has started another wait.
    pub fn request_cancel_wait(&self, generation: u64) {
        self.cancel_wait.store(generation, Ordering::Release);
        self.sem.signal();
    }

    pub(crate) fn clear_cancel(&self) {
        self.cancel_requested.store(false, Ordering::Release);
        self.clear_wait_cancel();
    }

    pub(crate) fn clear_wait_cancel(&self) {
        self.cancel_wait.store(0, Ordering::Release);
    }

    /// Whether a timer of this kind has fired since it was last cleared
    ///
    /// For the deadlock check it is set once the check has run.
    pub fn indicator(&self, kind: TimeoutKind) -> bool {
        self.indicators[kind.index()].load(Ordering::Acquire)
    }

    pub(crate) fn set_indicator(&self, kind: TimeoutKind, value: bool) {
        self.indicators[kind.index()].store(value, Ordering::Release);
    }

    /// Current wait generation; bumped at the start of every wait
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Background worker the last deadlock check found in the way
    pub fn background_blocker(&self) -> Option<ProcId> {
        match self.background_blocker.load(Ordering::Acquire) {
            NO_BLOCKER => None,
            id => Some(ProcId(id)),
        }
    }

    pub(crate) fn set_background_blocker(&self, blocker: Option<ProcId>) {
        let raw = blocker.map(|p| p.0).unwrap_or(NO_BLOCKER);
        self.background_blocker.store(raw, Ordering::Release);
    }

    /// Reset transient wait state before a new wait attempt
    pub(crate) fn begin_wait(&self) -> u64 {
        self.clear_cancel();
        self.set_indicator(TimeoutKind::DeadlockCheck, false);
        self.set_indicator(TimeoutKind::LockTimeout, false);
        self.set_deadlock_state(DeadlockState::NotYetChecked);
        self.set_background_blocker(None);
        self.next_generation()
    }

    /// Reset everything when the handle goes back to the free list
    pub(crate) fn reset(&self) {
        self.set_wait_status(WaitStatus::Idle);
        self.begin_wait();
        self.set_kind(ProcKind::Regular);
        self.sem.reset();
    }
}
