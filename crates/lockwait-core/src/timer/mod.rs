//! Deadlock-check and lock-timeout timers
//!
//! A single `TimerService` thread sleeps until the earliest armed deadline
//! and hands each expired timer to a `TimeoutHandler`. Timers are tagged
//! with the wait generation of the handle that armed them, so a timer that
//! outlives its wait (fired while being disarmed) is recognisable and
//! ignored by the handler.

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::proc::{ProcId, ProcessHandle};

/// The two independent timer kinds a waiter arms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutKind {
    DeadlockCheck,
    LockTimeout,
}

impl TimeoutKind {
    pub fn index(&self) -> usize {
        match self {
            Self::DeadlockCheck => 0,
            Self::LockTimeout => 1,
        }
    }
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeadlockCheck => write!(f, "deadlock_check"),
            Self::LockTimeout => write!(f, "lock_timeout"),
        }
    }
}

/// Callback invoked on the timer thread when a timer expires
///
/// Implementations must not block on anything a waiter may hold while
/// sleeping; they may take partition mutexes in ascending order.
pub trait TimeoutHandler: Send + Sync + 'static {
    fn on_timeout(&self, proc: ProcId, kind: TimeoutKind, generation: u64);
}

#[derive(Debug, Clone, Copy)]
struct TimerEntry {
    proc: ProcId,
    kind: TimeoutKind,
    generation: u64,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct TimerState {
    entries: Vec<TimerEntry>,
    started: HashMap<(ProcId, TimeoutKind), Instant>,
    shutdown: bool,
}

#[derive(Debug, Default)]
struct TimerShared {
    state: Mutex<TimerState>,
    cond: Condvar,
}

/// Owner of the timer thread
#[derive(Debug)]
pub struct TimerService {
    shared: Arc<TimerShared>,
    thread: Option<JoinHandle<()>>,
}

impl TimerService {
    /// Spawn the timer thread
    pub fn start(handler: Arc<dyn TimeoutHandler>) -> std::io::Result<Self> {
        let shared = Arc::new(TimerShared::default());
        let thread = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("lockwait-timer".to_string())
                .spawn(move || run(shared, handler))?
        };
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Arm several timers with one wakeup of the timer thread
    ///
    /// Re-arming a kind that is already armed for this handle replaces it.
    pub fn arm_many(&self, handle: &ProcessHandle, timers: &[(TimeoutKind, Duration)]) {
        let now = Instant::now();
        let proc = handle.id();
        let generation = handle.generation();
        let mut state = self.shared.state.lock();

        for (kind, delay) in timers {
            state.entries.retain(|e| !(e.proc == proc && e.kind == *kind));
            state.entries.push(TimerEntry {
                proc,
                kind: *kind,
                generation,
                deadline: now + *delay,
            });
            state.started.insert((proc, *kind), now);
            debug!(proc = %proc, kind = %kind, delay_ms = delay.as_millis() as u64, "Armed timer");
        }
        drop(state);
        self.shared.cond.notify_one();
    }

    /// Disarm several timers; disarming an unarmed timer is a no-op
    ///
    /// With `keep_indicator` the handle's "this timer fired" flag survives,
    /// so a lock timeout is not later mistaken for a user cancel.
    pub fn disarm_many(&self, handle: &ProcessHandle, timers: &[(TimeoutKind, bool)]) {
        let proc = handle.id();
        let mut state = self.shared.state.lock();
        for (kind, keep_indicator) in timers {
            state.entries.retain(|e| !(e.proc == proc && e.kind == *kind));
            if !keep_indicator {
                handle.set_indicator(*kind, false);
            }
        }
    }

    #[cfg(test)]
    fn is_armed(&self, proc: ProcId, kind: TimeoutKind) -> bool {
        self.shared
            .state
            .lock()
            .entries
            .iter()
            .any(|e| e.proc == proc && e.kind == kind)
    }

    /// When the most recent timer of this kind was armed for `proc`
    pub fn start_time(&self, proc: ProcId, kind: TimeoutKind) -> Option<Instant> {
        self.shared.state.lock().started.get(&(proc, kind)).copied()
    }

    /// Forget all timers of a detaching worker
    pub fn forget(&self, proc: ProcId) {
        let mut state = self.shared.state.lock();
        state.entries.retain(|e| e.proc != proc);
        state.started.retain(|(p, _), _| *p != proc);
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.cond.notify_all();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Timer thread panicked");
            }
        }
    }
}

fn run(shared: Arc<TimerShared>, handler: Arc<dyn TimeoutHandler>) {
    let mut due: Vec<TimerEntry> = Vec::new();
    let mut state = shared.state.lock();

    loop {
        if state.shutdown {
            break;
        }

        let now = Instant::now();
        let mut i = 0;
        while i < state.entries.len() {
            if state.entries[i].deadline <= now {
                due.push(state.entries.swap_remove(i));
            } else {
                i += 1;
            }
        }

        if !due.is_empty() {
            due.sort_by_key(|e| e.deadline);
            MutexGuard::unlocked(&mut state, || {
                for entry in due.drain(..) {
                    debug!(proc = %entry.proc, kind = %entry.kind, "Timer fired");
                    handler.on_timeout(entry.proc, entry.kind, entry.generation);
                }
            });
            continue;
        }

        match state.entries.iter().map(|e| e.deadline).min() {
            Some(deadline) => {
                shared.cond.wait_until(&mut state, deadline);
            }
            None => shared.cond.wait(&mut state),
        }
    }
}
