//! Lock-wait events
//!
//! Reports produced by waiters once the deadlock check has run for them,
//! published to an optional bounded channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::types::{LockMode, LockTag};
use crate::proc::ProcId;

/// Type of lock-wait event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockWaitEventType {
    /// The waiter is still blocked after the deadlock check
    StillWaiting,
    /// The waiter was granted the lock after the deadlock check
    Acquired,
    /// A soft deadlock was resolved by rearranging a wait queue
    AvoidedDeadlock,
    /// A hard deadlock was found and this waiter was chosen to fail
    DeadlockDetected,
    /// The wait ended without the lock
    FailedToAcquire,
    /// A background worker blocking this waiter was asked to cancel
    BackgroundCancelled,
}

impl LockWaitEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StillWaiting => "still_waiting",
            Self::Acquired => "acquired",
            Self::AvoidedDeadlock => "avoided_deadlock",
            Self::DeadlockDetected => "deadlock_detected",
            Self::FailedToAcquire => "failed_to_acquire",
            Self::BackgroundCancelled => "background_cancelled",
        }
    }
}

impl std::fmt::Display for LockWaitEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A lock-wait event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockWaitEvent {
    /// Unique event identifier
    pub id: Uuid,
    pub event_type: LockWaitEventType,
    pub worker: ProcId,
    pub resource: LockTag,
    pub mode: LockMode,
    /// Milliseconds since the deadlock timer was armed
    pub waited_ms: u64,
    /// Holders and waiters at the time of the report
    pub data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl LockWaitEvent {
    pub fn new(
        event_type: LockWaitEventType,
        worker: ProcId,
        resource: LockTag,
        mode: LockMode,
        waited_ms: u64,
        data: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            worker,
            resource,
            mode,
            waited_ms,
            data,
            created_at: Utc::now(),
        }
    }

    /// Report with the holder and waiter lists of the awaited lock
    pub fn wait_report(
        event_type: LockWaitEventType,
        worker: ProcId,
        resource: LockTag,
        mode: LockMode,
        waited_ms: u64,
        holders: &[ProcId],
        waiters: &[ProcId],
    ) -> Self {
        let data = serde_json::json!({
            "holders": holders,
            "waiters": waiters,
        });
        Self::new(event_type, worker, resource, mode, waited_ms, Some(data))
    }

    /// A background blocker was asked to give up its lock
    pub fn background_cancelled(
        worker: ProcId,
        resource: LockTag,
        mode: LockMode,
        blocker: ProcId,
    ) -> Self {
        let data = serde_json::json!({ "blocker": blocker });
        Self::new(
            LockWaitEventType::BackgroundCancelled,
            worker,
            resource,
            mode,
            0,
            Some(data),
        )
    }
}
