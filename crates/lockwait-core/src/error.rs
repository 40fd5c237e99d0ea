//! Error types for lockwait

use thiserror::Error;

use crate::lock::{LockMode, LockTag};
use crate::proc::ProcId;

/// Result type alias using lockwait's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Lock-wait error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // Wait outcomes (E300-E309)
    #[error("Deadlock detected: worker {worker} waiting for mode {mode} on {resource}")]
    Deadlock {
        worker: ProcId,
        resource: LockTag,
        mode: LockMode,
    },

    #[error("Lock timeout: worker {worker} waited {waited_ms} ms for mode {mode} on {resource}")]
    LockTimeout {
        worker: ProcId,
        resource: LockTag,
        mode: LockMode,
        waited_ms: u64,
    },

    #[error("Lock wait cancelled: worker {worker} stopped waiting on {resource}")]
    Cancelled { worker: ProcId, resource: LockTag },

    // Registry errors (E310-E319)
    #[error("Sorry, too many workers already: all {capacity} process slots are in use")]
    RegistryExhausted { capacity: usize },

    // State errors (E320-E329)
    #[error("Lock table invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Invalid lock mode {mode}: conflict table defines modes 1..={max}")]
    InvalidLockMode { mode: u8, max: u8 },

    #[error("Worker {worker} does not hold mode {mode} on {resource}")]
    NotHeld {
        worker: ProcId,
        resource: LockTag,
        mode: LockMode,
    },

    #[error("Timer thread unavailable: {0}")]
    TimerUnavailable(String),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::Deadlock { .. } => "E300",
            Self::LockTimeout { .. } => "E301",
            Self::Cancelled { .. } => "E302",
            Self::RegistryExhausted { .. } => "E310",
            Self::InvariantViolation(_) => "E320",
            Self::InvalidLockMode { .. } => "E321",
            Self::NotHeld { .. } => "E322",
            Self::TimerUnavailable(_) => "E330",
            Self::ConfigError(_) => "E600",
        }
    }

    /// Whether the caller may abort its unit of work and try again.
    ///
    /// Registry exhaustion and invariant violations terminate the worker.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Deadlock { .. } | Self::LockTimeout { .. } | Self::Cancelled { .. }
        )
    }

    /// Whether this error must terminate the offending worker
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::RegistryExhausted { .. } | Self::InvariantViolation(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = Error::Deadlock {
            worker: ProcId::new(1),
            resource: LockTag::new(7),
            mode: LockMode::new(2),
        };
        assert_eq!(err.code(), "E300");
        assert!(err.is_retryable());
        assert!(!err.is_fatal());

        let err = Error::RegistryExhausted { capacity: 4 };
        assert_eq!(err.code(), "E310");
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_messages_name_the_resource() {
        let err = Error::LockTimeout {
            worker: ProcId::new(3),
            resource: LockTag::new(42),
            mode: LockMode::new(1),
            waited_ms: 250,
        };
        let msg = err.to_string();
        assert!(msg.contains("resource:42"));
        assert!(msg.contains("250 ms"));
    }
}
