//! Lockwait Core Library
//!
//! This crate provides the lock-wait coordination core, including:
//! - Process registry (fixed arena of wakeable handles)
//! - Per-resource wait queues with a priority insertion heuristic
//! - Deadlock detection over the wait-for graph
//! - The sleep/wake protocol and wake-on-release
//! - Cancellation and cleanup of abandoned waits
//! - Deadlock-check and lock-timeout timers

pub mod config;
pub mod error;
pub mod lock;
pub mod proc;
pub mod timer;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, LockingConfig};
    pub use crate::error::{Error, Result};
    pub use crate::lock::{
        AcquireOutcome, ConflictTable, LockManager, LockMode, LockTag, QueueDiscipline, Worker,
    };
    pub use crate::proc::{ProcId, ProcKind};
}
