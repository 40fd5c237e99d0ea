//! Lock waiting, granting and deadlock detection
//!
//! Workers take locks on resources identified by a `LockTag`, in modes
//! whose compatibility is given by a `ConflictTable`. A request that cannot
//! be granted immediately queues and sleeps until a release grants it, the
//! deadlock check fails it, its lock timeout expires or it is cancelled.
//!
//! # Architecture
//!
//! - **Types**: tags, modes, masks, conflict tables, wait statuses
//! - **Queue**: index-linked wait queues over a per-partition slot arena
//! - **Table**: partitioned lock table, grants and wake-on-release
//! - **Deadlock**: wait-for graph with hard and soft edges
//! - **Sleep**: queue placement and the wait loop
//! - **Cleanup**: tearing down an interrupted wait
//! - **Manager/Worker**: the public entry points
//!
//! # Example
//!
//! ```ignore
//! use lockwait_core::prelude::*;
//!
//! let manager = LockManager::with_defaults()?;
//! let mut worker = manager.attach(ProcKind::Regular)?;
//! let exclusive = manager.conflicts().mode("exclusive").unwrap();
//!
//! worker.acquire(LockTag::new(42), exclusive)?;
//! // ... work on resource 42 ...
//! worker.release(LockTag::new(42), exclusive)?;
//! ```

pub mod cleanup;
pub mod deadlock;
pub mod event;
pub mod manager;
pub mod queue;
pub mod sleep;
pub mod table;
pub mod types;
pub mod worker;

pub use deadlock::{Reorder, Verdict, WaitEdge, WaitGraph};
pub use event::{LockWaitEvent, LockWaitEventType};
pub use manager::LockManager;
pub use queue::{WaitLinks, WaitQueue, WaitSlot};
pub use sleep::{Placement, choose_placement};
pub use table::{Lock, LockSnapshot, LockTable, Partition};
pub use types::{
    AcquireOutcome, ConflictTable, DeadlockState, LockMask, LockMode, LockTag, MAX_LOCK_MODES,
    QueueDiscipline, WaitStatus,
};
pub use worker::Worker;
