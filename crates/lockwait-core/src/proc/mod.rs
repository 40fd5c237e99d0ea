//! Wakeable handle registry
//!
//! Every worker that may wait for a lock owns one `ProcessHandle`, taken
//! from a fixed-size `ProcArray` when the worker attaches and returned when
//! it detaches. Handles are addressed by a stable `ProcId` arena index.
//!
//! # Architecture
//!
//! - **Semaphore**: `BinarySemaphore`, the only blocking point of a waiter
//! - **Handle**: `ProcessHandle`, wait status, cancel flag and timer indicators
//! - **Registry**: `ProcArray`, the arena and its free list

pub mod handle;
pub mod registry;
pub mod semaphore;

pub use handle::{ProcId, ProcKind, ProcessHandle};
pub use registry::ProcArray;
pub use semaphore::BinarySemaphore;
