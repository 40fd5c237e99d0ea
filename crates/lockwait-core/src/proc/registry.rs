//! Fixed-size arena of process handles

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

use super::handle::{ProcId, ProcKind, ProcessHandle};
use crate::error::{Error, Result};

/// Registry mapping `ProcId`s to wakeable handles
///
/// All handles are allocated up front; attaching pops one from the free
/// list and detaching pushes it back.
#[derive(Debug)]
pub struct ProcArray {
    procs: Vec<Arc<ProcessHandle>>,
    in_use: Vec<AtomicBool>,
    free: Mutex<Vec<ProcId>>,
}

impl ProcArray {
    pub fn new(capacity: usize) -> Self {
        let procs = (0..capacity)
            .map(|i| Arc::new(ProcessHandle::new(ProcId::new(i as u32))))
            .collect();
        let in_use = (0..capacity).map(|_| AtomicBool::new(false)).collect();
        // Reverse so that the lowest ids are handed out first.
        let free = (0..capacity as u32).rev().map(ProcId::new).collect();

        Self {
            procs,
            in_use,
            free: Mutex::new(free),
        }
    }

    /// Total number of slots
    pub fn capacity(&self) -> usize {
        self.procs.len()
    }

    /// Take a handle from the free list
    pub fn attach(&self, kind: ProcKind) -> Result<Arc<ProcessHandle>> {
        let id = self.free.lock().pop().ok_or(Error::RegistryExhausted {
            capacity: self.capacity(),
        })?;

        let handle = self.procs[id.index()].clone();
        handle.reset();
        handle.set_kind(kind);
        self.in_use[id.index()].store(true, Ordering::Release);

        debug!(proc = %id, ?kind, "Attached process handle");
        Ok(handle)
    }

    /// Return a handle to the free list
    pub fn detach(&self, id: ProcId) {
        let Some(slot) = self.in_use.get(id.index()) else {
            return;
        };
        if !slot.swap(false, Ordering::AcqRel) {
            return;
        }
        self.procs[id.index()].reset();
        self.free.lock().push(id);
        debug!(proc = %id, "Detached process handle");
    }

    /// Look up a live handle; `None` if the slot is free or out of range
    pub fn lookup(&self, id: ProcId) -> Option<Arc<ProcessHandle>> {
        let live = self.in_use.get(id.index())?.load(Ordering::Acquire);
        live.then(|| self.procs[id.index()].clone())
    }

    /// Handle by index regardless of liveness
    pub(crate) fn get(&self, id: ProcId) -> Option<&ProcessHandle> {
        self.procs.get(id.index()).map(Arc::as_ref)
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Whether at least `n` slots are free
    pub fn have_free(&self, n: usize) -> bool {
        self.free_count() >= n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_until_exhausted() {
        let procs = ProcArray::new(2);
        let a = procs.attach(ProcKind::Regular).unwrap();
        let b = procs.attach(ProcKind::Background).unwrap();

        assert_eq!(a.id(), ProcId::new(0));
        assert_eq!(b.id(), ProcId::new(1));
        assert_eq!(b.kind(), ProcKind::Background);

        let err = procs.attach(ProcKind::Regular).unwrap_err();
        assert_eq!(err, Error::RegistryExhausted { capacity: 2 });
    }

    #[test]
    fn test_detach_returns_slot() {
        let procs = ProcArray::new(1);
        let a = procs.attach(ProcKind::Background).unwrap();
        assert!(!procs.have_free(1));

        procs.detach(a.id());
        assert!(procs.have_free(1));
        assert!(procs.lookup(a.id()).is_none());

        // Detaching twice is harmless.
        procs.detach(a.id());
        assert_eq!(procs.free_count(), 1);

        let again = procs.attach(ProcKind::Regular).unwrap();
        assert_eq!(again.id(), a.id());
        assert_eq!(again.kind(), ProcKind::Regular);
    }

    #[test]
    fn test_lookup_out_of_range() {
        let procs = ProcArray::new(1);
        assert!(procs.lookup(ProcId::new(5)).is_none());
    }
}
