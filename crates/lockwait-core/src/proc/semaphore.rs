//! Binary semaphore used to park a waiting worker

use parking_lot::{Condvar, Mutex};

/// A semaphore whose count saturates at one
///
/// A `signal` that arrives before `wait` is remembered, so a wakeup sent
/// between releasing the partition mutex and blocking is never lost. The
/// flip side is that a stale signal may be left over from an earlier wait;
/// waiters must re-check their predicate after every wakeup.
#[derive(Debug, Default)]
pub struct BinarySemaphore {
    available: Mutex<bool>,
    cond: Condvar,
}

impl BinarySemaphore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until signalled, consuming the signal
    pub fn wait(&self) {
        let mut available = self.available.lock();
        while !*available {
            self.cond.wait(&mut available);
        }
        *available = false;
    }

    /// Wake the waiter, or leave a signal for the next `wait`
    pub fn signal(&self) {
        let mut available = self.available.lock();
        *available = true;
        self.cond.notify_one();
    }

    /// Discard any pending signal
    pub fn reset(&self) {
        *self.available.lock() = false;
    }

    /// Whether a signal is pending
    pub fn is_signalled(&self) -> bool {
        *self.available.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_signal_before_wait_is_saved() {
        let sem = BinarySemaphore::new();
        sem.signal();
        sem.signal();
        assert!(sem.is_signalled());
        // Two signals collapse into one.
        sem.wait();
        assert!(!sem.is_signalled());
    }

    #[test]
    fn test_reset_discards_signal() {
        let sem = BinarySemaphore::new();
        sem.signal();
        sem.reset();
        assert!(!sem.is_signalled());
    }

    #[test]
    fn test_wakes_blocked_thread() {
        let sem = Arc::new(BinarySemaphore::new());
        let waiter = {
            let sem = sem.clone();
            thread::spawn(move || sem.wait())
        };
        thread::sleep(Duration::from_millis(20));
        sem.signal();
        waiter.join().expect("waiter thread panicked");
    }
}
