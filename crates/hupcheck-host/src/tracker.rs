//! Count of open connections, so callers can wait for a drain.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct ConnectionTracker {
    active: Mutex<usize>,
    drained: Condvar,
}

impl ConnectionTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        self.active.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Count a newly accepted connection. Dropping the guard uncounts it.
    pub fn acquire(self: &Arc<Self>) -> ConnectionGuard {
        *self.lock() += 1;
        ConnectionGuard {
            tracker: Arc::clone(self),
        }
    }

    fn release(&self) {
        let mut active = self.lock();
        *active = active.saturating_sub(1);
        if *active == 0 {
            self.drained.notify_all();
        }
    }

    pub fn active(&self) -> usize {
        *self.lock()
    }

    /// Block until no connections are open.
    pub fn wait(&self) {
        let active = self.lock();
        let _drained = self
            .drained
            .wait_while(active, |n| *n > 0)
            .unwrap_or_else(|p| p.into_inner());
    }

    /// Like [`wait`](Self::wait) with a deadline. Returns false on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let active = self.lock();
        let (_active, result) = self
            .drained
            .wait_timeout_while(active, timeout, |n| *n > 0)
            .unwrap_or_else(|p| p.into_inner());
        !result.timed_out()
    }
}

/// One counted connection.
#[derive(Debug)]
pub struct ConnectionGuard {
    tracker: Arc<ConnectionTracker>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.release();
    }
}
