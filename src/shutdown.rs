//! Graceful drain coordination.
//!
//! Batches dispatched in the background hold a [`DrainGuard`]; shutdown
//! stops admitting new work and waits for outstanding guards up to a
//! deadline.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Drain state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Draining,
    Stopped,
}

/// Result of a drain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainResult {
    Complete,
    Timeout { remaining: usize },
}

struct Inner {
    state: Mutex<ShutdownState>,
    in_flight: AtomicUsize,
    notify: Notify,
}

/// Tracks in-flight batches and drains them on shutdown.
#[derive(Clone)]
pub struct DrainCoordinator {
    inner: Arc<Inner>,
}

impl DrainCoordinator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(ShutdownState::Running),
                in_flight: AtomicUsize::new(0),
                notify: Notify::new(),
            }),
        }
    }

    pub fn state(&self) -> ShutdownState {
        *self.inner.state.lock()
    }

    pub fn is_accepting(&self) -> bool {
        self.state() == ShutdownState::Running
    }

    /// Track a batch. Returns None once draining has begun.
    pub fn track(&self) -> Option<DrainGuard> {
        let state = self.inner.state.lock();
        if *state != ShutdownState::Running {
            return None;
        }
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        Some(DrainGuard {
            inner: Arc::clone(&self.inner),
        })
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Stop admitting and wait for tracked batches, up to `timeout`.
    pub async fn drain(&self, timeout: Duration) -> DrainResult {
        *self.inner.state.lock() = ShutdownState::Draining;
        let result = self.wait_for_drain(timeout).await;
        *self.inner.state.lock() = ShutdownState::Stopped;
        result
    }

    async fn wait_for_drain(&self, timeout: Duration) -> DrainResult {
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before checking so a release in between is
            // not missed.
            let notified = self.inner.notify.notified();
            let count = self.in_flight();
            if count == 0 {
                return DrainResult::Complete;
            }
            tokio::select! {
                () = notified => continue,
                () = tokio::time::sleep_until(deadline) => {
                    let remaining = self.in_flight();
                    if remaining == 0 {
                        return DrainResult::Complete;
                    }
                    return DrainResult::Timeout { remaining };
                }
            }
        }
    }
}

impl Default for DrainCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for one in-flight batch.
pub struct DrainGuard {
    inner: Arc<Inner>,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drains_immediately_when_idle() {
        let drain = DrainCoordinator::new();
        assert!(drain.is_accepting());
        assert_eq!(drain.drain(Duration::from_secs(1)).await, DrainResult::Complete);
        assert_eq!(drain.state(), ShutdownState::Stopped);
        assert!(drain.track().is_none());
    }

    #[tokio::test]
    async fn waits_for_guards() {
        let drain = DrainCoordinator::new();
        let guard = drain.track().unwrap();
        assert_eq!(drain.in_flight(), 1);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(guard);
        });
        assert_eq!(drain.drain(Duration::from_secs(5)).await, DrainResult::Complete);
        assert_eq!(drain.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_with_remaining_count() {
        let drain = DrainCoordinator::new();
        let _a = drain.track().unwrap();
        let _b = drain.track().unwrap();
        let result = drain.drain(Duration::from_millis(100)).await;
        assert_eq!(result, DrainResult::Timeout { remaining: 2 });
    }
}
