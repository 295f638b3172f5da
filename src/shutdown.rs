//! Graceful shutdown coordination.
//!
//! Drain-then-stop: admission closes first, in-flight client requests get a
//! bounded window to finish, then the scheduler thread is cancelled.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownResult {
    Complete,
    Timeout { remaining: u32 },
}

/// Coordinates drain-then-stop across the controller's threads.
pub struct ShutdownCoordinator {
    state: Mutex<ShutdownState>,
    drained: Arc<Condvar>,
    in_flight: Arc<AtomicU32>,
    cancel: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ShutdownState::Running),
            drained: Arc::new(Condvar::new()),
            in_flight: Arc::new(AtomicU32::new(0)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.lock()
    }

    pub fn is_accepting(&self) -> bool {
        *self.state.lock() == ShutdownState::Running
    }

    /// Token the scheduler thread watches for cancellation.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Track an in-flight request. Returns None once draining has begun.
    /// The guard is owned and may travel into a completion callback.
    pub fn track(&self) -> Option<ShutdownGuard> {
        if !self.is_accepting() {
            return None;
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Some(ShutdownGuard {
            in_flight: self.in_flight.clone(),
            drained: self.drained.clone(),
        })
    }

    pub fn in_flight_count(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Close admission, wait for in-flight requests to drain (bounded),
    /// then cancel the scheduler thread.
    pub fn initiate(&self, timeout: Duration) -> ShutdownResult {
        *self.state.lock() = ShutdownState::Draining;

        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        let result = loop {
            let count = self.in_flight.load(Ordering::SeqCst);
            if count == 0 {
                break ShutdownResult::Complete;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break ShutdownResult::Timeout { remaining: count };
            }
            self.drained.wait_for(&mut state, remaining);
        };
        *state = ShutdownState::Stopped;
        drop(state);

        self.cancel.cancel();
        result
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for one in-flight request.
pub struct ShutdownGuard {
    in_flight: Arc<AtomicU32>,
    drained: Arc<Condvar>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.drained.notify_all();
    }
}
