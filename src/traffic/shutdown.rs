//! # Graceful Shutdown System
//!
//! Drain control for the gateway. Once draining begins, new requests are
//! rejected with 503 while in-flight requests and open streaming sessions keep
//! running. They get until the grace deadline to finish; at the deadline the
//! force-close token fires and every request token derived from it is cancelled.
//!
//! The controller knows nothing about OS signals. Whoever owns the process
//! calls `drain` when it decides to stop.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::error::{GatewayError, GatewayResult};

/// How a drain finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every request and session finished inside the grace period
    Completed,
    /// The deadline passed and the remaining work was force-closed
    ForceClosed { remaining: u64 },
}

#[derive(Debug, Default)]
struct DrainState {
    draining: AtomicBool,
    in_flight: AtomicU64,
    idle: Notify,
    force_close: CancellationToken,
}

/// Shared drain state; cheap to clone
#[derive(Debug, Clone, Default)]
pub struct DrainController {
    state: Arc<DrainState>,
}

impl DrainController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a new request, or reject it if draining has begun
    pub fn start_request(&self) -> GatewayResult<RequestGuard> {
        if self.is_draining() {
            return Err(GatewayError::draining());
        }

        self.state.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = RequestGuard {
            state: self.state.clone(),
        };

        // Draining may have started between the check and the increment
        if self.is_draining() {
            return Err(GatewayError::draining());
        }

        Ok(guard)
    }

    /// Token cancelled when the gateway force-closes; parent of every request token
    pub fn force_close_token(&self) -> CancellationToken {
        self.state.force_close.clone()
    }

    /// Fresh per-request token that also fires on force-close
    pub fn request_token(&self) -> CancellationToken {
        self.state.force_close.child_token()
    }

    /// Flip the gateway into draining mode; returns false if it already was
    pub fn begin_draining(&self) -> bool {
        let first = !self.state.draining.swap(true, Ordering::SeqCst);
        if first {
            info!(in_flight = self.in_flight(), "Draining started, rejecting new requests");
        }
        first
    }

    pub fn is_draining(&self) -> bool {
        self.state.draining.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> u64 {
        self.state.in_flight.load(Ordering::SeqCst)
    }

    /// Cancel all remaining work immediately
    pub fn force_close(&self) {
        self.state.force_close.cancel();
    }

    /// Begin draining and wait for in-flight work, force-closing at the deadline
    pub async fn drain(&self, grace: Duration) -> DrainOutcome {
        self.begin_draining();
        let deadline = Instant::now() + grace;

        let outcome = loop {
            let notified = self.state.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let remaining = self.in_flight();
            if remaining == 0 {
                break DrainOutcome::Completed;
            }
            debug!(remaining, "Waiting for in-flight requests to complete");

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    let remaining = self.in_flight();
                    if remaining == 0 {
                        break DrainOutcome::Completed;
                    }
                    break DrainOutcome::ForceClosed { remaining };
                }
            }
        };

        match outcome {
            DrainOutcome::Completed => {
                info!("All in-flight requests completed");
            }
            DrainOutcome::ForceClosed { remaining } => {
                let event = GatewayError::ShutdownTimeout { remaining };
                warn!(remaining, "{}, force closing", event);
                self.force_close();
            }
        }
        crate::observability::metrics::record_drain(&outcome);

        outcome
    }
}

/// RAII guard for tracking request lifecycle
#[derive(Debug)]
pub struct RequestGuard {
    state: Arc<DrainState>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        if self.state.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.state.idle.notify_waiters();
        }
    }
}
