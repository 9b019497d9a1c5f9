//! Shared timer for retry backoff and deadlines.
//!
//! One timer serves every event in a run. Sleeps end early with
//! [`PipelineError::Shutdown`] once the run's cancellation token fires, so no
//! backoff or deadline outlives shutdown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;
use crate::Result;

#[derive(Debug, Clone)]
pub struct Timer {
    shutdown: CancellationToken,
    pending: Arc<AtomicU64>,
}

impl Timer {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            shutdown,
            pending: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Wait for `delay`, or fail with `Shutdown` if the token fires first
    pub async fn sleep(&self, delay: Duration) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(PipelineError::Shutdown);
        }

        self.pending.fetch_add(1, Ordering::SeqCst);
        let _pending = PendingGuard(&self.pending);

        tokio::select! {
            _ = self.shutdown.cancelled() => Err(PipelineError::Shutdown),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Timers currently waiting
    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.shutdown
    }
}

/// Decrements the pending count however the sleep ends, including when the
/// sleeping future is dropped by a lost race.
struct PendingGuard<'a>(&'a AtomicU64);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
