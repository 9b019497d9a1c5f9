//! Fixed-delay retry over [`Outcome`]-returning operations

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::Outcome;
use crate::timer::Timer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first; values below 1 behave as 1
    pub max_attempts: u32,
    /// Delay between a failed attempt and the next one
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self { max_attempts, backoff }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(200))
    }
}

/// Run `operation` until it stops returning `Retryable` or attempts run out.
///
/// `operation` receives the 1-based attempt number. Each scheduled retry bumps
/// `retries` before the backoff starts. Exhaustion returns the last
/// `Retryable` unchanged. A shutdown during backoff ends the loop with
/// `Fatal(Shutdown)`.
pub async fn retry<T, F, Fut>(
    timer: &Timer,
    policy: RetryPolicy,
    retries: &AtomicU64,
    mut operation: F,
) -> Outcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Outcome<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Outcome::Retryable(err) if attempt < max_attempts => {
                retries.fetch_add(1, Ordering::SeqCst);
                debug!(
                    attempt,
                    max_attempts,
                    backoff_ms = policy.backoff.as_millis() as u64,
                    error = %err,
                    "Attempt failed, scheduling retry"
                );
                if let Err(shutdown) = timer.sleep(policy.backoff).await {
                    return Outcome::Fatal(shutdown);
                }
                attempt += 1;
            }
            Outcome::Retryable(err) => {
                warn!(attempts = attempt, error = %err, "Retry attempts exhausted");
                return Outcome::Retryable(err);
            }
            other => return other,
        }
    }
}

/// A retry policy bound to a timer and a shared retry counter
#[derive(Debug, Clone)]
pub struct Retrier {
    timer: Timer,
    policy: RetryPolicy,
    retries: Arc<AtomicU64>,
}

impl Retrier {
    pub fn new(timer: Timer, policy: RetryPolicy) -> Self {
        Self {
            timer,
            policy,
            retries: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn run<T, F, Fut>(&self, operation: F) -> Outcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Outcome<T>>,
    {
        retry(&self.timer, self.policy, &self.retries, operation).await
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Retries scheduled so far across every operation run through this retrier
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::SeqCst)
    }
}
