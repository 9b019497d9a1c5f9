//! Retry and Timeout Tests
//!
//! Tests for:
//! - Fixed-delay retry: recovery, exhaustion, fatal short-circuit
//! - Retry counter accounting
//! - Deadline race: timeout at the configured duration, loser left running
//! - Shutdown interrupting backoff and deadlines

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use fd_pipeline::{retry, with_timeout, Outcome, PipelineError, Retrier, RetryPolicy, Timer};

fn timer() -> Timer {
    Timer::new(CancellationToken::new())
}

fn transient() -> PipelineError {
    PipelineError::TransientSink("sink unavailable".to_string())
}

#[tokio::test]
async fn test_recovers_on_last_attempt() {
    let timer = timer();
    let retries = AtomicU64::new(0);
    let calls = AtomicU32::new(0);
    let policy = RetryPolicy::new(3, Duration::from_millis(10));

    let outcome = retry(&timer, policy, &retries, |attempt| {
        calls.fetch_add(1, Ordering::SeqCst);
        async move {
            if attempt < 3 {
                Outcome::Retryable(transient())
            } else {
                Outcome::Success(attempt)
            }
        }
    })
    .await;

    assert_eq!(outcome, Outcome::Success(3));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(retries.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_exhaustion_surfaces_original_failure() {
    let timer = timer();
    let retries = AtomicU64::new(0);
    let calls = AtomicU32::new(0);
    let policy = RetryPolicy::new(4, Duration::from_millis(5));

    let outcome: Outcome<()> = retry(&timer, policy, &retries, |_| {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Outcome::Retryable(transient()) }
    })
    .await;

    assert_eq!(outcome, Outcome::Retryable(transient()));
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(retries.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_fatal_is_not_retried() {
    let timer = timer();
    let retries = AtomicU64::new(0);
    let calls = AtomicU32::new(0);

    let outcome: Outcome<()> = retry(&timer, RetryPolicy::default(), &retries, |_| {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Outcome::Fatal(PipelineError::WorkerLost("io".into())) }
    })
    .await;

    assert!(matches!(outcome, Outcome::Fatal(PipelineError::WorkerLost(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(retries.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_backoff_is_constant_delay() {
    let timer = timer();
    let retries = AtomicU64::new(0);
    let backoff = Duration::from_millis(40);

    let started = Instant::now();
    let outcome: Outcome<()> = retry(&timer, RetryPolicy::new(3, backoff), &retries, |_| async {
        Outcome::Retryable(transient())
    })
    .await;

    let elapsed = started.elapsed();
    assert!(matches!(outcome, Outcome::Retryable(_)));
    assert!(elapsed >= backoff * 2, "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(500), "elapsed {:?}", elapsed);
}

#[tokio::test]
async fn test_zero_attempts_behaves_as_one() {
    let timer = timer();
    let retries = AtomicU64::new(0);

    let outcome: Outcome<()> = retry(&timer, RetryPolicy::new(0, Duration::from_millis(1)), &retries, |_| async {
        Outcome::Retryable(transient())
    })
    .await;

    assert!(matches!(outcome, Outcome::Retryable(_)));
    assert_eq!(retries.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_retrier_accumulates_across_operations() {
    let retrier = Retrier::new(timer(), RetryPolicy::new(2, Duration::from_millis(1)));

    for _ in 0..3 {
        let outcome: Outcome<()> = retrier.run(|_| async { Outcome::Retryable(transient()) }).await;
        assert!(matches!(outcome, Outcome::Retryable(_)));
    }
    assert_eq!(retrier.retries(), 3);
}

#[tokio::test]
async fn test_shutdown_interrupts_backoff() {
    let token = CancellationToken::new();
    let timer = Timer::new(token.clone());
    let retries = Arc::new(AtomicU64::new(0));

    let task = {
        let timer = timer.clone();
        let retries = Arc::clone(&retries);
        tokio::spawn(async move {
            retry(&timer, RetryPolicy::new(5, Duration::from_secs(30)), &retries, |_| async {
                Outcome::<()>::Retryable(transient())
            })
            .await
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    token.cancel();

    let outcome = tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("retry should stop promptly")
        .unwrap();
    assert_eq!(outcome, Outcome::Fatal(PipelineError::Shutdown));
    assert_eq!(retries.load(Ordering::SeqCst), 1);
    assert_eq!(timer.pending(), 0);
}

#[tokio::test]
async fn test_timeout_fires_at_deadline_and_loser_keeps_running() {
    let timer = timer();
    let finished = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&finished);

    let started = Instant::now();
    let outcome = with_timeout(&timer, Duration::from_millis(100), async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        flag.store(true, Ordering::SeqCst);
        Outcome::Success("late")
    })
    .await;
    let elapsed = started.elapsed();

    assert_eq!(outcome, Outcome::TimedOut);
    assert!(elapsed >= Duration::from_millis(100), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(280), "elapsed {:?}", elapsed);
    assert!(!finished.load(Ordering::SeqCst));

    // Not cancelled: the detached operation still completes
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(finished.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_fast_operation_beats_deadline() {
    let timer = timer();
    let outcome = with_timeout(&timer, Duration::from_secs(1), async { Outcome::Success(7) }).await;
    assert_eq!(outcome, Outcome::Success(7));
    assert_eq!(timer.pending(), 0);
}

#[tokio::test]
async fn test_deadline_covers_all_attempts() {
    let timer = timer();
    let inner_timer = timer.clone();

    let outcome: Outcome<()> = with_timeout(&timer, Duration::from_millis(150), async move {
        let retries = AtomicU64::new(0);
        retry(&inner_timer, RetryPolicy::new(3, Duration::from_millis(100)), &retries, |_| async {
            Outcome::Retryable(transient())
        })
        .await
    })
    .await;

    assert_eq!(outcome, Outcome::TimedOut);
}

#[tokio::test]
async fn test_shutdown_during_deadline_is_fatal() {
    let token = CancellationToken::new();
    let timer = Timer::new(token.clone());

    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let outcome: Outcome<()> = with_timeout(&timer, Duration::from_secs(30), async {
        std::future::pending::<()>().await;
        Outcome::Success(())
    })
    .await;

    assert_eq!(outcome, Outcome::Fatal(PipelineError::Shutdown));
}
