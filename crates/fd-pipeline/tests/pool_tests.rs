//! WorkPool Tests
//!
//! Tests for:
//! - Backpressure policies under a saturated queue
//! - Queue occupancy bound
//! - Parallel workers
//! - Graceful and immediate shutdown

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;

use fd_common::{BackpressurePolicy, PoolConfig};
use fd_pipeline::{PipelineError, TaskHandle, WorkPool};

/// Wait until `cond` holds, failing the test after a second
async fn wait_until<F: Fn() -> bool>(cond: F) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Occupy the single worker of `pool` until a permit is added to the returned gate
async fn block_worker(pool: &WorkPool) -> (Arc<Semaphore>, TaskHandle<()>) {
    let gate = Arc::new(Semaphore::new(0));
    let held = Arc::clone(&gate);
    let handle = pool
        .submit(move || async move {
            let _permit = held.acquire().await.map_err(|_| PipelineError::Shutdown)?;
            Ok(())
        })
        .await
        .unwrap();
    wait_until(|| pool.counters().active_workers() == 1).await;
    (gate, handle)
}

#[tokio::test]
async fn test_reject_and_count_counts_exact_overflow() {
    let pool = WorkPool::start(PoolConfig::new("reject", 1, 3, BackpressurePolicy::RejectAndCount)).unwrap();
    let (gate, running) = block_worker(&pool).await;

    let mut queued = Vec::new();
    for i in 0..3 {
        queued.push(pool.submit(move || async move { Ok(i) }).await.unwrap());
    }
    assert_eq!(pool.counters().queue_size(), 3);

    for _ in 0..5 {
        let result = pool.submit(|| async { Ok(0) }).await;
        assert!(matches!(result, Err(PipelineError::Backpressure(_))));
        assert!(pool.counters().queue_size() <= 3);
    }
    assert_eq!(pool.counters().rejected(), 5);
    assert_eq!(pool.counters().submitted(), 9);

    gate.add_permits(1);
    running.await.unwrap();
    for (i, handle) in queued.into_iter().enumerate() {
        assert_eq!(handle.await.unwrap(), i);
    }

    wait_until(|| pool.is_fully_drained()).await;
    assert_eq!(pool.counters().consumed(), 4);
}

#[tokio::test]
async fn test_block_caller_runs_overflow_inline() {
    let pool = WorkPool::start(PoolConfig::new("caller", 1, 2, BackpressurePolicy::BlockCaller)).unwrap();
    let (gate, running) = block_worker(&pool).await;

    let mut handles = Vec::new();
    for i in 0..5u32 {
        handles.push(pool.submit(move || async move { Ok(i) }).await.unwrap());
    }
    assert_eq!(pool.counters().queue_size(), 2);
    assert_eq!(pool.counters().caller_runs(), 3);
    assert_eq!(pool.counters().rejected(), 0);

    gate.add_permits(1);
    running.await.unwrap();

    let mut seen: Vec<u32> = Vec::new();
    for handle in handles {
        seen.push(handle.await.unwrap());
    }
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1, 2, 3, 4]);

    wait_until(|| pool.is_fully_drained()).await;
    assert_eq!(pool.counters().consumed(), 6);
}

#[tokio::test]
async fn test_block_producer_rejects_after_timeout() {
    let timeout = Duration::from_millis(50);
    let pool = WorkPool::start(PoolConfig::new(
        "producer",
        1,
        1,
        BackpressurePolicy::BlockProducer { timeout },
    ))
    .unwrap();
    let (gate, running) = block_worker(&pool).await;

    let queued = pool.submit(|| async { Ok("queued") }).await.unwrap();

    let started = Instant::now();
    let result = pool.submit(|| async { Ok("late") }).await;
    assert!(matches!(result, Err(PipelineError::Backpressure(_))));
    assert!(started.elapsed() >= timeout);
    assert_eq!(pool.counters().rejected(), 1);

    gate.add_permits(1);
    running.await.unwrap();
    assert_eq!(queued.await.unwrap(), "queued");
}

#[tokio::test]
async fn test_block_producer_waits_for_free_slot() {
    let pool = WorkPool::start(PoolConfig::new(
        "producer",
        1,
        1,
        BackpressurePolicy::BlockProducer { timeout: Duration::from_secs(2) },
    ))
    .unwrap();
    let (gate, _running) = block_worker(&pool).await;
    let _queued = pool.submit(|| async { Ok(()) }).await.unwrap();

    let release = Arc::clone(&gate);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        release.add_permits(1);
    });

    let handle = pool.submit(|| async { Ok(5) }).await.unwrap();
    assert_eq!(handle.await.unwrap(), 5);
    assert_eq!(pool.counters().rejected(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_workers_run_in_parallel() {
    let pool = WorkPool::start(PoolConfig::new("parallel", 4, 16, BackpressurePolicy::BlockCaller)).unwrap();

    let started = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..8 {
        handles.push(
            pool.submit(|| async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(())
            })
            .await
            .unwrap(),
        );
    }
    for handle in handles {
        handle.await.unwrap();
    }

    // Two rounds of four, not eight sequential sleeps
    assert!(started.elapsed() < Duration::from_millis(700));
    assert_eq!(pool.counters().caller_runs(), 0);
}

#[tokio::test]
async fn test_failed_task_counts_and_worker_survives() {
    let pool = WorkPool::start(PoolConfig::new("failing", 1, 4, BackpressurePolicy::RejectAndCount)).unwrap();

    let failed = pool
        .submit(|| async { Err::<(), _>(PipelineError::TransientSink("sink down".into())) })
        .await
        .unwrap();
    assert_eq!(failed.await, Err(PipelineError::TransientSink("sink down".into())));

    let ok = pool.submit(|| async { Ok(1) }).await.unwrap();
    assert_eq!(ok.await.unwrap(), 1);

    let stats = pool.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.policy, "REJECT_AND_COUNT");
}

#[tokio::test]
async fn test_shutdown_drains_queue() {
    let pool = WorkPool::start(PoolConfig::new("drain", 1, 10, BackpressurePolicy::RejectAndCount)).unwrap();

    let mut handles = Vec::new();
    for i in 0..5 {
        handles.push(
            pool.submit(move || async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(i)
            })
            .await
            .unwrap(),
        );
    }

    pool.shutdown();
    tokio::time::timeout(Duration::from_secs(2), pool.join())
        .await
        .expect("pool should drain");

    assert!(pool.is_fully_drained());
    assert_eq!(pool.counters().consumed(), 5);
    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await.unwrap(), i);
    }
}

#[tokio::test]
async fn test_shutdown_now_discards_queued_tasks() {
    let pool = WorkPool::start(PoolConfig::new("abort", 1, 4, BackpressurePolicy::RejectAndCount)).unwrap();
    let (gate, running) = block_worker(&pool).await;

    let mut queued = Vec::new();
    for _ in 0..3 {
        queued.push(pool.submit(|| async { Ok(()) }).await.unwrap());
    }

    pool.shutdown_now();
    gate.add_permits(1);
    running.await.unwrap();

    for handle in queued {
        assert!(matches!(handle.await, Err(PipelineError::WorkerLost(_))));
    }
    tokio::time::timeout(Duration::from_secs(1), pool.join())
        .await
        .expect("workers should exit");
    assert_eq!(pool.counters().queue_size(), 0);
    assert_eq!(pool.counters().consumed(), 1);
}
