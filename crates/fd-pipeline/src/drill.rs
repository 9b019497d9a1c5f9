//! Continuous producer/consumer drill
//!
//! A producer submits one item every `producer_interval` to a single-worker
//! pool that rejects on a full queue; the worker spends
//! `consumer_processing` on each item. With a producer faster than the
//! consumer, lag grows until the queue saturates and rejections start.

use std::sync::Arc;
use std::time::Duration;

use fd_common::{BackpressurePolicy, LagSample, PoolConfig, PoolStats};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::PipelineError;
use crate::lag::{spawn_lag_monitor, LagMonitor, LagMonitorConfig};
use crate::pool::WorkPool;
use crate::Result;

#[derive(Debug, Clone)]
pub struct LagDrillConfig {
    pub queue_capacity: usize,
    pub producer_interval: Duration,
    pub consumer_processing: Duration,
    pub run_duration: Duration,
    pub monitor: LagMonitorConfig,
}

impl Default for LagDrillConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            producer_interval: Duration::from_millis(5),
            consumer_processing: Duration::from_millis(20),
            run_duration: Duration::from_secs(15),
            monitor: LagMonitorConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LagDrillReport {
    /// Periodic samples, oldest first
    pub samples: Vec<LagSample>,
    /// Taken after the producer stopped
    pub final_sample: LagSample,
    pub pool: PoolStats,
}

/// Run the drill until `run_duration` elapses or `shutdown` fires.
///
/// A producer or monitor task that dies is reported as `TaskAborted`.
pub async fn run_lag_drill(config: LagDrillConfig, shutdown: CancellationToken) -> Result<LagDrillReport> {
    if config.producer_interval.is_zero() {
        return Err(PipelineError::InvalidDrill(
            "producer interval must be greater than zero".to_string(),
        ));
    }
    if config.monitor.sample_interval.is_zero() {
        return Err(PipelineError::InvalidDrill(
            "lag sample interval must be greater than zero".to_string(),
        ));
    }

    let pool = Arc::new(WorkPool::start(PoolConfig::new(
        "lag-consumer",
        1,
        config.queue_capacity,
        BackpressurePolicy::RejectAndCount,
    ))?);
    let monitor = Arc::new(LagMonitor::new(pool.clone(), config.monitor.clone()));

    let run = shutdown.child_token();
    let monitor_task = spawn_lag_monitor(Arc::clone(&monitor), run.clone())?;
    let producer_task = tokio::spawn(produce(
        Arc::clone(&pool),
        config.producer_interval,
        config.consumer_processing,
        run.clone(),
    ));

    info!(
        queue_capacity = config.queue_capacity,
        producer_interval_ms = config.producer_interval.as_millis() as u64,
        consumer_processing_ms = config.consumer_processing.as_millis() as u64,
        run_duration_ms = config.run_duration.as_millis() as u64,
        "Starting lag drill"
    );

    tokio::select! {
        _ = tokio::time::sleep(config.run_duration) => info!("Lag drill run duration elapsed"),
        _ = shutdown.cancelled() => info!("Lag drill interrupted"),
    }
    run.cancel();

    let produced = joined("lag-producer", producer_task.await);
    let monitored = joined("lag-monitor", monitor_task.await);

    let final_sample = monitor.snapshot();
    let stats = pool.stats();
    pool.shutdown_now();

    produced?;
    monitored?;

    info!(sample = %final_sample, "Lag drill finished");

    Ok(LagDrillReport {
        samples: monitor.samples(),
        final_sample,
        pool: stats,
    })
}

fn joined(task: &str, result: std::result::Result<(), JoinError>) -> Result<()> {
    result.map_err(|err| {
        error!(task, error = %err, "Drill task ended abnormally");
        PipelineError::TaskAborted {
            task: task.to_string(),
            message: err.to_string(),
        }
    })
}

async fn produce(
    pool: Arc<WorkPool>,
    interval: Duration,
    processing: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let submitted = pool
                    .submit(move || async move {
                        tokio::time::sleep(processing).await;
                        Ok(())
                    })
                    .await;

                match submitted {
                    // Completion is observed through the counters only
                    Ok(_handle) => {}
                    Err(PipelineError::Backpressure(_)) => {}
                    Err(err) => {
                        warn!(error = %err, "Producer stopping");
                        break;
                    }
                }
            }
        }
    }
}
