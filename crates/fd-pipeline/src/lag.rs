//! Lag Monitor - periodic produced/consumed/queue sampling
//!
//! Samples are built from atomic counter reads only, so sampling never blocks
//! producers or consumers. Lag growing for several consecutive samples is
//! logged as a warning.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fd_common::LagSample;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::pool::WorkPool;
use crate::Result;

/// Counters a lag monitor can observe
pub trait LagSource: Send + Sync {
    fn produced(&self) -> u64;
    fn consumed(&self) -> u64;
    fn rejected(&self) -> u64;
    fn queue_size(&self) -> u32;
    fn queue_capacity(&self) -> u32;
}

impl LagSource for WorkPool {
    fn produced(&self) -> u64 {
        self.counters().submitted()
    }

    fn consumed(&self) -> u64 {
        self.counters().consumed()
    }

    fn rejected(&self) -> u64 {
        self.counters().rejected()
    }

    fn queue_size(&self) -> u32 {
        self.counters().queue_size()
    }

    fn queue_capacity(&self) -> u32 {
        self.config().queue_capacity as u32
    }
}

#[derive(Debug, Clone)]
pub struct LagMonitorConfig {
    pub sample_interval: Duration,
    /// Consecutive growing samples before a warning
    pub growth_periods_threshold: u32,
    /// Samples retained; oldest are dropped first
    pub history_limit: usize,
}

impl Default for LagMonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(1),
            growth_periods_threshold: 3,
            history_limit: 1024,
        }
    }
}

#[derive(Default)]
struct LagHistory {
    samples: VecDeque<LagSample>,
    consecutive_growth_periods: u32,
}

pub struct LagMonitor {
    config: LagMonitorConfig,
    source: Arc<dyn LagSource>,
    history: parking_lot::Mutex<LagHistory>,
}

impl LagMonitor {
    pub fn new(source: Arc<dyn LagSource>, config: LagMonitorConfig) -> Self {
        Self {
            config,
            source,
            history: parking_lot::Mutex::new(LagHistory::default()),
        }
    }

    /// Read the counters without recording anything.
    ///
    /// Consumed is read before produced: both only grow and nothing is
    /// consumed before it is produced, so the sample never shows negative lag.
    pub fn snapshot(&self) -> LagSample {
        let consumed = self.source.consumed();
        let rejected = self.source.rejected();
        let queue_size = self.source.queue_size();
        let produced = self.source.produced();

        LagSample {
            produced,
            consumed,
            queue_size,
            queue_capacity: self.source.queue_capacity(),
            rejected,
            timestamp: Utc::now(),
        }
    }

    /// Take a sample, record it and emit it
    pub fn sample(&self) -> LagSample {
        let sample = self.snapshot();

        info!(
            produced = sample.produced,
            consumed = sample.consumed,
            lag = sample.lag(),
            queue_size = sample.queue_size,
            occupancy_pct = sample.occupancy_pct(),
            rejected = sample.rejected,
            "{}",
            sample
        );

        self.record(sample.clone());
        sample
    }

    fn record(&self, sample: LagSample) {
        let mut history = self.history.lock();
        let previous_lag = history.samples.back().map(LagSample::lag);

        if let Some(previous_lag) = previous_lag {
            if sample.lag() > previous_lag {
                history.consecutive_growth_periods += 1;
                if history.consecutive_growth_periods >= self.config.growth_periods_threshold {
                    warn!(
                        periods = history.consecutive_growth_periods,
                        lag = sample.lag(),
                        growth = sample.lag() - previous_lag,
                        "Consumer lag growing"
                    );
                    // Cap at 10 to avoid warning spam
                    history.consecutive_growth_periods = history.consecutive_growth_periods.min(10);
                }
            } else {
                if history.consecutive_growth_periods > 0 {
                    debug!(
                        periods = history.consecutive_growth_periods,
                        "Consumer lag stopped growing"
                    );
                }
                history.consecutive_growth_periods = 0;
            }
        }

        history.samples.push_back(sample);
        while history.samples.len() > self.config.history_limit.max(1) {
            history.samples.pop_front();
        }
    }

    pub fn samples(&self) -> Vec<LagSample> {
        self.history.lock().samples.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<LagSample> {
        self.history.lock().samples.back().cloned()
    }

    pub fn consecutive_growth_periods(&self) -> u32 {
        self.history.lock().consecutive_growth_periods
    }

    pub fn config(&self) -> &LagMonitorConfig {
        &self.config
    }
}

/// Spawn the sampling loop. It runs until `shutdown` fires.
///
/// Fails with `InvalidDrill` for a zero sample interval.
pub fn spawn_lag_monitor(
    monitor: Arc<LagMonitor>,
    shutdown: CancellationToken,
) -> Result<JoinHandle<()>> {
    let interval = monitor.config.sample_interval;
    if interval.is_zero() {
        return Err(PipelineError::InvalidDrill(
            "lag sample interval must be greater than zero".to_string(),
        ));
    }

    Ok(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Lag monitor shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    monitor.sample();
                }
            }
        }
    }))
}
