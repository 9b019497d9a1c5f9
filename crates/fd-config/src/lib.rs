//! FlowDrill Configuration System
//!
//! TOML-based configuration with environment variable overrides. Every section
//! defaults to the values the drills were tuned with, so an empty file (or no
//! file at all) is a valid configuration.

use fd_common::{BackpressurePolicy, PoolConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Environment variable error: {0}")]
    EnvError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub pools: PoolsConfig,
    pub pipeline: PipelineConfig,
    pub retry: RetryConfig,
    pub lag: LagConfig,
}

/// Work pool sizing and backpressure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolsConfig {
    /// Workers in the I/O pool (ingest and route stages)
    pub io_threads: usize,
    /// Bounded queue capacity of the I/O pool
    pub io_queue_capacity: usize,
    /// Workers in the CPU pool; 0 means one per available core
    pub cpu_threads: usize,
    /// Bounded queue capacity of the CPU pool
    pub cpu_queue_capacity: usize,
    /// BLOCK_CALLER, BLOCK_PRODUCER or REJECT_AND_COUNT
    pub backpressure_policy: String,
    /// Maximum wait under BLOCK_PRODUCER before the item is rejected
    pub block_timeout_ms: u64,
}

impl Default for PoolsConfig {
    fn default() -> Self {
        Self {
            io_threads: 8,
            io_queue_capacity: 500,
            cpu_threads: 0,
            cpu_queue_capacity: 1024,
            backpressure_policy: "BLOCK_CALLER".to_string(),
            block_timeout_ms: 100,
        }
    }
}

/// Batch scenario and stage simulation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Events submitted in the batch scenario
    pub event_count: usize,
    /// Per-event deadline covering every attempt
    pub timeout_ms: u64,
    /// Fraction of route calls that fail with a transient sink error
    pub route_failure_rate: f64,
    /// Seed for failure injection
    pub seed: u64,
    /// Simulated ingest I/O latency
    pub ingest_delay_ms: u64,
    /// Simulated transform CPU work (square-root iterations)
    pub transform_iterations: u32,
    /// Simulated route I/O latency
    pub route_delay_ms: u64,
    /// Re-submit every Nth event id as a duplicate; 0 disables
    pub duplicate_every: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            event_count: 500,
            timeout_ms: 2000,
            route_failure_rate: 0.25,
            seed: 42,
            ingest_delay_ms: 10,
            transform_iterations: 10_000,
            route_delay_ms: 5,
            duplicate_every: 0,
        }
    }
}

/// Fixed-delay retry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 200,
        }
    }
}

/// Continuous producer/consumer scenario
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LagConfig {
    pub queue_capacity: usize,
    pub producer_interval_ms: u64,
    pub consumer_processing_ms: u64,
    pub sample_interval_ms: u64,
    /// How long the scenario runs before shutting itself down
    pub run_duration_ms: u64,
    /// Consecutive growing samples before a lag growth warning
    pub growth_periods_threshold: u32,
    /// Samples retained by the monitor
    pub history_limit: usize,
}

impl Default for LagConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            producer_interval_ms: 5,
            consumer_processing_ms: 20,
            sample_interval_ms: 1000,
            run_duration_ms: 15_000,
            growth_periods_threshold: 3,
            history_limit: 1024,
        }
    }
}

impl PoolsConfig {
    pub fn policy(&self) -> Result<BackpressurePolicy, ConfigError> {
        BackpressurePolicy::from_name(
            &self.backpressure_policy,
            Duration::from_millis(self.block_timeout_ms),
        )
        .map_err(ConfigError::ValidationError)
    }

    /// Effective CPU worker count
    pub fn cpu_workers(&self) -> usize {
        if self.cpu_threads > 0 {
            return self.cpu_threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }

    pub fn io_pool(&self) -> Result<PoolConfig, ConfigError> {
        Ok(PoolConfig::new("io", self.io_threads, self.io_queue_capacity, self.policy()?))
    }

    pub fn cpu_pool(&self) -> Result<PoolConfig, ConfigError> {
        Ok(PoolConfig::new("cpu", self.cpu_workers(), self.cpu_queue_capacity, self.policy()?))
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl PipelineConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    /// Reject configurations the pools and combinators cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::ValidationError(msg.to_string()));

        if self.pools.io_threads == 0 {
            return invalid("pools.io_threads must be at least 1");
        }
        if self.pools.io_queue_capacity == 0 || self.pools.cpu_queue_capacity == 0 {
            return invalid("pool queue capacities must be at least 1");
        }
        self.pools.policy()?;

        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.pipeline.route_failure_rate) {
            return invalid("pipeline.route_failure_rate must be within [0, 1]");
        }
        if self.pipeline.timeout_ms == 0 {
            return invalid("pipeline.timeout_ms must be greater than 0");
        }

        if self.lag.queue_capacity == 0 {
            return invalid("lag.queue_capacity must be at least 1");
        }
        if self.lag.sample_interval_ms == 0 || self.lag.producer_interval_ms == 0 {
            return invalid("lag intervals must be greater than 0");
        }
        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# FlowDrill Configuration
# Environment variables (FLOWDRILL_*) override these settings

[pools]
io_threads = 8
io_queue_capacity = 500
cpu_threads = 0                       # 0 = one per available core
cpu_queue_capacity = 1024
backpressure_policy = "BLOCK_CALLER"  # BLOCK_CALLER, BLOCK_PRODUCER, REJECT_AND_COUNT
block_timeout_ms = 100                # BLOCK_PRODUCER only

[pipeline]
event_count = 500
timeout_ms = 2000
route_failure_rate = 0.25
seed = 42
ingest_delay_ms = 10
transform_iterations = 10000
route_delay_ms = 5
duplicate_every = 0

[retry]
max_attempts = 3
backoff_ms = 200

[lag]
queue_capacity = 100
producer_interval_ms = 5
consumer_processing_ms = 20
sample_interval_ms = 1000
run_duration_ms = 15000
growth_periods_threshold = 3
history_limit = 1024
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.lag.queue_capacity, 100);
        assert_eq!(config.pools.policy().unwrap(), BackpressurePolicy::BlockCaller);
    }

    #[test]
    fn test_example_toml_round_trips_to_defaults() {
        let parsed: AppConfig = toml::from_str(&AppConfig::example_toml()).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed.pools.io_queue_capacity, 500);
        assert_eq!(parsed.pipeline.seed, 42);
        assert_eq!(parsed.retry.backoff(), Duration::from_millis(200));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let parsed: AppConfig = toml::from_str(
            r#"
            [pools]
            backpressure_policy = "REJECT_AND_COUNT"
            io_queue_capacity = 10
            "#,
        )
        .unwrap();
        assert_eq!(parsed.pools.io_queue_capacity, 10);
        assert_eq!(parsed.pools.io_threads, 8);
        assert_eq!(parsed.pools.policy().unwrap(), BackpressurePolicy::RejectAndCount);
        assert_eq!(parsed.pipeline.event_count, 500);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.retry.max_attempts = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));

        let mut config = AppConfig::default();
        config.pipeline.route_failure_rate = 1.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.pools.backpressure_policy = "DISCARD_OLDEST".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_block_producer_uses_configured_timeout() {
        let mut config = AppConfig::default();
        config.pools.backpressure_policy = "BLOCK_PRODUCER".to_string();
        config.pools.block_timeout_ms = 750;
        let pool = config.pools.io_pool().unwrap();
        assert_eq!(
            pool.policy,
            BackpressurePolicy::BlockProducer { timeout: Duration::from_millis(750) }
        );
    }
}
