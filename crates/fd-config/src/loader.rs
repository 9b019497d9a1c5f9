//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{debug, info};

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "flowdrill.toml",
    "config.toml",
    "./config/flowdrill.toml",
];

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "FLOWDRILL_CONFIG";

/// Configuration loader
#[derive(Debug, Default)]
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found), apply environment overrides, validate
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        self.load_with(|key| env::var(key).ok())
    }

    /// Same as [`load`](Self::load) with a caller-supplied variable lookup
    pub fn load_with<F>(&self, lookup: F) -> Result<AppConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file(&lookup)? {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        } else {
            debug!("No configuration file found, using defaults");
        }

        apply_overrides(&mut config, &lookup)?;
        config.validate()?;

        Ok(config)
    }

    /// Find the configuration file to use.
    /// An explicitly requested file that does not exist is an error.
    fn find_config_file<F>(&self, lookup: &F) -> Result<Option<PathBuf>, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Ok(Some(path.clone()));
            }
            return Err(ConfigError::ReadError(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("config file not found: {}", path.display()),
            )));
        }

        if let Some(path) = lookup(CONFIG_ENV_VAR) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(ConfigError::EnvError(format!(
                "{} points to a missing file: {}",
                CONFIG_ENV_VAR,
                path.display()
            )));
        }

        Ok(CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists()))
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::EnvError(format!("{}={} is not a valid value", key, raw))),
    }
}

/// Apply `FLOWDRILL_*` overrides
fn apply_overrides<F>(config: &mut AppConfig, lookup: &F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    // Pools
    if let Some(v) = parse_var(lookup, "FLOWDRILL_IO_POOL_THREADS")? {
        config.pools.io_threads = v;
    }
    if let Some(v) = parse_var(lookup, "FLOWDRILL_IO_QUEUE_CAPACITY")? {
        config.pools.io_queue_capacity = v;
    }
    if let Some(v) = parse_var(lookup, "FLOWDRILL_CPU_POOL_THREADS")? {
        config.pools.cpu_threads = v;
    }
    if let Some(v) = lookup("FLOWDRILL_BACKPRESSURE_POLICY") {
        config.pools.backpressure_policy = v;
    }
    if let Some(v) = parse_var(lookup, "FLOWDRILL_BLOCK_TIMEOUT_MS")? {
        config.pools.block_timeout_ms = v;
    }

    // Pipeline
    if let Some(v) = parse_var(lookup, "FLOWDRILL_EVENT_COUNT")? {
        config.pipeline.event_count = v;
    }
    if let Some(v) = parse_var(lookup, "FLOWDRILL_TIMEOUT_MS")? {
        config.pipeline.timeout_ms = v;
    }
    if let Some(v) = parse_var(lookup, "FLOWDRILL_ROUTE_FAILURE_RATE")? {
        config.pipeline.route_failure_rate = v;
    }
    if let Some(v) = parse_var(lookup, "FLOWDRILL_SEED")? {
        config.pipeline.seed = v;
    }

    // Retry
    if let Some(v) = parse_var(lookup, "FLOWDRILL_RETRY_MAX_ATTEMPTS")? {
        config.retry.max_attempts = v;
    }
    if let Some(v) = parse_var(lookup, "FLOWDRILL_RETRY_BACKOFF_MS")? {
        config.retry.backoff_ms = v;
    }

    // Lag scenario
    if let Some(v) = parse_var(lookup, "FLOWDRILL_PRODUCER_INTERVAL_MS")? {
        config.lag.producer_interval_ms = v;
    }
    if let Some(v) = parse_var(lookup, "FLOWDRILL_CONSUMER_PROCESSING_MS")? {
        config.lag.consumer_processing_ms = v;
    }
    if let Some(v) = parse_var(lookup, "FLOWDRILL_LAG_SAMPLE_INTERVAL_MS")? {
        config.lag.sample_interval_ms = v;
    }
    if let Some(v) = parse_var(lookup, "FLOWDRILL_LAG_QUEUE_CAPACITY")? {
        config.lag.queue_capacity = v;
    }
    if let Some(v) = parse_var(lookup, "FLOWDRILL_LAG_RUN_DURATION_MS")? {
        config.lag.run_duration_ms = v;
    }

    Ok(())
}
