//! FlowDrill command line
//!
//! Two drills over the same engine:
//!
//! - `batch`: submits a fixed number of events through ingest -> transform ->
//!   route with retry, a per-event deadline and idempotency, then prints the
//!   terminal summary.
//! - `lag`: runs a producer faster than its consumer against a bounded queue
//!   and samples lag and occupancy until the run duration ends.
//!
//! Configuration comes from `flowdrill.toml` (or `--config`), then
//! `FLOWDRILL_*` environment variables, then command line flags.
//! Ctrl+C cancels the run; pending backoffs and deadlines end immediately.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fd_config::{AppConfig, ConfigLoader};
use fd_pipeline::{
    batch_events, run_lag_drill, FailureInjector, LagDrillConfig, LagMonitorConfig, Pipeline,
    PipelineSettings, RetryPolicy, SimulatedSink, StageTimings,
};

/// FlowDrill - concurrent event pipeline drills
#[derive(Parser, Debug)]
#[command(name = "fd-drill")]
#[command(about = "Concurrent event pipeline under backpressure, retry, timeout and lag")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, env = "FLOWDRILL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the batch pipeline drill
    Batch(BatchArgs),
    /// Run the continuous lag/backpressure drill
    Lag(LagArgs),
    /// Print an example configuration file
    Config,
}

#[derive(Args, Debug)]
struct BatchArgs {
    /// Events to submit
    #[arg(long)]
    events: Option<usize>,

    /// BLOCK_CALLER, BLOCK_PRODUCER or REJECT_AND_COUNT
    #[arg(long)]
    policy: Option<String>,

    /// I/O pool workers
    #[arg(long)]
    io_threads: Option<usize>,

    /// I/O pool queue capacity
    #[arg(long)]
    io_queue_capacity: Option<usize>,

    /// Fraction of route calls that fail transiently
    #[arg(long)]
    failure_rate: Option<f64>,

    /// Failure injection seed
    #[arg(long)]
    seed: Option<u64>,

    /// Re-submit every Nth event id as a duplicate
    #[arg(long)]
    duplicate_every: Option<usize>,

    /// Print one line per event result
    #[arg(long, default_value = "false")]
    print_results: bool,

    /// Print the summary as JSON
    #[arg(long, default_value = "false")]
    json: bool,
}

#[derive(Args, Debug)]
struct LagArgs {
    /// Run duration in milliseconds
    #[arg(long)]
    duration_ms: Option<u64>,

    /// Delay between produced items
    #[arg(long)]
    producer_interval_ms: Option<u64>,

    /// Time the consumer spends per item
    #[arg(long)]
    consumer_processing_ms: Option<u64>,

    /// Interval between lag samples
    #[arg(long)]
    sample_interval_ms: Option<u64>,

    /// Consumer queue capacity
    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Print samples and final statistics as JSON
    #[arg(long, default_value = "false")]
    json: bool,
}

impl BatchArgs {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(v) = self.events {
            config.pipeline.event_count = v;
        }
        if let Some(v) = &self.policy {
            config.pools.backpressure_policy = v.clone();
        }
        if let Some(v) = self.io_threads {
            config.pools.io_threads = v;
        }
        if let Some(v) = self.io_queue_capacity {
            config.pools.io_queue_capacity = v;
        }
        if let Some(v) = self.failure_rate {
            config.pipeline.route_failure_rate = v;
        }
        if let Some(v) = self.seed {
            config.pipeline.seed = v;
        }
        if let Some(v) = self.duplicate_every {
            config.pipeline.duplicate_every = v;
        }
    }
}

impl LagArgs {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(v) = self.duration_ms {
            config.lag.run_duration_ms = v;
        }
        if let Some(v) = self.producer_interval_ms {
            config.lag.producer_interval_ms = v;
        }
        if let Some(v) = self.consumer_processing_ms {
            config.lag.consumer_processing_ms = v;
        }
        if let Some(v) = self.sample_interval_ms {
            config.lag.sample_interval_ms = v;
        }
        if let Some(v) = self.queue_capacity {
            config.lag.queue_capacity = v;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for local development)
    let _ = dotenvy::dotenv();

    // Initialize logging (JSON if LOG_FORMAT=json, text otherwise)
    fd_common::logging::init_logging("fd-drill");

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ConfigLoader::with_path(path).load()?,
        None => ConfigLoader::new().load()?,
    };

    let shutdown = CancellationToken::new();
    spawn_shutdown_listener(shutdown.clone());

    match cli.command {
        Command::Batch(args) => {
            args.apply(&mut config);
            config.validate()?;
            run_batch(&config, &args, shutdown).await
        }
        Command::Lag(args) => {
            args.apply(&mut config);
            config.validate()?;
            run_lag(&config, &args, shutdown).await
        }
        Command::Config => {
            println!("{}", AppConfig::example_toml());
            Ok(())
        }
    }
}

async fn run_batch(config: &AppConfig, args: &BatchArgs, shutdown: CancellationToken) -> Result<()> {
    let io_pool = config.pools.io_pool()?;
    let cpu_pool = config.pools.cpu_pool()?;

    info!(
        events = config.pipeline.event_count,
        policy = %io_pool.policy,
        io_threads = io_pool.workers,
        cpu_threads = cpu_pool.workers,
        failure_rate = config.pipeline.route_failure_rate,
        seed = config.pipeline.seed,
        "Starting batch drill"
    );

    let sink = Arc::new(SimulatedSink::new(
        Duration::from_millis(config.pipeline.route_delay_ms),
        FailureInjector::new(config.pipeline.seed, config.pipeline.route_failure_rate),
    ));

    let pipeline = Pipeline::builder()
        .io_pool(io_pool)
        .cpu_pool(cpu_pool)
        .sink(sink)
        .settings(pipeline_settings(config))
        .shutdown_token(shutdown)
        .build()?;

    let events = batch_events(config.pipeline.event_count, config.pipeline.duplicate_every);
    let report = pipeline.run_batch(events).await;

    if args.print_results {
        for result in &report.results {
            println!("{}", result);
        }
    }
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report.summary)?);
    } else {
        println!("{}", report.summary);
    }

    pipeline.shutdown().await;
    Ok(())
}

async fn run_lag(config: &AppConfig, args: &LagArgs, shutdown: CancellationToken) -> Result<()> {
    let lag = &config.lag;
    let drill_config = LagDrillConfig {
        queue_capacity: lag.queue_capacity,
        producer_interval: Duration::from_millis(lag.producer_interval_ms),
        consumer_processing: Duration::from_millis(lag.consumer_processing_ms),
        run_duration: Duration::from_millis(lag.run_duration_ms),
        monitor: LagMonitorConfig {
            sample_interval: Duration::from_millis(lag.sample_interval_ms),
            growth_periods_threshold: lag.growth_periods_threshold,
            history_limit: lag.history_limit,
        },
    };

    let report = run_lag_drill(drill_config, shutdown).await?;

    if args.json {
        let output = serde_json::json!({
            "samples": report.samples,
            "final": report.final_sample,
            "pool": report.pool,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        for sample in &report.samples {
            println!("{}", sample);
        }
        println!("final: {}", report.final_sample);
    }
    Ok(())
}

fn pipeline_settings(config: &AppConfig) -> PipelineSettings {
    PipelineSettings {
        retry: RetryPolicy::new(config.retry.max_attempts, config.retry.backoff()),
        timeout: config.pipeline.timeout(),
        timings: StageTimings {
            ingest_delay: Duration::from_millis(config.pipeline.ingest_delay_ms),
            transform_iterations: config.pipeline.transform_iterations,
            route_delay: Duration::from_millis(config.pipeline.route_delay_ms),
        },
    }
}

/// Cancel `shutdown` on Ctrl+C
fn spawn_shutdown_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received, cancelling run");
                shutdown.cancel();
            }
            Err(e) => warn!(error = %e, "Failed to install Ctrl+C handler"),
        }
    });
}
