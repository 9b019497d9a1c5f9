//! FlowDrill Event Pipeline
//!
//! This crate provides the concurrent processing engine with:
//! - WorkPool: Bounded worker pools with BLOCK_CALLER / BLOCK_PRODUCER / REJECT_AND_COUNT backpressure
//! - Timer: Shared cancellable timer for backoffs and deadlines
//! - Retry: Fixed-delay retry over tagged outcomes
//! - Timeout: Deadline race that detaches the losing operation
//! - IdempotencyGuard: Atomic per-event-id admission with status and payload fingerprint
//! - Pipeline: ingest -> transform -> route stage chain with dead-lettering
//! - LagMonitor: Periodic produced/consumed/queue sampling with growth warnings
//! - Drill: Continuous producer/consumer lag scenario

pub mod error;
pub mod pool;
pub mod timer;
pub mod retry;
pub mod timeout;
pub mod idempotency;
pub mod stages;
pub mod pipeline;
pub mod lag;
pub mod drill;

pub use error::{Outcome, PipelineError};
pub use pool::{PoolCounters, TaskHandle, WorkPool};
pub use timer::Timer;
pub use retry::{retry, Retrier, RetryPolicy};
pub use timeout::with_timeout;
pub use idempotency::{Admission, IdempotencyGuard, IdempotencyRecord, RecordStatus};
pub use stages::{FailureInjector, RouteSink, SimulatedSink, StageTimings};
pub use pipeline::{batch_events, BatchReport, Pipeline, PipelineBuilder, PipelineSettings};
pub use lag::{spawn_lag_monitor, LagMonitor, LagMonitorConfig, LagSource};
pub use drill::{run_lag_drill, LagDrillConfig, LagDrillReport};

pub type Result<T> = std::result::Result<T, PipelineError>;
