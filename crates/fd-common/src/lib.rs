use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub mod logging;

// ============================================================================
// Event Types
// ============================================================================

/// Stage an event payload has reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Raw,
    Ingested,
    Transformed,
    Routed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Raw => "raw",
            Stage::Ingested => "ingested",
            Stage::Transformed => "transformed",
            Stage::Routed => "routed",
        };
        f.write_str(s)
    }
}

/// Event payload tagged with the stage that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "value", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Payload {
    Raw(String),
    Ingested(String),
    Transformed(String),
    Routed(String),
}

impl Payload {
    pub fn stage(&self) -> Stage {
        match self {
            Payload::Raw(_) => Stage::Raw,
            Payload::Ingested(_) => Stage::Ingested,
            Payload::Transformed(_) => Stage::Transformed,
            Payload::Routed(_) => Stage::Routed,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Payload::Raw(s) | Payload::Ingested(s) | Payload::Transformed(s) | Payload::Routed(s) => s,
        }
    }

    pub fn into_inner(self) -> String {
        match self {
            Payload::Raw(s) | Payload::Ingested(s) | Payload::Transformed(s) | Payload::Routed(s) => s,
        }
    }
}

/// The unit of work that flows through the stage chain.
///
/// An event is owned by exactly one stage at a time; each stage consumes it and
/// hands back a new value carrying the next payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub payload: Payload,
}

impl Event {
    pub fn new(id: impl Into<String>, raw: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload: Payload::Raw(raw.into()),
        }
    }

    /// Replace the payload, keeping the identifier
    pub fn advance(self, payload: Payload) -> Self {
        Self { id: self.id, payload }
    }

    pub fn stage(&self) -> Stage {
        self.payload.stage()
    }
}

/// Terminal status of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Routed,
    DeadLettered,
    Duplicate,
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventStatus::Routed => "ROUTED",
            EventStatus::DeadLettered => "DEAD_LETTERED",
            EventStatus::Duplicate => "DUPLICATE",
        };
        f.write_str(s)
    }
}

/// Terminal result of one event. Every submitted event resolves to exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventResult {
    Routed { id: String, payload: String },
    DeadLettered { id: String, cause: String },
    Duplicate { id: String },
}

impl EventResult {
    pub fn status(&self) -> EventStatus {
        match self {
            EventResult::Routed { .. } => EventStatus::Routed,
            EventResult::DeadLettered { .. } => EventStatus::DeadLettered,
            EventResult::Duplicate { .. } => EventStatus::Duplicate,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            EventResult::Routed { id, .. }
            | EventResult::DeadLettered { id, .. }
            | EventResult::Duplicate { id } => id,
        }
    }
}

impl fmt::Display for EventResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventResult::Routed { payload, .. } => write!(f, "ROUTED:{}", payload),
            EventResult::DeadLettered { id, cause } => write!(f, "DLQ:{}:{}", id, cause),
            EventResult::Duplicate { id } => write!(f, "SKIP_DUPLICATE:{}", id),
        }
    }
}

// ============================================================================
// Pool Configuration Types
// ============================================================================

/// What a pool does when its queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Run the task in the submitting context instead of enqueuing it
    BlockCaller,
    /// Wait up to `timeout` for a free slot, then reject and count
    BlockProducer { timeout: Duration },
    /// Reject and count immediately
    RejectAndCount,
}

impl BackpressurePolicy {
    pub fn name(&self) -> &'static str {
        match self {
            BackpressurePolicy::BlockCaller => "BLOCK_CALLER",
            BackpressurePolicy::BlockProducer { .. } => "BLOCK_PRODUCER",
            BackpressurePolicy::RejectAndCount => "REJECT_AND_COUNT",
        }
    }

    /// Build a policy from its configuration name.
    /// `block_timeout` is only used by BLOCK_PRODUCER.
    pub fn from_name(name: &str, block_timeout: Duration) -> Result<Self, String> {
        match name.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "BLOCK_CALLER" | "CALLER_RUNS" => Ok(BackpressurePolicy::BlockCaller),
            "BLOCK_PRODUCER" => Ok(BackpressurePolicy::BlockProducer { timeout: block_timeout }),
            "REJECT_AND_COUNT" | "REJECT" => Ok(BackpressurePolicy::RejectAndCount),
            other => Err(format!("unknown backpressure policy: {}", other)),
        }
    }
}

impl fmt::Display for BackpressurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackpressurePolicy::BlockProducer { timeout } => {
                write!(f, "BLOCK_PRODUCER({}ms)", timeout.as_millis())
            }
            other => f.write_str(other.name()),
        }
    }
}

impl FromStr for BackpressurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s, Duration::from_millis(100))
    }
}

/// Sizing and backpressure settings for one work pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub name: String,
    pub workers: usize,
    pub queue_capacity: usize,
    pub policy: BackpressurePolicy,
}

impl PoolConfig {
    pub fn new(name: impl Into<String>, workers: usize, queue_capacity: usize, policy: BackpressurePolicy) -> Self {
        Self {
            name: name.into(),
            workers,
            queue_capacity,
            policy,
        }
    }
}

/// Point-in-time statistics for a work pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub name: String,
    pub policy: String,
    pub workers: u32,
    pub queue_capacity: u32,
    pub queue_size: u32,
    pub active_workers: u32,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub rejected: u64,
    pub caller_runs: u64,
}

// ============================================================================
// Observation Types
// ============================================================================

/// Immutable snapshot taken by the lag monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LagSample {
    pub produced: u64,
    pub consumed: u64,
    pub queue_size: u32,
    pub queue_capacity: u32,
    pub rejected: u64,
    pub timestamp: DateTime<Utc>,
}

impl LagSample {
    /// Items produced but not yet consumed
    pub fn lag(&self) -> u64 {
        self.produced.saturating_sub(self.consumed)
    }

    /// Queue fill level in percent, clamped to [0, 100]
    pub fn occupancy_pct(&self) -> f64 {
        if self.queue_capacity == 0 {
            return 0.0;
        }
        let pct = f64::from(self.queue_size) * 100.0 / f64::from(self.queue_capacity);
        pct.clamp(0.0, 100.0)
    }
}

impl fmt::Display for LagSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "produced={} consumed={} lag={} queue={}({:.1}%) rejected={}",
            self.produced,
            self.consumed,
            self.lag(),
            self.queue_size,
            self.occupancy_pct(),
            self.rejected
        )
    }
}

/// Summary of one batch run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub processed: u64,
    pub routed: u64,
    pub dead_lettered: u64,
    pub duplicates: u64,
    pub retries: u64,
    pub final_queue_size: u32,
    pub active_workers: u32,
    /// Submissions that hit a full queue (ran inline or were rejected)
    pub backpressure_hits: u64,
    pub rejected: u64,
    pub caller_runs: u64,
    pub elapsed_ms: u64,
}

impl BatchSummary {
    /// Tally terminal results into a summary; pool figures are filled in by the caller
    pub fn from_results(results: &[EventResult]) -> Self {
        let mut summary = Self {
            processed: results.len() as u64,
            ..Self::default()
        };
        for result in results {
            match result.status() {
                EventStatus::Routed => summary.routed += 1,
                EventStatus::DeadLettered => summary.dead_lettered += 1,
                EventStatus::Duplicate => summary.duplicates += 1,
            }
        }
        summary
    }
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Processed={} ok={} dlq={} duplicates={} retries={}",
            self.processed, self.routed, self.dead_lettered, self.duplicates, self.retries
        )?;
        writeln!(f, "QueueSize={} Active={}", self.final_queue_size, self.active_workers)?;
        write!(
            f,
            "BackpressureHits={} (callerRuns={} rejected={}) elapsedMs={}",
            self.backpressure_hits, self.caller_runs, self.rejected, self.elapsed_ms
        )
    }
}
