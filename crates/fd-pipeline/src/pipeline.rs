//! Pipeline runner
//!
//! A [`Pipeline`] owns the I/O and CPU pools, the shared timer, the
//! idempotency guard and the route sink for one run. Clones share all of them.
//! Each event goes guard -> deadline(retry(ingest -> transform -> route)) and
//! always ends in exactly one [`EventResult`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use fd_common::{BackpressurePolicy, BatchSummary, Event, EventResult, PoolConfig};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::{Outcome, PipelineError};
use crate::idempotency::{Admission, IdempotencyGuard, RecordStatus};
use crate::pool::WorkPool;
use crate::retry::{Retrier, RetryPolicy};
use crate::stages::{self, FailureInjector, RouteSink, SimulatedSink, StageTimings};
use crate::timeout::with_timeout;
use crate::timer::Timer;
use crate::Result;

/// Per-event processing settings
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub retry: RetryPolicy,
    /// Deadline covering every attempt of one event
    pub timeout: Duration,
    pub timings: StageTimings,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            timeout: Duration::from_millis(2000),
            timings: StageTimings::default(),
        }
    }
}

/// Results of one batch, in submission order, plus their tally
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub results: Vec<EventResult>,
    pub summary: BatchSummary,
}

pub struct PipelineBuilder {
    io_pool: PoolConfig,
    cpu_pool: PoolConfig,
    sink: Option<Arc<dyn RouteSink>>,
    guard: Option<Arc<IdempotencyGuard>>,
    settings: PipelineSettings,
    shutdown: CancellationToken,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            io_pool: PoolConfig::new("io", 8, 500, BackpressurePolicy::BlockCaller),
            cpu_pool: PoolConfig::new("cpu", cpus, 1024, BackpressurePolicy::BlockCaller),
            sink: None,
            guard: None,
            settings: PipelineSettings::default(),
            shutdown: CancellationToken::new(),
        }
    }
}

impl PipelineBuilder {
    pub fn io_pool(mut self, config: PoolConfig) -> Self {
        self.io_pool = config;
        self
    }

    pub fn cpu_pool(mut self, config: PoolConfig) -> Self {
        self.cpu_pool = config;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn RouteSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn guard(mut self, guard: Arc<IdempotencyGuard>) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Token that cancels the timer, and with it every pending backoff and deadline
    pub fn shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Start both pools. Must be called from within a Tokio runtime.
    pub fn build(self) -> Result<Pipeline> {
        let io_pool = Arc::new(WorkPool::start(self.io_pool)?);
        let cpu_pool = Arc::new(WorkPool::start(self.cpu_pool)?);

        let sink = self.sink.unwrap_or_else(|| {
            Arc::new(SimulatedSink::new(
                self.settings.timings.route_delay,
                FailureInjector::disabled(),
            ))
        });
        let timer = Timer::new(self.shutdown);
        let retrier = Retrier::new(timer.clone(), self.settings.retry);

        Ok(Pipeline {
            inner: Arc::new(PipelineInner {
                io_pool,
                cpu_pool,
                sink,
                guard: self.guard.unwrap_or_default(),
                timer,
                retrier,
                settings: self.settings,
            }),
        })
    }
}

struct PipelineInner {
    io_pool: Arc<WorkPool>,
    cpu_pool: Arc<WorkPool>,
    sink: Arc<dyn RouteSink>,
    guard: Arc<IdempotencyGuard>,
    timer: Timer,
    retrier: Retrier,
    settings: PipelineSettings,
}

#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Run one event to its terminal result
    pub async fn process(&self, event: Event) -> EventResult {
        let span = info_span!("event", event_id = %event.id);
        self.process_event(event).instrument(span).await
    }

    async fn process_event(&self, event: Event) -> EventResult {
        let id = event.id.clone();

        match self.inner.guard.admit_with_fingerprint(&id, event.payload.as_str()) {
            Admission::Proceed => {}
            Admission::AlreadyProcessed { .. } => return EventResult::Duplicate { id },
            Admission::Conflict => {
                let cause = PipelineError::IdempotencyConflict(id.clone()).to_string();
                return EventResult::DeadLettered { id, cause };
            }
        }

        let deadline = self.inner.settings.timeout;
        let chain = self.clone();
        let outcome = with_timeout(
            &self.inner.timer,
            deadline,
            async move {
                chain
                    .inner
                    .retrier
                    .run(|attempt| chain.attempt(event.clone(), attempt))
                    .await
            }
            .in_current_span(),
        )
        .await;

        let result = match outcome {
            Outcome::Success(event) => EventResult::Routed {
                id,
                payload: event.payload.into_inner(),
            },
            Outcome::Retryable(err) | Outcome::Fatal(err) => EventResult::DeadLettered {
                id,
                cause: err.to_string(),
            },
            Outcome::TimedOut => EventResult::DeadLettered {
                id,
                cause: PipelineError::Timeout(deadline.as_millis() as u64).to_string(),
            },
            Outcome::Duplicate => return EventResult::Duplicate { id },
        };

        match &result {
            EventResult::DeadLettered { cause, .. } => warn!(%cause, "Event dead-lettered"),
            _ => debug!("Event routed"),
        }
        self.inner
            .guard
            .complete(result.id(), RecordStatus::from(result.status()));
        result
    }

    async fn attempt(&self, event: Event, attempt: u32) -> Outcome<Event> {
        Outcome::from_result(self.run_stages(event, attempt).await)
    }

    /// ingest -> transform -> route, each on its own pool, strictly in order
    async fn run_stages(&self, event: Event, attempt: u32) -> Result<Event> {
        let inner = &self.inner;
        let timings = &inner.settings.timings;

        let ingest_delay = timings.ingest_delay;
        let ingested = inner
            .io_pool
            .submit(move || stages::ingest(event, ingest_delay))
            .await?
            .await?;

        let iterations = timings.transform_iterations;
        let transformed = inner
            .cpu_pool
            .submit_blocking(move || stages::transform(ingested, iterations))
            .await?
            .await?;

        let sink = Arc::clone(&inner.sink);
        let routed = inner
            .io_pool
            .submit(move || async move { stages::route(transformed, sink.as_ref(), attempt).await })
            .await?
            .await?;

        Ok(routed)
    }

    /// Process every event concurrently and tally the results
    pub async fn run_batch(&self, events: Vec<Event>) -> BatchReport {
        let started = Instant::now();
        info!(events = events.len(), "Starting batch");

        let handles: Vec<_> = events
            .into_iter()
            .map(|event| {
                let id = event.id.clone();
                let pipeline = self.clone();
                (id, tokio::spawn(async move { pipeline.process(event).await }))
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for (id, handle) in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(join_err) => {
                    error!(event_id = %id, error = %join_err, "Event task ended abnormally");
                    results.push(EventResult::DeadLettered {
                        id,
                        cause: PipelineError::WorkerLost("batch".to_string()).to_string(),
                    });
                }
            }
        }

        let summary = self.summarize(&results, started.elapsed());
        info!(
            processed = summary.processed,
            routed = summary.routed,
            dead_lettered = summary.dead_lettered,
            duplicates = summary.duplicates,
            retries = summary.retries,
            backpressure_hits = summary.backpressure_hits,
            elapsed_ms = summary.elapsed_ms,
            "Batch complete"
        );
        BatchReport { results, summary }
    }

    fn summarize(&self, results: &[EventResult], elapsed: Duration) -> BatchSummary {
        let io = self.inner.io_pool.counters();
        let cpu = self.inner.cpu_pool.counters();
        let rejected = io.rejected() + cpu.rejected();
        let caller_runs = io.caller_runs() + cpu.caller_runs();

        BatchSummary {
            retries: self.retries(),
            final_queue_size: io.queue_size() + cpu.queue_size(),
            active_workers: io.active_workers() + cpu.active_workers(),
            backpressure_hits: rejected + caller_runs,
            rejected,
            caller_runs,
            elapsed_ms: elapsed.as_millis() as u64,
            ..BatchSummary::from_results(results)
        }
    }

    pub fn io_pool(&self) -> &Arc<WorkPool> {
        &self.inner.io_pool
    }

    pub fn cpu_pool(&self) -> &Arc<WorkPool> {
        &self.inner.cpu_pool
    }

    pub fn guard(&self) -> &Arc<IdempotencyGuard> {
        &self.inner.guard
    }

    pub fn timer(&self) -> &Timer {
        &self.inner.timer
    }

    pub fn retries(&self) -> u64 {
        self.inner.retrier.retries()
    }

    /// Close both pools and wait for their workers to drain
    pub async fn shutdown(&self) {
        self.inner.io_pool.shutdown();
        self.inner.cpu_pool.shutdown();
        self.inner.io_pool.join().await;
        self.inner.cpu_pool.join().await;
        info!("Pipeline shut down");
    }
}

/// `count` events with ids `event-0..`. With `duplicate_every = n > 0`, every
/// n-th event is submitted twice in a row.
pub fn batch_events(count: usize, duplicate_every: usize) -> Vec<Event> {
    let mut events = Vec::with_capacity(count + count.checked_div(duplicate_every).unwrap_or(0));
    for i in 0..count {
        let id = format!("event-{}", i);
        let event = Event::new(id.clone(), id);
        if duplicate_every > 0 && (i + 1) % duplicate_every == 0 {
            events.push(event.clone());
        }
        events.push(event);
    }
    events
}
