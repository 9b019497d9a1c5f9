//! Stage functions: ingest (I/O), transform (CPU), route (I/O)
//!
//! Each stage consumes an event at one stage and returns it at the next.
//! Latencies and CPU work are simulated; the route stage delivers through a
//! [`RouteSink`], which may fail transiently.

use std::hint::black_box;
use std::time::Duration;

use async_trait::async_trait;
use fd_common::{Event, Payload, Stage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::PipelineError;
use crate::Result;

/// Simulated stage costs
#[derive(Debug, Clone)]
pub struct StageTimings {
    pub ingest_delay: Duration,
    pub transform_iterations: u32,
    pub route_delay: Duration,
}

impl Default for StageTimings {
    fn default() -> Self {
        Self {
            ingest_delay: Duration::from_millis(10),
            transform_iterations: 10_000,
            route_delay: Duration::from_millis(5),
        }
    }
}

fn expect_stage(event: &Event, expected: Stage, running: Stage) -> Result<()> {
    if event.stage() == expected {
        return Ok(());
    }
    Err(PipelineError::Stage {
        stage: running,
        message: format!("event {} is at stage {}, expected {}", event.id, event.stage(), expected),
    })
}

/// Read the raw event from its source
pub async fn ingest(event: Event, delay: Duration) -> Result<Event> {
    expect_stage(&event, Stage::Raw, Stage::Ingested)?;
    tokio::time::sleep(delay).await;

    let ingested = format!("payload-{}", event.payload.as_str());
    Ok(event.advance(Payload::Ingested(ingested)))
}

/// CPU-bound normalisation. Blocking; run it on a blocking thread.
pub fn transform(event: Event, iterations: u32) -> Result<Event> {
    expect_stage(&event, Stage::Ingested, Stage::Transformed)?;

    let mut acc = 0.0f64;
    for i in 0..iterations {
        acc += black_box(f64::from(i)).sqrt();
    }
    black_box(acc);

    let transformed = event.payload.as_str().to_uppercase();
    Ok(event.advance(Payload::Transformed(transformed)))
}

/// Hand the transformed event to `sink`
pub async fn route(event: Event, sink: &dyn RouteSink, attempt: u32) -> Result<Event> {
    expect_stage(&event, Stage::Transformed, Stage::Routed)?;
    let delivered = sink.deliver(&event, attempt).await?;
    Ok(event.advance(Payload::Routed(delivered)))
}

/// Destination of routed events
#[async_trait]
pub trait RouteSink: Send + Sync {
    /// Deliver one transformed event. `attempt` is 1-based.
    /// Returns the payload as accepted by the sink.
    async fn deliver(&self, event: &Event, attempt: u32) -> Result<String>;
}

/// Decides which deliveries fail.
///
/// The decision depends only on the seed, the event id and the attempt
/// number, so a run is reproducible however its tasks are scheduled.
#[derive(Debug, Clone, Copy)]
pub struct FailureInjector {
    seed: u64,
    rate: f64,
}

impl FailureInjector {
    pub fn new(seed: u64, rate: f64) -> Self {
        Self {
            seed,
            rate: if rate.is_nan() { 0.0 } else { rate.clamp(0.0, 1.0) },
        }
    }

    pub fn disabled() -> Self {
        Self::new(0, 0.0)
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn should_fail(&self, event_id: &str, attempt: u32) -> bool {
        if self.rate <= 0.0 {
            return false;
        }
        if self.rate >= 1.0 {
            return true;
        }

        let digest = Sha256::digest(event_id.as_bytes());
        let mut id_bits = [0u8; 8];
        id_bits.copy_from_slice(&digest[..8]);

        let stream = self.seed
            ^ u64::from_le_bytes(id_bits)
            ^ u64::from(attempt).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        StdRng::seed_from_u64(stream).random_bool(self.rate)
    }
}

/// In-process sink with simulated latency and injected transient failures
#[derive(Debug, Clone)]
pub struct SimulatedSink {
    delay: Duration,
    injector: FailureInjector,
}

impl SimulatedSink {
    pub fn new(delay: Duration, injector: FailureInjector) -> Self {
        Self { delay, injector }
    }
}

#[async_trait]
impl RouteSink for SimulatedSink {
    async fn deliver(&self, event: &Event, attempt: u32) -> Result<String> {
        tokio::time::sleep(self.delay).await;

        if self.injector.should_fail(&event.id, attempt) {
            debug!(event_id = %event.id, attempt, "Injected sink failure");
            return Err(PipelineError::TransientSink(format!("route failed for {}", event.id)));
        }
        Ok(event.payload.as_str().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stage_chain_advances_payload() {
        let event = Event::new("evt-1", "evt-1");
        let ingested = ingest(event, Duration::ZERO).await.unwrap();
        assert_eq!(ingested.payload, Payload::Ingested("payload-evt-1".into()));

        let transformed = tokio_test::assert_ok!(transform(ingested, 100));
        assert_eq!(transformed.payload, Payload::Transformed("PAYLOAD-EVT-1".into()));

        let sink = SimulatedSink::new(Duration::ZERO, FailureInjector::disabled());
        let routed = route(transformed, &sink, 1).await.unwrap();
        assert_eq!(routed.payload, Payload::Routed("PAYLOAD-EVT-1".into()));
        assert_eq!(routed.id, "evt-1");
    }

    #[test]
    fn test_transform_rejects_wrong_stage() {
        let raw = Event::new("evt-2", "x");
        let err = tokio_test::assert_err!(transform(raw, 10));
        assert!(matches!(err, PipelineError::Stage { stage: Stage::Transformed, .. }));
    }

    #[test]
    fn test_injector_is_deterministic_per_seed() {
        let decisions = |seed: u64| -> Vec<bool> {
            let injector = FailureInjector::new(seed, 0.5);
            (0..200)
                .flat_map(|i| {
                    let id = format!("event-{}", i);
                    [injector.should_fail(&id, 1), injector.should_fail(&id, 2)]
                })
                .collect()
        };

        assert_eq!(decisions(42), decisions(42));
        assert_ne!(decisions(42), decisions(43));
    }

    #[test]
    fn test_injector_rate_roughly_holds() {
        let injector = FailureInjector::new(7, 0.25);
        let failures = (0..2000)
            .filter(|i| injector.should_fail(&format!("event-{}", i), 1))
            .count();
        assert!((300..700).contains(&failures), "failures = {}", failures);
    }

    #[test]
    fn test_injector_extremes() {
        assert!(!FailureInjector::disabled().should_fail("a", 1));
        assert!(FailureInjector::new(1, 1.0).should_fail("a", 3));
        assert!(!FailureInjector::new(1, f64::NAN).should_fail("a", 1));
    }
}
