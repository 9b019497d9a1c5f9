use std::future::Future;
use std::time::Duration;

use tracing::{debug, error};

use crate::error::{Outcome, PipelineError};
use crate::timer::Timer;

/// Race `operation` against a deadline on the shared timer.
///
/// The operation runs as its own task. If the deadline wins the result is
/// `TimedOut` and the task is detached: it keeps running and whatever it
/// produces later is dropped. Exactly one of the two contributes the result.
pub async fn with_timeout<T, Fut>(timer: &Timer, deadline: Duration, operation: Fut) -> Outcome<T>
where
    Fut: Future<Output = Outcome<T>> + Send + 'static,
    T: Send + 'static,
{
    let mut task = tokio::spawn(operation);

    tokio::select! {
        joined = &mut task => match joined {
            Ok(outcome) => outcome,
            Err(join_err) => {
                error!(error = %join_err, "Timed operation ended abnormally");
                Outcome::Fatal(PipelineError::WorkerLost("timeout".to_string()))
            }
        },
        expired = timer.sleep(deadline) => match expired {
            Ok(()) => {
                debug!(deadline_ms = deadline.as_millis() as u64, "Deadline elapsed, detaching operation");
                Outcome::TimedOut
            }
            Err(shutdown) => Outcome::Fatal(shutdown),
        },
    }
}
