use fd_common::Stage;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("transient sink error: {0}")]
    TransientSink(String),

    #[error("pipeline timeout after {0}ms")]
    Timeout(u64),

    #[error("duplicate event: {0}")]
    DuplicateEvent(String),

    #[error("idempotency key {0} reused with a different payload")]
    IdempotencyConflict(String),

    #[error("backpressure: pool {0} is saturated")]
    Backpressure(String),

    #[error("shutdown in progress")]
    Shutdown,

    #[error("pool {0} is closed")]
    PoolClosed(String),

    #[error("task lost by a worker in pool {0}")]
    WorkerLost(String),

    #[error("invalid pool configuration: {0}")]
    InvalidPool(String),

    #[error("invalid drill configuration: {0}")]
    InvalidDrill(String),

    #[error("{task} task ended abnormally: {message}")]
    TaskAborted { task: String, message: String },

    #[error("{stage} stage failed: {message}")]
    Stage { stage: Stage, message: String },
}

impl PipelineError {
    /// Failures worth another attempt: sink hiccups and pool saturation
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::TransientSink(_) | PipelineError::Backpressure(_))
    }
}

/// Result of an operation as seen at a combinator boundary.
///
/// Retry inspects `Retryable`, the timeout race produces `TimedOut`, the
/// idempotency guard short-circuits with `Duplicate`. Nothing is signalled by
/// unwinding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Success(T),
    Retryable(PipelineError),
    Fatal(PipelineError),
    Duplicate,
    TimedOut,
}

impl<T> Outcome<T> {
    /// Classify a stage result
    pub fn from_result(result: Result<T, PipelineError>) -> Self {
        match result {
            Ok(value) => Outcome::Success(value),
            Err(err) => Self::from_error(err),
        }
    }

    pub fn from_error(err: PipelineError) -> Self {
        match err {
            PipelineError::Timeout(_) => Outcome::TimedOut,
            PipelineError::DuplicateEvent(_) => Outcome::Duplicate,
            err if err.is_retryable() => Outcome::Retryable(err),
            err => Outcome::Fatal(err),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Outcome<U> {
        match self {
            Outcome::Success(v) => Outcome::Success(f(v)),
            Outcome::Retryable(e) => Outcome::Retryable(e),
            Outcome::Fatal(e) => Outcome::Fatal(e),
            Outcome::Duplicate => Outcome::Duplicate,
            Outcome::TimedOut => Outcome::TimedOut,
        }
    }

    /// The failure carried by this outcome, if any
    pub fn error(&self) -> Option<&PipelineError> {
        match self {
            Outcome::Retryable(e) | Outcome::Fatal(e) => Some(e),
            _ => None,
        }
    }
}
