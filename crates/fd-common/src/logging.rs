//! Structured logging for the drill binaries
//!
//! - Human-readable output by default
//! - JSON output with `LOG_FORMAT=json`
//! - `RUST_LOG` filtering (default: info)
//!
//! ```rust,ignore
//! fd_common::logging::init_logging("fd-drill");
//! tracing::info!(event_id = %id, "Event routed");
//! ```
//!
//! Per-event context is carried by spans; the stage chain wraps each event in an
//! `event` span so every nested log line carries its `event_id`.

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Output format selected by `LOG_FORMAT`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    pub fn from_env() -> Self {
        Self::parse(&std::env::var("LOG_FORMAT").unwrap_or_default())
    }

    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    }
}

/// Initialize logging for the given service.
///
/// Safe to call more than once; later calls are ignored (tests share one subscriber).
pub fn init_logging(service_name: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let initialized = match LogFormat::from_env() {
        LogFormat::Json => init_json_logging(env_filter),
        LogFormat::Text => init_text_logging(env_filter),
    };

    if initialized {
        tracing::debug!(service = %service_name, "Logging initialized");
    }
}

fn init_json_logging(env_filter: EnvFilter) -> bool {
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(false)
                .with_thread_names(true)
                .with_target(true)
                .flatten_event(true)
                .with_span_events(FmtSpan::NONE)
        )
        .try_init()
        .is_ok()
}

fn init_text_logging(env_filter: EnvFilter) -> bool {
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_thread_names(true)
                .with_ansi(true)
        )
        .try_init()
        .is_ok()
}

/// Logging for tests: honours `RUST_LOG`, defaults to warnings only.
pub fn init_test_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_test_writer())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::parse("text"), LogFormat::Text);
        assert_eq!(LogFormat::parse(""), LogFormat::Text);
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_test_logging();
        init_logging("fd-common-test");
    }
}
