//! Structured logging for the gateway using the tracing crate
//!
//! Every component logs through `tracing`; this module only decides where
//! and how the events are rendered, plus a few span macros shared by the
//! connection lifecycle, broker link I/O and Cloudlet request dispatch.
//!
//! ## Environment Variables
//!
//! - `LOG_LEVEL`: Log level (ERROR, WARN, INFO, DEBUG, TRACE) - defaults to INFO
//! - `LOG_FORMAT`: Output format (json, pretty, compact) - defaults to json
//! - `LOG_SPANS`: Include span open/close events (true/false) - defaults to false
//! - `RUST_LOG`: Override log filtering entirely
//!
//! ```bash
//! LOG_FORMAT=pretty LOG_LEVEL=DEBUG gateway-cloud -c gateway.toml run
//! ```

use std::env;
use tracing::Level;
use tracing_subscriber::{filter::Directive, fmt, prelude::*, EnvFilter};

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON lines for log shippers
    Json,
    /// Multi-line, colored output for development
    Pretty,
    /// Single-line colored output
    Compact,
}

impl LogFormat {
    /// Parse log format from string; anything unknown is JSON
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Parse a `LOG_LEVEL` value, falling back to INFO
pub fn parse_level(s: &str) -> Level {
    match s.to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

// Dependencies that are chatty at INFO.
const QUIET_TARGETS: &[&str] = &["rumqttc=warn", "sled=warn", "tokio=warn"];

fn build_filter(level: Level) -> EnvFilter {
    if let Ok(rust_log) = env::var("RUST_LOG") {
        return EnvFilter::new(rust_log);
    }

    QUIET_TARGETS
        .iter()
        .filter_map(|d| d.parse::<Directive>().ok())
        .fold(EnvFilter::new(level.to_string()), EnvFilter::add_directive)
}

fn span_events(include_spans: bool) -> fmt::format::FmtSpan {
    if include_spans {
        fmt::format::FmtSpan::NEW | fmt::format::FmtSpan::CLOSE
    } else {
        fmt::format::FmtSpan::NONE
    }
}

/// Initialize logging with manual configuration
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_logging(level: Level, format: LogFormat, include_spans: bool) {
    let subscriber = tracing_subscriber::registry().with(build_filter(level));

    let result = match format {
        LogFormat::Json => subscriber
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
        LogFormat::Pretty => subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_ansi(true)
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
        LogFormat::Compact => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
    };

    if result.is_err() {
        tracing::debug!("Global tracing subscriber already installed");
    }
}

/// Initialize logging from environment variables
pub fn init_default_logging() {
    let level = parse_level(&env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()));
    let format = LogFormat::parse(&env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string()));
    let include_spans = env::var("LOG_SPANS")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    init_logging(level, format, include_spans);
}

/// Span around one Cloudlet request
#[macro_export]
macro_rules! request_span {
    ($($field:tt)*) => {
        tracing::info_span!("cloudlet_request", $($field)*)
    };
}

/// Span around broker link I/O
#[macro_export]
macro_rules! mqtt_span {
    ($($field:tt)*) => {
        tracing::info_span!("mqtt_operation", $($field)*)
    };
}

/// Span around connect, disconnect and reconfiguration
#[macro_export]
macro_rules! lifecycle_span {
    ($($field:tt)*) => {
        tracing::info_span!("lifecycle_event", $($field)*)
    };
}

pub use {lifecycle_span, mqtt_span, request_span};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("PRETTY"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("CoMpAcT"), LogFormat::Compact);
    }

    #[test]
    fn test_log_format_parse_invalid_defaults_to_json() {
        assert_eq!(LogFormat::parse(""), LogFormat::Json);
        assert_eq!(LogFormat::parse("xml"), LogFormat::Json);
    }

    #[test]
    fn test_parse_level() {
        let test_cases = vec![
            ("ERROR", Level::ERROR),
            ("warn", Level::WARN),
            ("Info", Level::INFO),
            ("DEBUG", Level::DEBUG),
            ("trace", Level::TRACE),
            ("invalid", Level::INFO),
        ];

        for (input, expected) in test_cases {
            assert_eq!(parse_level(input), expected, "Failed for input: {input}");
        }
    }

    #[test]
    fn test_quiet_targets_are_valid_directives() {
        for directive in QUIET_TARGETS {
            assert!(directive.parse::<Directive>().is_ok(), "{directive}");
        }
    }

    #[test]
    fn test_init_logging_twice_does_not_panic() {
        init_logging(Level::INFO, LogFormat::Compact, false);
        init_logging(Level::DEBUG, LogFormat::Json, true);
    }

    #[test]
    fn test_span_macros_build_spans() {
        let _request = request_span!(request_id = "r1", method = "GET");
        let _lifecycle = lifecycle_span!(operation = "connect");
        let _mqtt = mqtt_span!(topic = "a/b");
    }
}
