//! Structured logging setup and span helpers

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat};
pub use logging::{lifecycle_span, mqtt_span, request_span};
