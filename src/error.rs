//! Error taxonomy for the cloud connectivity core
//!
//! Connection-level failures are returned to the caller of the failing
//! operation. Listener and handler failures never surface here; they are
//! caught and logged at the fan-out boundary.

use crate::cloudlet::ResponseCode;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for gateway cloud operations
#[derive(Debug, Error)]
pub enum CloudError {
    #[error("Not connected")]
    NotConnected,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    #[error("Timed out waiting for {operation}")]
    Timeout { operation: String },

    #[error("Outbound queue full: {capacity} messages with priority >= 2 already held")]
    CapacityExceeded { capacity: usize },

    #[error("Bad request: {message}")]
    BadRequest { message: String },

    #[error("Internal error: {message}")]
    InternalError { message: String },

    #[error("Stale confirmation for message {message_id} from session {session_id}")]
    StaleConfirmation { message_id: u16, session_id: String },

    #[error("Broker link error: {0}")]
    Link(#[from] crate::transport::LinkError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] crate::transport::persistence::PersistenceError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl CloudError {
    /// Map an error raised while serving a request to the reply code
    pub fn response_code(&self) -> ResponseCode {
        match self {
            CloudError::BadRequest { .. } => ResponseCode::BadRequest,
            _ => ResponseCode::Error,
        }
    }

    /// Error detail safe to publish back to a remote requester
    pub fn exception_message(&self) -> String {
        sanitize_error_message(&self.to_string())
    }

    /// Create invalid configuration error
    pub fn invalid_configuration<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfiguration {
            message: message.into(),
        }
    }

    /// Create timeout error
    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Create bad request error
    pub fn bad_request<S: Into<String>>(message: S) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    /// Create internal error
    pub fn internal_error<S: Into<String>>(message: S) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").expect("valid secret pattern")
});

static SECRET_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
        .expect("valid secret path pattern")
});

const MAX_EXCEPTION_LEN: usize = 500;

/// Redact credentials and cap length of error text leaving the gateway
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN.replace_all(message, "${1}=***").to_string();
    sanitized = SECRET_PATH_PATTERN
        .replace_all(&sanitized, "/***REDACTED***/")
        .to_string();

    if sanitized.len() > MAX_EXCEPTION_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_EXCEPTION_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for gateway cloud operations
pub type CloudResult<T> = Result<T, CloudError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_request_maps_to_bad_request_code() {
        let error = CloudError::bad_request("unknown method FOO");
        assert_eq!(error.response_code(), ResponseCode::BadRequest);
    }

    #[test]
    fn test_other_errors_map_to_error_code() {
        let errors = vec![
            CloudError::internal_error("handler failed"),
            CloudError::NotConnected,
            CloudError::timeout("subscribe"),
            CloudError::CapacityExceeded { capacity: 10 },
        ];

        for error in errors {
            assert_eq!(error.response_code(), ResponseCode::Error, "{error}");
        }
    }

    #[test]
    fn test_exception_message_is_sanitized() {
        let error =
            CloudError::internal_error("Failed to authenticate: password=secret123 token=abc456");

        let detail = error.exception_message();

        assert!(!detail.contains("secret123"));
        assert!(!detail.contains("abc456"));
        assert!(detail.contains("password=***"));
        assert!(detail.contains("token=***"));
    }

    #[test]
    fn test_long_message_truncation() {
        let long_message = "x".repeat(600);
        let sanitized = sanitize_error_message(&long_message);

        assert!(sanitized.len() <= 500);
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let long_message = "é".repeat(400);
        let sanitized = sanitize_error_message(&long_message);

        assert!(sanitized.len() <= 500);
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_file_path_redaction() {
        let message = "Failed to read /home/user/.ssh/id_rsa and /etc/secrets/api.key";
        let sanitized = sanitize_error_message(message);

        assert!(sanitized.contains("/***REDACTED***/"));
        assert!(!sanitized.contains("/home/user/.ssh/id_rsa"));
    }

    #[test]
    fn test_sanitize_exactly_500_chars() {
        let message = "x".repeat(500);
        let sanitized = sanitize_error_message(&message);
        assert_eq!(sanitized.len(), 500);
        assert!(!sanitized.contains("truncated"));
    }

    // ========== Tests for Error Constructor Functions ==========

    #[test]
    fn test_invalid_configuration_constructor() {
        let error = CloudError::invalid_configuration("broker URL missing");
        assert!(matches!(error, CloudError::InvalidConfiguration { .. }));
        assert_eq!(
            error.to_string(),
            "Invalid configuration: broker URL missing"
        );
    }

    #[test]
    fn test_timeout_constructor() {
        let error = CloudError::timeout("subscribe to a/b");
        assert!(matches!(error, CloudError::Timeout { .. }));
        assert_eq!(error.to_string(), "Timed out waiting for subscribe to a/b");
    }

    #[test]
    fn test_internal_error_constructor() {
        let error = CloudError::internal_error("unexpected state");
        assert!(matches!(error, CloudError::InternalError { .. }));
        assert_eq!(error.to_string(), "Internal error: unexpected state");
    }

    #[test]
    fn test_stale_confirmation_display() {
        let error = CloudError::StaleConfirmation {
            message_id: 7,
            session_id: "dev1-mqtt://old:1883".to_string(),
        };
        assert!(error.to_string().contains('7'));
        assert!(error.to_string().contains("mqtt://old:1883"));
    }
}
