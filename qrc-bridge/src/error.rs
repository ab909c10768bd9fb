//! Error types and the frontend error payload shape

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using the bridge error
pub type Result<T> = std::result::Result<T, Error>;

/// Wire-level error taxonomy surfaced to frontend clients.
///
/// Serialized SCREAMING_SNAKE (the shape tool-calling clients match on);
/// `Display` is snake_case for log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Could not establish a connection to the Core
    ConnectionFailed,
    /// The connection dropped while an operation was in flight
    ConnectionClosed,
    /// Logon was rejected by the Core
    AuthenticationFailed,
    /// An operation exceeded its deadline
    Timeout,
    /// The Core returned a JSON-RPC error for a command
    CommandFailed,
    /// Named component does not exist on the Core
    InvalidComponent,
    /// Named control does not exist on its component
    InvalidControl,
    /// A cache write was rejected
    CacheSetFailed,
    /// The repository was used before `initialize`
    NotInitialized,
    /// Snapshot write or restore failed
    PersistenceFailed,
    /// Input failed validation at the adapter boundary
    ValidationFailed,
    /// The circuit breaker is open and rejecting calls
    BreakerOpen,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed => write!(f, "connection_failed"),
            Self::ConnectionClosed => write!(f, "connection_closed"),
            Self::AuthenticationFailed => write!(f, "authentication_failed"),
            Self::Timeout => write!(f, "timeout"),
            Self::CommandFailed => write!(f, "command_failed"),
            Self::InvalidComponent => write!(f, "invalid_component"),
            Self::InvalidControl => write!(f, "invalid_control"),
            Self::CacheSetFailed => write!(f, "cache_set_failed"),
            Self::NotInitialized => write!(f, "not_initialized"),
            Self::PersistenceFailed => write!(f, "persistence_failed"),
            Self::ValidationFailed => write!(f, "validation_failed"),
            Self::BreakerOpen => write!(f, "breaker_open"),
        }
    }
}

/// Main error type for the bridge
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Could not establish a connection to the Core
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The connection dropped, taking pending operations with it
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// The Core rejected our credentials
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// An operation exceeded its deadline
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The Core returned a JSON-RPC error
    #[error("Command {method} failed: {message} (code {code})")]
    CommandFailed {
        /// QRC method that failed
        method: String,
        /// JSON-RPC error code from the Core
        code: i64,
        /// JSON-RPC error message from the Core
        message: String,
    },

    /// Named component does not exist on the Core
    #[error("Unknown component: {0}")]
    InvalidComponent(String),

    /// Named control does not exist
    #[error("Unknown control: {0}")]
    InvalidControl(String),

    /// A cache write was rejected
    #[error("Cache write failed: {0}")]
    CacheSetFailed(String),

    /// The repository was used before `initialize`
    #[error("State repository is not initialized")]
    NotInitialized,

    /// Snapshot write or restore failed
    #[error("Persistence failed: {0}")]
    Persistence(String),

    /// Input failed validation
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Circuit breaker rejected the call without attempting it
    #[error("Circuit breaker is open")]
    BreakerOpen,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Error {
    /// Map this error onto the wire taxonomy
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Config(_) => ErrorCode::ValidationFailed,
            Self::ConnectionFailed(_) => ErrorCode::ConnectionFailed,
            Self::ConnectionClosed(_) => ErrorCode::ConnectionClosed,
            Self::AuthenticationFailed(_) => ErrorCode::AuthenticationFailed,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::CommandFailed { .. } => ErrorCode::CommandFailed,
            Self::InvalidComponent(_) => ErrorCode::InvalidComponent,
            Self::InvalidControl(_) => ErrorCode::InvalidControl,
            Self::CacheSetFailed(_) => ErrorCode::CacheSetFailed,
            Self::NotInitialized => ErrorCode::NotInitialized,
            Self::Persistence(_) | Self::Io(_) => ErrorCode::PersistenceFailed,
            Self::Validation(_) => ErrorCode::ValidationFailed,
            Self::BreakerOpen => ErrorCode::BreakerOpen,
            Self::Serde(_) => ErrorCode::CommandFailed,
        }
    }

    /// Check if this error is retriable (transient errors that may succeed on retry)
    ///
    /// Authentication and validation failures are never retried: reconnecting
    /// with the same bad credentials or arguments cannot succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_) | Self::ConnectionClosed(_) | Self::Timeout(_) | Self::Io(_)
        )
    }
}

/// Structured error payload returned to frontend clients
///
/// Every failed tool invocation surfaces as one of these rather than a bare
/// message, so clients can branch on `code` without string matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Always `true`; lets clients discriminate error payloads structurally
    pub error: bool,

    /// Operation the client invoked
    pub tool_name: String,

    /// Taxonomy code
    pub code: ErrorCode,

    /// Human-readable message
    pub message: String,

    /// Additional context (component name, control name, deadline, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl ErrorPayload {
    /// Build a payload from an error for the named operation
    pub fn new(tool_name: impl Into<String>, err: &Error) -> Self {
        Self {
            error: true,
            tool_name: tool_name.into(),
            code: err.code(),
            message: err.to_string(),
            context: None,
        }
    }

    /// Attach context to the payload
    #[must_use]
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(
            Error::ConnectionFailed("refused".into()).code(),
            ErrorCode::ConnectionFailed
        );
        assert_eq!(
            Error::AuthenticationFailed("bad password".into()).code(),
            ErrorCode::AuthenticationFailed
        );
        assert_eq!(
            Error::Timeout(Duration::from_secs(30)).code(),
            ErrorCode::Timeout
        );
        assert_eq!(Error::NotInitialized.code(), ErrorCode::NotInitialized);
        assert_eq!(Error::BreakerOpen.code(), ErrorCode::BreakerOpen);
        assert_eq!(
            Error::Validation("empty name".into()).code(),
            ErrorCode::ValidationFailed
        );
    }

    #[test]
    fn test_is_retriable_transient_errors() {
        assert!(Error::ConnectionFailed("refused".into()).is_retriable());
        assert!(Error::ConnectionClosed("eof".into()).is_retriable());
        assert!(Error::Timeout(Duration::from_secs(1)).is_retriable());
    }

    #[test]
    fn test_is_retriable_permanent_errors() {
        assert!(!Error::AuthenticationFailed("bad password".into()).is_retriable());
        assert!(!Error::Validation("ramp out of range".into()).is_retriable());
        assert!(!Error::InvalidComponent("Mixer9".into()).is_retriable());
        assert!(!Error::BreakerOpen.is_retriable());
        assert!(!Error::NotInitialized.is_retriable());
    }

    #[test]
    fn test_error_code_display() {
        assert_eq!(format!("{}", ErrorCode::ConnectionFailed), "connection_failed");
        assert_eq!(
            format!("{}", ErrorCode::AuthenticationFailed),
            "authentication_failed"
        );
        assert_eq!(format!("{}", ErrorCode::Timeout), "timeout");
        assert_eq!(format!("{}", ErrorCode::CommandFailed), "command_failed");
        assert_eq!(format!("{}", ErrorCode::BreakerOpen), "breaker_open");
        assert_eq!(format!("{}", ErrorCode::ValidationFailed), "validation_failed");
    }

    #[test]
    fn test_error_code_wire_format() {
        let json = serde_json::to_string(&ErrorCode::AuthenticationFailed).unwrap();
        assert_eq!(json, "\"AUTHENTICATION_FAILED\"");
        let json = serde_json::to_string(&ErrorCode::BreakerOpen).unwrap();
        assert_eq!(json, "\"BREAKER_OPEN\"");
    }

    #[test]
    fn test_error_payload_shape() {
        let err = Error::Validation("ramp must be in (0, 300] seconds".into());
        let payload = ErrorPayload::new("set_control_values", &err)
            .with_context(serde_json::json!({"ramp": 301.0}));

        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["error"], true);
        assert_eq!(value["toolName"].as_str(), None); // field is snake_case
        assert_eq!(value["tool_name"], "set_control_values");
        assert_eq!(value["code"], "VALIDATION_FAILED");
        assert_eq!(value["context"]["ramp"], 301.0);
    }

    #[test]
    fn test_command_failed_display() {
        let err = Error::CommandFailed {
            method: "Component.Get".into(),
            code: 8,
            message: "Unknown component".into(),
        };
        let text = err.to_string();
        assert!(text.contains("Component.Get"));
        assert!(text.contains("Unknown component"));
        assert!(text.contains("8"));
    }
}
