//! The cross-replica error envelope.
//!
//! Every error that crosses a service boundary is flattened into an
//! [`ErrorInfo`], so clients can decide how to present it without knowing the
//! originating type.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// How a client should present the error.
///
/// - `action` errors are voluntary (e.g. the user cancelled a task).
/// - `normal` errors are expected (e.g. `404 Not Found`).
/// - `retryable` errors are temporary (e.g. `429 Too Many Requests`).
/// - `runtime` errors are unexpected and shown with a guid for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Action,
    Normal,
    Retryable,
    Runtime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    /// Unique id of this error instance, included in logs and user messages.
    pub error_guid: String,
    pub error_kind: ErrorKind,
    /// Extra structured details to assist debugging.
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub stacktrace: String,
}

/// Wire representation of an error, standardized across Confab services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// HTTP-style status code (500 when unknown).
    pub code: u16,
    pub message: String,
    pub data: ErrorData,
}

impl ErrorInfo {
    pub fn new(code: u16, message: impl Into<String>, error_kind: ErrorKind) -> Self {
        Self {
            code,
            message: message.into(),
            data: ErrorData {
                error_guid: Uuid::new_v4().to_string(),
                error_kind,
                extra: serde_json::Map::new(),
                stacktrace: String::new(),
            },
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(500, message, ErrorKind::Runtime)
    }

    pub fn with_extra(mut self, key: &str, value: serde_json::Value) -> Self {
        self.data.extra.insert(key.to_string(), value);
        self
    }

    pub fn with_stacktrace(mut self, stacktrace: impl Into<String>) -> Self {
        self.data.stacktrace = stacktrace.into();
        self
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

/// Errors that can be flattened into the wire envelope.
pub trait AsErrorInfo {
    fn as_info(&self) -> ErrorInfo;
}

impl AsErrorInfo for ErrorInfo {
    fn as_info(&self) -> ErrorInfo {
        self.clone()
    }
}

///
/// Stopped
///

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    Stopped,
    Timeout,
}

impl StopReason {
    pub fn message(&self) -> &'static str {
        match self {
            StopReason::Stopped => "Stopped: the user or runtime cancelled the task",
            StopReason::Timeout => "Timeout: the task did not produce a result",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Stopped => "stopped",
            StopReason::Timeout => "timeout",
        }
    }
}

/// Raised when a task is cancelled by the user (stop command) or by the
/// runtime (shutdown). Never displayed as a system error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{}", .reason.message())]
pub struct StoppedError {
    pub reason: StopReason,
}

impl StoppedError {
    pub fn stopped() -> Self {
        Self {
            reason: StopReason::Stopped,
        }
    }

    pub fn timeout() -> Self {
        Self {
            reason: StopReason::Timeout,
        }
    }
}

impl AsErrorInfo for StoppedError {
    fn as_info(&self) -> ErrorInfo {
        ErrorInfo::new(
            418,
            self.reason.as_str().to_uppercase(),
            ErrorKind::Action,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_info_round_trips_through_json() {
        let info = ErrorInfo::new(404, "Not Found: missing process", ErrorKind::Normal)
            .with_extra("uri", serde_json::json!("ndp://internal/default-test/x"));
        let json = serde_json::to_string(&info).unwrap();
        let parsed: ErrorInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, info);
        assert_eq!(parsed.data.error_kind, ErrorKind::Normal);
    }

    #[test]
    fn stopped_error_maps_to_action_418() {
        let info = StoppedError::timeout().as_info();
        assert_eq!(info.code, 418);
        assert_eq!(info.message, "TIMEOUT");
        assert_eq!(info.data.error_kind, ErrorKind::Action);
    }
}
