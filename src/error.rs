//! Error Types
//!
//! One error enum for the whole service, following the taxonomy callers
//! see: submission failures, executor failures, system failures and
//! unknown identifiers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PortabilityError>;

#[derive(Debug, Error)]
pub enum PortabilityError {
    /// The backend rejected the request or could not accept it.
    #[error("submission failed: {0}")]
    Submission(String),

    /// The workflow engine or job graph ran and failed.
    #[error("executor error: {0}")]
    Executor(String),

    /// The service itself failed (storage, serialization, transport).
    #[error("system error: {0}")]
    System(String),

    #[error("{kind} {id} was not found")]
    NotFound { kind: &'static str, id: String },

    /// An adapter call exceeded its time bound.
    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    /// The request or the configuration is malformed.
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl PortabilityError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Error type reported in the envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Submission(_) | Self::Invalid(_) => "SUBMISSION_ERROR",
            Self::Executor(_) | Self::Timeout { .. } => "EXECUTOR_ERROR",
            Self::System(_) => "SYSTEM_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// 404 for unknown identifiers, a generic failure code for the rest.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,
            _ => 500,
        }
    }
}

impl From<std::io::Error> for PortabilityError {
    fn from(e: std::io::Error) -> Self {
        Self::System(format!("io: {}", e))
    }
}

impl From<serde_json::Error> for PortabilityError {
    fn from(e: serde_json::Error) -> Self {
        Self::System(format!("json: {}", e))
    }
}

impl From<serde_yaml::Error> for PortabilityError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Invalid(format!("yaml: {}", e))
    }
}

impl From<zip::result::ZipError> for PortabilityError {
    fn from(e: zip::result::ZipError) -> Self {
        Self::System(format!("zip: {}", e))
    }
}

impl From<reqwest::Error> for PortabilityError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(reqwest::StatusCode::NOT_FOUND) => Self::not_found(
                "resource",
                e.url().map(|u| u.to_string()).unwrap_or_default(),
            ),
            Some(status) if status.is_client_error() => Self::Submission(format!("http: {}", e)),
            _ => Self::System(format!("http: {}", e)),
        }
    }
}

/// Error body returned by every operation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorEnvelope {
    #[serde(rename = "type")]
    pub error_type: String,

    pub message: String,

    #[serde(rename = "request-id")]
    pub request_id: String,
}

impl ErrorEnvelope {
    pub fn new(error: &PortabilityError, request_id: impl Into<String>) -> Self {
        Self {
            error_type: error.kind().to_string(),
            message: error.to_string(),
            request_id: request_id.into(),
        }
    }
}

impl From<&PortabilityError> for ErrorEnvelope {
    fn from(error: &PortabilityError) -> Self {
        Self::new(error, uuid::Uuid::new_v4().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PortabilityError::not_found("test", "abc");
        assert_eq!(err.to_string(), "test abc was not found");

        let err = PortabilityError::Timeout {
            operation: "submit to envA".to_string(),
            seconds: 30,
        };
        assert_eq!(err.to_string(), "submit to envA timed out after 30s");
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(PortabilityError::not_found("run", "x").kind(), "NOT_FOUND");
        assert_eq!(
            PortabilityError::Submission("nope".into()).kind(),
            "SUBMISSION_ERROR"
        );
        assert_eq!(
            PortabilityError::Timeout {
                operation: "op".into(),
                seconds: 1
            }
            .kind(),
            "EXECUTOR_ERROR"
        );
        assert_eq!(PortabilityError::System("disk".into()).kind(), "SYSTEM_ERROR");
    }

    #[test]
    fn test_http_status() {
        assert_eq!(PortabilityError::not_found("test", "t").http_status(), 404);
        assert_eq!(PortabilityError::System("x".into()).http_status(), 500);
    }

    #[test]
    fn test_envelope_field_names() {
        let err = PortabilityError::not_found("test", "t1");
        let envelope = ErrorEnvelope::new(&err, "req-1");
        let value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(value["type"], "NOT_FOUND");
        assert_eq!(value["request-id"], "req-1");
        assert_eq!(value["message"], "test t1 was not found");
    }

    #[test]
    fn test_envelope_generates_request_id() {
        let err = PortabilityError::System("boom".into());
        let a = ErrorEnvelope::from(&err);
        let b = ErrorEnvelope::from(&err);
        assert_ne!(a.request_id, b.request_id);
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err: PortabilityError = io.into();
        assert_eq!(err.kind(), "SYSTEM_ERROR");
    }
}
