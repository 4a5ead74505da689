//! # Crate Error Types
//!
//! `DeadLetterError` is what every public operation returns. Broker and
//! configuration failures keep their own types and convert in via `#[from]`.

use thiserror::Error;

use crate::config::error::ConfigurationError;
use crate::messaging::MessagingError;

#[derive(Error, Debug)]
pub enum DeadLetterError {
    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("Envelope serialization error: {message}")]
    Serialization { message: String },

    #[error("Invalid dead-letter request: {field}: {reason}")]
    InvalidRequest { field: String, reason: String },

    #[error("Dead-letter operation '{operation}' did not complete: {message}")]
    TaskFailed { operation: String, message: String },
}

impl DeadLetterError {
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    pub fn invalid_request(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn task_failed(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TaskFailed {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// True when the failure came from the backing broker rather than the caller
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Messaging(_) | Self::TaskFailed { .. })
    }
}

impl From<serde_json::Error> for DeadLetterError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

pub type DeadLetterResult<T> = Result<T, DeadLetterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messaging_errors_are_infrastructure() {
        let err: DeadLetterError = MessagingError::connection("refused").into();
        assert!(err.is_infrastructure());
        assert_eq!(err.to_string(), "Connection error: refused");
    }

    #[test]
    fn request_errors_are_not_infrastructure() {
        let err = DeadLetterError::invalid_request("source_queue", "must not be empty");
        assert!(!err.is_infrastructure());
        assert!(err.to_string().contains("source_queue"));
    }

    #[test]
    fn serde_errors_convert() {
        let parse = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: DeadLetterError = parse.into();
        assert!(matches!(err, DeadLetterError::Serialization { .. }));
    }
}
