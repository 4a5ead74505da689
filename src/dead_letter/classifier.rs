//! # Failure Classification
//!
//! Maps a handler failure onto the [`FailureKind`] that drives every retry
//! decision. Classification walks the error and its `source()` chain and
//! downcasts each link against the error types this crate understands; the
//! first recognised link decides. Anything unrecognised is [`FailureKind::Unknown`].
//!
//! Handlers that want an explicit classification return a [`HandlerFailure`]
//! (directly or as the source of their own error):
//!
//! ```rust
//! use dead_letter_core::dead_letter::classifier::{
//!     ErrorClassifier, FailureCause, FailureKind, HandlerFailure, StandardFailureClassifier,
//! };
//!
//! let failure = HandlerFailure::new(FailureCause::Validation, "missing tax id");
//! assert_eq!(StandardFailureClassifier.classify(&failure), FailureKind::Permanent);
//! ```

use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;
use std::io::ErrorKind;

use crate::messaging::MessagingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// May succeed on retry (network timeout, connection reset)
    Transient,
    /// Will never succeed (malformed payload, business rule violation)
    Permanent,
    /// Never retried and needs an operator (data corruption, security violation)
    Critical,
    /// Unrecognised; retried conservatively
    Unknown,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::Critical => "critical",
            Self::Unknown => "unknown",
        }
    }

    /// Permanent and critical failures are never retried
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Permanent | Self::Critical)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Explicit failure causes a handler can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    Network,
    Timeout,
    ConnectionReset,
    Validation,
    Serialization,
    BusinessRule,
    DataIntegrity,
    SecurityViolation,
}

impl FailureCause {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Network | Self::Timeout | Self::ConnectionReset => FailureKind::Transient,
            Self::Validation | Self::Serialization | Self::BusinessRule => FailureKind::Permanent,
            Self::DataIntegrity | Self::SecurityViolation => FailureKind::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::ConnectionReset => "connection_reset",
            Self::Validation => "validation",
            Self::Serialization => "serialization",
            Self::BusinessRule => "business_rule",
            Self::DataIntegrity => "data_integrity",
            Self::SecurityViolation => "security_violation",
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A handler error carrying its own cause
#[derive(Debug, thiserror::Error)]
#[error("{cause} failure: {message}")]
pub struct HandlerFailure {
    pub cause: FailureCause,
    pub message: String,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl HandlerFailure {
    pub fn new(cause: FailureCause, message: impl Into<String>) -> Self {
        Self {
            cause,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(FailureCause::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureCause::Timeout, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FailureCause::Validation, message)
    }

    pub fn business_rule(message: impl Into<String>) -> Self {
        Self::new(FailureCause::BusinessRule, message)
    }

    pub fn data_integrity(message: impl Into<String>) -> Self {
        Self::new(FailureCause::DataIntegrity, message)
    }

    pub fn security_violation(message: impl Into<String>) -> Self {
        Self::new(FailureCause::SecurityViolation, message)
    }
}

/// Strategy seam for classification; the retry policy and stores hold one of these
pub trait ErrorClassifier: Send + Sync + fmt::Debug {
    fn classify(&self, error: &(dyn StdError + 'static)) -> FailureKind;
}

/// Downcast-based classifier covering std, serde, tokio, sqlx and crate errors
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardFailureClassifier;

impl StandardFailureClassifier {
    pub fn new() -> Self {
        Self
    }

    fn classify_link(&self, error: &(dyn StdError + 'static)) -> Option<FailureKind> {
        if let Some(failure) = error.downcast_ref::<HandlerFailure>() {
            return Some(failure.cause.kind());
        }
        if let Some(io) = error.downcast_ref::<std::io::Error>() {
            return classify_io(io.kind());
        }
        if error.is::<tokio::time::error::Elapsed>() {
            return Some(FailureKind::Transient);
        }
        if error.is::<serde_json::Error>() {
            return Some(FailureKind::Permanent);
        }
        if let Some(messaging) = error.downcast_ref::<MessagingError>() {
            return classify_messaging(messaging);
        }
        if let Some(sql) = error.downcast_ref::<sqlx::Error>() {
            return classify_sqlx(sql);
        }
        None
    }
}

impl ErrorClassifier for StandardFailureClassifier {
    fn classify(&self, error: &(dyn StdError + 'static)) -> FailureKind {
        let mut current = Some(error);
        while let Some(link) = current {
            if let Some(kind) = self.classify_link(link) {
                return kind;
            }
            current = link.source();
        }
        FailureKind::Unknown
    }
}

fn classify_io(kind: ErrorKind) -> Option<FailureKind> {
    match kind {
        ErrorKind::TimedOut
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::NotConnected
        | ErrorKind::Interrupted
        | ErrorKind::WouldBlock
        | ErrorKind::AddrNotAvailable => Some(FailureKind::Transient),
        ErrorKind::InvalidData | ErrorKind::InvalidInput | ErrorKind::UnexpectedEof => {
            Some(FailureKind::Permanent)
        }
        ErrorKind::PermissionDenied => Some(FailureKind::Critical),
        _ => None,
    }
}

fn classify_messaging(error: &MessagingError) -> Option<FailureKind> {
    if error.is_transient() {
        return Some(FailureKind::Transient);
    }
    match error {
        MessagingError::MessageSerialization { .. } | MessagingError::InvalidQueueName { .. } => Some(FailureKind::Permanent),
        _ => None,
    }
}

fn classify_sqlx(error: &sqlx::Error) -> Option<FailureKind> {
    match error {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            Some(FailureKind::Transient)
        }
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::TypeNotFound { .. }
        | sqlx::Error::ColumnNotFound(_) => Some(FailureKind::Permanent),
        sqlx::Error::Database(db) => match db.code().as_deref() {
            // class 23: integrity constraint violation
            Some(code) if code.starts_with("23") => Some(FailureKind::Critical),
            // class 40: transaction rollback (serialization failure, deadlock)
            Some(code) if code.starts_with("40") => Some(FailureKind::Transient),
            _ => None,
        },
        _ => None,
    }
}

/// Human-readable type label for type-erased errors, when the concrete type is known
pub fn known_error_type(error: &(dyn StdError + 'static)) -> Option<&'static str> {
    if error.is::<HandlerFailure>() {
        Some("dead_letter_core::HandlerFailure")
    } else if error.is::<std::io::Error>() {
        Some("std::io::Error")
    } else if error.is::<tokio::time::error::Elapsed>() {
        Some("tokio::time::error::Elapsed")
    } else if error.is::<serde_json::Error>() {
        Some("serde_json::Error")
    } else if error.is::<MessagingError>() {
        Some("dead_letter_core::MessagingError")
    } else if error.is::<sqlx::Error>() {
        Some("sqlx::Error")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("wrapped: {inner}")]
    struct Wrapper {
        #[source]
        inner: std::io::Error,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("something odd")]
    struct Opaque;

    fn classify(error: &(dyn StdError + 'static)) -> FailureKind {
        StandardFailureClassifier.classify(error)
    }

    #[test]
    fn handler_failure_causes_map_to_kinds() {
        assert_eq!(classify(&HandlerFailure::network("reset")), FailureKind::Transient);
        assert_eq!(classify(&HandlerFailure::timeout("slow")), FailureKind::Transient);
        assert_eq!(classify(&HandlerFailure::validation("bad")), FailureKind::Permanent);
        assert_eq!(classify(&HandlerFailure::business_rule("no")), FailureKind::Permanent);
        assert_eq!(classify(&HandlerFailure::data_integrity("dup")), FailureKind::Critical);
        assert_eq!(
            classify(&HandlerFailure::security_violation("forged")),
            FailureKind::Critical
        );
    }

    #[test]
    fn io_errors() {
        let timeout = std::io::Error::new(ErrorKind::TimedOut, "timed out");
        assert_eq!(classify(&timeout), FailureKind::Transient);
        let invalid = std::io::Error::new(ErrorKind::InvalidData, "garbage");
        assert_eq!(classify(&invalid), FailureKind::Permanent);
        let other = std::io::Error::new(ErrorKind::Other, "?");
        assert_eq!(classify(&other), FailureKind::Unknown);
    }

    #[test]
    fn walks_source_chain() {
        let err = Wrapper {
            inner: std::io::Error::new(ErrorKind::ConnectionReset, "reset by peer"),
        };
        assert_eq!(classify(&err), FailureKind::Transient);
    }

    #[test]
    fn serde_errors_are_permanent() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert_eq!(classify(&err), FailureKind::Permanent);
    }

    #[test]
    fn messaging_errors() {
        assert_eq!(classify(&MessagingError::connection("down")), FailureKind::Transient);
        assert_eq!(classify(&MessagingError::serialization("bad")), FailureKind::Permanent);
    }

    #[test]
    fn unrecognised_errors_are_unknown() {
        assert_eq!(classify(&Opaque), FailureKind::Unknown);
    }

    #[test]
    fn outermost_recognised_link_wins() {
        let failure = HandlerFailure::validation("bad input")
            .with_source(std::io::Error::new(ErrorKind::TimedOut, "late"));
        assert_eq!(classify(&failure), FailureKind::Permanent);
    }

    #[test]
    fn known_type_labels() {
        assert_eq!(known_error_type(&Opaque), None);
        assert_eq!(
            known_error_type(&std::io::Error::new(ErrorKind::Other, "x")),
            Some("std::io::Error")
        );
    }

    #[test]
    fn terminal_kinds() {
        assert!(FailureKind::Permanent.is_terminal());
        assert!(FailureKind::Critical.is_terminal());
        assert!(!FailureKind::Transient.is_terminal());
        assert!(!FailureKind::Unknown.is_terminal());
    }
}
