//! # Failed-Message Envelope
//!
//! [`FailedMessageInfo`] is the durable record stored in a dead-letter queue:
//! the original payload preserved verbatim, where it came from, and the
//! attempt history that put it there. [`DeadLetterRequest`] is what callers
//! hand to a store; the store turns it into an envelope at send time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::time::Duration;
use uuid::Uuid;

use crate::config::ApplicationConfig;
use crate::dead_letter::classifier::{
    known_error_type, ErrorClassifier, FailureKind, StandardFailureClassifier,
};
use crate::environment::RuntimeEnvironment;
use crate::error::{DeadLetterError, DeadLetterResult};

/// One failed delivery attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureAttempt {
    pub exception_type: String,
    pub handler_type: String,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

impl FailureAttempt {
    pub fn new(
        exception_type: impl Into<String>,
        handler_type: impl Into<String>,
        message: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            exception_type: exception_type.into(),
            handler_type: handler_type.into(),
            message: message.into(),
            occurred_at,
        }
    }
}

/// Deployment identity captured when the envelope is created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentMetadata {
    pub environment_name: String,
    pub application_version: String,
    pub service_instance: String,
}

impl EnvironmentMetadata {
    pub fn capture(environment: RuntimeEnvironment, application: &ApplicationConfig) -> Self {
        Self {
            environment_name: environment.to_string(),
            application_version: application.resolved_version(),
            service_instance: application.resolved_instance_id(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedMessageInfo {
    pub message_id: Uuid,
    pub message_type: String,
    /// Serialized original payload, replayed unchanged on reprocess
    pub original_message: String,
    pub source_queue: String,
    pub first_attempt_at: DateTime<Utc>,
    /// True when `first_attempt_at` was derived from the attempt count
    #[serde(default)]
    pub first_attempt_estimated: bool,
    pub last_attempt_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub failure_attempts: Vec<FailureAttempt>,
    #[serde(default)]
    pub failure_kind: Option<FailureKind>,
    pub environment_metadata: EnvironmentMetadata,
}

impl FailedMessageInfo {
    /// Build an envelope at `now`; a missing first-attempt time is estimated
    /// as `now - attempt_count * attempt_spacing`
    pub fn from_request(
        request: DeadLetterRequest,
        now: DateTime<Utc>,
        attempt_spacing: Duration,
        environment_metadata: EnvironmentMetadata,
    ) -> Self {
        let attempt_count = request.attempt_count.max(1);

        let (first_attempt_at, first_attempt_estimated) = match request.first_attempt_at {
            Some(at) => (at.min(now), false),
            None => (
                estimate_first_attempt(now, attempt_spacing, attempt_count),
                true,
            ),
        };

        let mut failure_attempts = request.prior_attempts;
        failure_attempts.push(FailureAttempt::new(
            request.error_type,
            request.handler_type,
            request.error_message,
            now,
        ));

        Self {
            message_id: Uuid::new_v4(),
            message_type: request.message_type,
            original_message: request.original_message,
            source_queue: request.source_queue,
            first_attempt_at,
            first_attempt_estimated,
            last_attempt_at: now,
            attempt_count,
            failure_attempts,
            failure_kind: Some(request.failure_kind),
            environment_metadata,
        }
    }

    /// Append a failure before the envelope is first persisted
    pub fn record_failure(&mut self, attempt: FailureAttempt) {
        let recorded = u32::try_from(self.failure_attempts.len()).unwrap_or(u32::MAX);
        self.last_attempt_at = self.last_attempt_at.max(attempt.occurred_at);
        self.attempt_count = self.attempt_count.max(recorded.saturating_add(1));
        self.failure_attempts.push(attempt);
    }

    /// Latest failure, used for the `failure-reason` header
    pub fn last_failure(&self) -> Option<&FailureAttempt> {
        self.failure_attempts.last()
    }

    pub fn failure_reason(&self) -> &str {
        self.last_failure().map(|a| a.message.as_str()).unwrap_or("")
    }

    pub fn handler_type(&self) -> &str {
        self.last_failure()
            .map(|a| a.handler_type.as_str())
            .unwrap_or("")
    }

    /// Whether one attempt entry exists per delivery failure
    pub fn has_complete_history(&self) -> bool {
        self.failure_attempts.len() == self.attempt_count as usize
    }

    pub fn to_bytes(&self) -> DeadLetterResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> DeadLetterResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// `now - attempt_count * spacing`, clamped to the earliest representable instant
fn estimate_first_attempt(
    now: DateTime<Utc>,
    attempt_spacing: Duration,
    attempt_count: u32,
) -> DateTime<Utc> {
    attempt_spacing
        .checked_mul(attempt_count)
        .and_then(|elapsed| chrono::Duration::from_std(elapsed).ok())
        .and_then(|elapsed| now.checked_sub_signed(elapsed))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Everything a store needs to dead-letter one failed message
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterRequest {
    pub message_type: String,
    pub original_message: String,
    pub error_type: String,
    pub error_message: String,
    pub failure_kind: FailureKind,
    pub handler_type: String,
    pub source_queue: String,
    pub attempt_count: u32,
    pub first_attempt_at: Option<DateTime<Utc>>,
    pub prior_attempts: Vec<FailureAttempt>,
}

impl DeadLetterRequest {
    /// Capture a typed payload and error; type names come from the Rust types
    pub fn new<M, E>(
        message: &M,
        error: &E,
        handler_type: impl Into<String>,
        source_queue: impl Into<String>,
        attempt_count: u32,
    ) -> DeadLetterResult<Self>
    where
        M: Serialize + ?Sized,
        E: StdError + 'static,
    {
        let original_message = serde_json::to_string(message)?;
        let mut request = Self::from_dyn_error(
            std::any::type_name::<M>(),
            original_message,
            error,
            handler_type,
            source_queue,
            attempt_count,
        )?;
        request.error_type = std::any::type_name::<E>().to_string();
        Ok(request)
    }

    /// Capture an already serialized payload and a type-erased error
    pub fn from_dyn_error(
        message_type: impl Into<String>,
        original_message: impl Into<String>,
        error: &(dyn StdError + 'static),
        handler_type: impl Into<String>,
        source_queue: impl Into<String>,
        attempt_count: u32,
    ) -> DeadLetterResult<Self> {
        let source_queue = source_queue.into();
        if source_queue.trim().is_empty() {
            return Err(DeadLetterError::invalid_request(
                "source_queue",
                "must not be empty",
            ));
        }
        if source_queue.chars().any(char::is_whitespace) {
            return Err(DeadLetterError::invalid_request(
                "source_queue",
                format!("'{source_queue}' contains whitespace"),
            ));
        }

        Ok(Self {
            message_type: message_type.into(),
            original_message: original_message.into(),
            error_type: known_error_type(error)
                .unwrap_or("dyn core::error::Error")
                .to_string(),
            error_message: error.to_string(),
            failure_kind: StandardFailureClassifier.classify(error),
            handler_type: handler_type.into(),
            source_queue,
            attempt_count: attempt_count.max(1),
            first_attempt_at: None,
            prior_attempts: Vec::new(),
        })
    }

    /// Real first-attempt time threaded through from the caller
    pub fn with_first_attempt_at(mut self, first_attempt_at: DateTime<Utc>) -> Self {
        self.first_attempt_at = Some(first_attempt_at);
        self
    }

    /// Earlier failures, so the envelope carries one entry per attempt
    pub fn with_prior_attempts(mut self, attempts: Vec<FailureAttempt>) -> Self {
        self.prior_attempts = attempts;
        self
    }

    pub fn with_failure_kind(mut self, kind: FailureKind) -> Self {
        self.failure_kind = kind;
        self
    }

    /// Re-classify with a custom classifier
    pub fn classified_by(
        mut self,
        classifier: &dyn ErrorClassifier,
        error: &(dyn StdError + 'static),
    ) -> Self {
        self.failure_kind = classifier.classify(error);
        self
    }
}

/// Per-queue depth snapshot, recomputed on every call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterStatistics {
    pub total_dead_letter_messages: u64,
    pub messages_by_queue: BTreeMap<String, u64>,
    /// Queues that could not be inspected and were left out of the totals
    #[serde(default)]
    pub unavailable_queues: Vec<String>,
}

impl DeadLetterStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, queue_name: impl Into<String>, depth: u64) {
        let previous = self.messages_by_queue.insert(queue_name.into(), depth);
        self.total_dead_letter_messages =
            self.total_dead_letter_messages - previous.unwrap_or(0) + depth;
    }

    pub fn record_unavailable(&mut self, queue_name: impl Into<String>) {
        self.unavailable_queues.push(queue_name.into());
    }

    pub fn is_consistent(&self) -> bool {
        self.messages_by_queue.values().sum::<u64>() == self.total_dead_letter_messages
    }
}
