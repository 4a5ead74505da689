//! # Dead-Letter Topology
//!
//! Naming rules and wire headers shared by every backend.
//!
//! | Item | Format |
//! |------|--------|
//! | queue | `<queue_prefix>.<source_queue>` |
//! | routing key | `<routing_key_prefix>.<source_queue>` |
//! | `x-message-ttl` / `expiration` | `ttl_hours * 3_600_000` ms |
//!
//! Entries older than the TTL are discarded by brokers that support expiry.
//! Operators should treat the TTL as a retention limit: an entry nobody
//! reprocesses or purges in time is lost.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::time::Duration;
use uuid::Uuid;

use crate::config::DeadLetterQueueConfig;
use crate::dead_letter::envelope::FailedMessageInfo;

pub const HEADER_ORIGINAL_MESSAGE_TYPE: &str = "original-message-type";
pub const HEADER_FAILURE_REASON: &str = "failure-reason";
pub const HEADER_ATTEMPT_COUNT: &str = "attempt-count";
pub const HEADER_SOURCE_QUEUE: &str = "source-queue";
pub const HEADER_HANDLER_TYPE: &str = "handler-type";
pub const HEADER_FAILED_AT: &str = "failed-at";

pub const HEADER_REPROCESSED_FROM_DLQ: &str = "reprocessed-from-dlq";
pub const HEADER_ORIGINAL_MESSAGE_ID: &str = "original-message-id";
pub const HEADER_REPROCESSED_AT: &str = "reprocessed-at";

pub const CONTENT_TYPE_JSON: &str = "application/json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTopology {
    exchange_name: String,
    queue_prefix: String,
    routing_key_prefix: String,
    ttl: Option<Duration>,
}

impl QueueTopology {
    pub fn new(
        exchange_name: impl Into<String>,
        queue_prefix: impl Into<String>,
        routing_key_prefix: impl Into<String>,
        ttl: Option<Duration>,
    ) -> Self {
        Self {
            exchange_name: exchange_name.into(),
            queue_prefix: queue_prefix.into(),
            routing_key_prefix: routing_key_prefix.into(),
            ttl,
        }
    }

    pub fn from_config(config: &DeadLetterQueueConfig) -> Self {
        Self::new(
            config.exchange_name.clone(),
            config.queue_prefix.clone(),
            config.routing_key_prefix.clone(),
            config.ttl(),
        )
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn queue_name(&self, source_queue: &str) -> String {
        format!("{}.{}", self.queue_prefix, source_queue)
    }

    pub fn routing_key(&self, source_queue: &str) -> String {
        format!("{}.{}", self.routing_key_prefix, source_queue)
    }

    /// Accepts either a dead-letter queue name or a bare source queue name
    pub fn resolve_queue_name(&self, name: &str) -> String {
        if self.source_queue_of(name).is_some() {
            name.to_string()
        } else {
            self.queue_name(name)
        }
    }

    /// Inverse of [`queue_name`](Self::queue_name)
    pub fn source_queue_of<'a>(&self, queue_name: &'a str) -> Option<&'a str> {
        queue_name
            .strip_prefix(self.queue_prefix.as_str())
            .and_then(|rest| rest.strip_prefix('.'))
            .filter(|source| !source.is_empty())
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub fn ttl_millis(&self) -> Option<u64> {
        self.ttl.map(|ttl| ttl.as_millis().min(u128::from(u64::MAX)) as u64)
    }
}

/// The descriptive headers attached to every dead-lettered message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterHeaders {
    pub original_message_type: String,
    pub failure_reason: String,
    pub attempt_count: u32,
    pub source_queue: String,
    pub handler_type: String,
    pub failed_at: String,
}

impl DeadLetterHeaders {
    pub fn from_envelope(info: &FailedMessageInfo) -> Self {
        Self {
            original_message_type: info.message_type.clone(),
            failure_reason: info.failure_reason().to_string(),
            attempt_count: info.attempt_count,
            source_queue: info.source_queue.clone(),
            handler_type: info.handler_type().to_string(),
            failed_at: iso8601(info.last_attempt_at),
        }
    }

    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert(
            HEADER_ORIGINAL_MESSAGE_TYPE.into(),
            Value::String(self.original_message_type.clone()),
        );
        map.insert(
            HEADER_FAILURE_REASON.into(),
            Value::String(self.failure_reason.clone()),
        );
        map.insert(HEADER_ATTEMPT_COUNT.into(), Value::from(self.attempt_count));
        map.insert(
            HEADER_SOURCE_QUEUE.into(),
            Value::String(self.source_queue.clone()),
        );
        map.insert(
            HEADER_HANDLER_TYPE.into(),
            Value::String(self.handler_type.clone()),
        );
        map.insert(HEADER_FAILED_AT.into(), Value::String(self.failed_at.clone()));
        Value::Object(map)
    }
}

/// Provenance attached to a message republished from a dead-letter queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReprocessHeaders {
    pub original_message_id: Uuid,
    pub correlation_id: Uuid,
    pub reprocessed_at: String,
}

impl ReprocessHeaders {
    pub fn new(original_message_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            original_message_id,
            correlation_id: Uuid::new_v4(),
            reprocessed_at: iso8601(now),
        }
    }

    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert(HEADER_REPROCESSED_FROM_DLQ.into(), Value::Bool(true));
        map.insert(
            HEADER_ORIGINAL_MESSAGE_ID.into(),
            Value::String(self.original_message_id.to_string()),
        );
        map.insert(
            HEADER_REPROCESSED_AT.into(),
            Value::String(self.reprocessed_at.clone()),
        );
        map.insert(
            "correlation-id".into(),
            Value::String(self.correlation_id.to_string()),
        );
        Value::Object(map)
    }
}

pub fn iso8601(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}
