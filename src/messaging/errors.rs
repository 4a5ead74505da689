//! # Messaging Error Types
//!
//! Infrastructure failures raised by the broker backends while publishing,
//! browsing, acknowledging or inspecting dead-letter queues.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MessagingError {
    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Database query error: {operation}: {message}")]
    DatabaseQuery { operation: String, message: String },

    #[error("Queue operation failed: {queue_name}: {operation}: {message}")]
    QueueOperation {
        queue_name: String,
        operation: String,
        message: String,
    },

    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Message serialization error: {message}")]
    MessageSerialization { message: String },

    #[error("Configuration error: {component}: {message}")]
    Configuration { component: String, message: String },

    #[error("Network timeout: operation {operation} timed out after {timeout_seconds}s")]
    Timeout {
        operation: String,
        timeout_seconds: u64,
    },

    #[error("Connection pool exhausted: {message}")]
    PoolExhausted { message: String },

    #[error("Publish was not confirmed by the broker: {queue_name}")]
    PublishNotConfirmed { queue_name: String },

    #[error("Invalid queue name: {queue_name}: {reason}")]
    InvalidQueueName { queue_name: String, reason: String },

    #[error("Backend unavailable: {backend}: {message}")]
    Unavailable { backend: String, message: String },
}

impl MessagingError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn database_query(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DatabaseQuery {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn queue_not_found(queue_name: impl Into<String>) -> Self {
        Self::QueueNotFound {
            queue_name: queue_name.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::MessageSerialization {
            message: message.into(),
        }
    }

    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            component: component.into(),
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_seconds: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_seconds,
        }
    }

    pub fn pool_exhausted(message: impl Into<String>) -> Self {
        Self::PoolExhausted {
            message: message.into(),
        }
    }

    pub fn publish_not_confirmed(queue_name: impl Into<String>) -> Self {
        Self::PublishNotConfirmed {
            queue_name: queue_name.into(),
        }
    }

    pub fn invalid_queue_name(queue_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidQueueName {
            queue_name: queue_name.into(),
            reason: reason.into(),
        }
    }

    pub fn unavailable(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unavailable {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Create a topology creation error (exchange, queue or binding)
    pub fn queue_creation(queue_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::QueueOperation {
            queue_name: queue_name.into(),
            operation: "create".to_string(),
            message: message.into(),
        }
    }

    pub fn send(queue_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::QueueOperation {
            queue_name: queue_name.into(),
            operation: "send".to_string(),
            message: message.into(),
        }
    }

    pub fn receive(queue_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::QueueOperation {
            queue_name: queue_name.into(),
            operation: "receive".to_string(),
            message: message.into(),
        }
    }

    pub fn ack(queue_name: impl Into<String>, delivery_tag: u64, message: impl Into<String>) -> Self {
        Self::QueueOperation {
            queue_name: queue_name.into(),
            operation: format!("ack(delivery_tag={delivery_tag})"),
            message: message.into(),
        }
    }

    pub fn nack(
        queue_name: impl Into<String>,
        delivery_tag: u64,
        message: impl Into<String>,
    ) -> Self {
        Self::QueueOperation {
            queue_name: queue_name.into(),
            operation: format!("nack(delivery_tag={delivery_tag})"),
            message: message.into(),
        }
    }

    pub fn delete(queue_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::QueueOperation {
            queue_name: queue_name.into(),
            operation: "delete".to_string(),
            message: message.into(),
        }
    }

    pub fn queue_stats(queue_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::QueueOperation {
            queue_name: queue_name.into(),
            operation: "queue_stats".to_string(),
            message: message.into(),
        }
    }

    /// Whether a retry of the same operation could plausibly succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::Timeout { .. }
                | Self::PoolExhausted { .. }
                | Self::Unavailable { .. }
                | Self::PublishNotConfirmed { .. }
        )
    }
}

impl From<sqlx::Error> for MessagingError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => Self::pool_exhausted("timed out waiting for connection"),
            sqlx::Error::PoolClosed => Self::connection("connection pool closed"),
            sqlx::Error::Io(e) => Self::connection(e.to_string()),
            other => Self::database_query("sql", other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helper_constructors_fill_operation() {
        match MessagingError::ack("dlq.orders", 7, "channel closed") {
            MessagingError::QueueOperation {
                queue_name,
                operation,
                ..
            } => {
                assert_eq!(queue_name, "dlq.orders");
                assert_eq!(operation, "ack(delivery_tag=7)");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn transient_variants() {
        assert!(MessagingError::connection("down").is_transient());
        assert!(MessagingError::timeout("publish", 5).is_transient());
        assert!(!MessagingError::serialization("bad").is_transient());
        assert!(!MessagingError::queue_not_found("dlq.x").is_transient());
    }

    #[test]
    fn sqlx_pool_timeout_maps_to_pool_exhausted() {
        let err: MessagingError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, MessagingError::PoolExhausted { .. }));
    }
}
