//! # Dead-Letter Store Enum
//!
//! Enum dispatch over the concrete backends, so callers hold one concrete
//! type regardless of which backend the selector picked.
//!
//! ```ignore
//! let store = DeadLetterStore::InMemory(InMemoryDeadLetterStore::new(context));
//!
//! if !store.should_retry(&err, attempt) {
//!     store.send_failure(&payload, &err, "OrderHandler", "orders", attempt).await?;
//! }
//! ```

use async_trait::async_trait;
use serde::Serialize;
use std::error::Error as StdError;
use std::time::Duration;
use uuid::Uuid;

use super::backends::{
    InMemoryDeadLetterStore, NoOpDeadLetterStore, PgmqDeadLetterStore, RabbitMqDeadLetterStore,
};
use super::envelope::{DeadLetterRequest, DeadLetterStatistics, FailedMessageInfo};
use super::service::{DeadLetterService, StoreContext};
use crate::error::DeadLetterResult;

#[derive(Debug)]
pub enum DeadLetterStore {
    /// Self-hosted RabbitMQ via lapin
    RabbitMq(RabbitMqDeadLetterStore),

    /// PGMQ on managed PostgreSQL
    Pgmq(PgmqDeadLetterStore),

    /// Persistence disabled
    NoOp(NoOpDeadLetterStore),

    /// Process-local store for tests and embedded use
    InMemory(InMemoryDeadLetterStore),
}

impl DeadLetterStore {
    /// Dead-letter a typed payload after its handler failed
    pub async fn send_failure<M, E>(
        &self,
        message: &M,
        error: &E,
        handler_type: &str,
        source_queue: &str,
        attempt_count: u32,
    ) -> DeadLetterResult<FailedMessageInfo>
    where
        M: Serialize + ?Sized,
        E: StdError + 'static,
    {
        let request =
            DeadLetterRequest::new(message, error, handler_type, source_queue, attempt_count)?
                .classified_by(self.context().retry_policy.classifier().as_ref(), error);
        self.send_to_dead_letter(request).await
    }

    pub fn as_in_memory(&self) -> Option<&InMemoryDeadLetterStore> {
        match self {
            Self::InMemory(s) => Some(s),
            _ => None,
        }
    }
}

#[async_trait]
impl DeadLetterService for DeadLetterStore {
    fn backend_name(&self) -> &'static str {
        match self {
            Self::RabbitMq(s) => s.backend_name(),
            Self::Pgmq(s) => s.backend_name(),
            Self::NoOp(s) => s.backend_name(),
            Self::InMemory(s) => s.backend_name(),
        }
    }

    fn context(&self) -> &StoreContext {
        match self {
            Self::RabbitMq(s) => s.context(),
            Self::Pgmq(s) => s.context(),
            Self::NoOp(s) => s.context(),
            Self::InMemory(s) => s.context(),
        }
    }

    fn supports_expiry(&self) -> bool {
        match self {
            Self::RabbitMq(s) => s.supports_expiry(),
            Self::Pgmq(s) => s.supports_expiry(),
            Self::NoOp(s) => s.supports_expiry(),
            Self::InMemory(s) => s.supports_expiry(),
        }
    }

    fn should_retry(&self, error: &(dyn StdError + 'static), attempt_count: u32) -> bool {
        match self {
            Self::RabbitMq(s) => s.should_retry(error, attempt_count),
            Self::Pgmq(s) => s.should_retry(error, attempt_count),
            Self::NoOp(s) => s.should_retry(error, attempt_count),
            Self::InMemory(s) => s.should_retry(error, attempt_count),
        }
    }

    fn calculate_retry_delay(&self, attempt_count: u32) -> Duration {
        match self {
            Self::RabbitMq(s) => s.calculate_retry_delay(attempt_count),
            Self::Pgmq(s) => s.calculate_retry_delay(attempt_count),
            Self::NoOp(s) => s.calculate_retry_delay(attempt_count),
            Self::InMemory(s) => s.calculate_retry_delay(attempt_count),
        }
    }

    async fn ensure_topology(&self, source_queue: &str) -> DeadLetterResult<()> {
        match self {
            Self::RabbitMq(s) => s.ensure_topology(source_queue).await,
            Self::Pgmq(s) => s.ensure_topology(source_queue).await,
            Self::NoOp(s) => s.ensure_topology(source_queue).await,
            Self::InMemory(s) => s.ensure_topology(source_queue).await,
        }
    }

    async fn send_to_dead_letter(
        &self,
        request: DeadLetterRequest,
    ) -> DeadLetterResult<FailedMessageInfo> {
        match self {
            Self::RabbitMq(s) => s.send_to_dead_letter(request).await,
            Self::Pgmq(s) => s.send_to_dead_letter(request).await,
            Self::NoOp(s) => s.send_to_dead_letter(request).await,
            Self::InMemory(s) => s.send_to_dead_letter(request).await,
        }
    }

    async fn list_dead_letter_messages(
        &self,
        queue_name: &str,
        max_count: usize,
    ) -> DeadLetterResult<Vec<FailedMessageInfo>> {
        match self {
            Self::RabbitMq(s) => s.list_dead_letter_messages(queue_name, max_count).await,
            Self::Pgmq(s) => s.list_dead_letter_messages(queue_name, max_count).await,
            Self::NoOp(s) => s.list_dead_letter_messages(queue_name, max_count).await,
            Self::InMemory(s) => s.list_dead_letter_messages(queue_name, max_count).await,
        }
    }

    async fn reprocess_dead_letter_message(
        &self,
        queue_name: &str,
        message_id: Uuid,
    ) -> DeadLetterResult<bool> {
        match self {
            Self::RabbitMq(s) => s.reprocess_dead_letter_message(queue_name, message_id).await,
            Self::Pgmq(s) => s.reprocess_dead_letter_message(queue_name, message_id).await,
            Self::NoOp(s) => s.reprocess_dead_letter_message(queue_name, message_id).await,
            Self::InMemory(s) => s.reprocess_dead_letter_message(queue_name, message_id).await,
        }
    }

    async fn purge_dead_letter_message(
        &self,
        queue_name: &str,
        message_id: Uuid,
    ) -> DeadLetterResult<bool> {
        match self {
            Self::RabbitMq(s) => s.purge_dead_letter_message(queue_name, message_id).await,
            Self::Pgmq(s) => s.purge_dead_letter_message(queue_name, message_id).await,
            Self::NoOp(s) => s.purge_dead_letter_message(queue_name, message_id).await,
            Self::InMemory(s) => s.purge_dead_letter_message(queue_name, message_id).await,
        }
    }

    async fn get_dead_letter_statistics(&self) -> DeadLetterResult<DeadLetterStatistics> {
        match self {
            Self::RabbitMq(s) => s.get_dead_letter_statistics().await,
            Self::Pgmq(s) => s.get_dead_letter_statistics().await,
            Self::NoOp(s) => s.get_dead_letter_statistics().await,
            Self::InMemory(s) => s.get_dead_letter_statistics().await,
        }
    }

    async fn health_check(&self) -> DeadLetterResult<bool> {
        match self {
            Self::RabbitMq(s) => s.health_check().await,
            Self::Pgmq(s) => s.health_check().await,
            Self::NoOp(s) => s.health_check().await,
            Self::InMemory(s) => s.health_check().await,
        }
    }

    async fn close(&self) {
        match self {
            Self::RabbitMq(s) => s.close().await,
            Self::Pgmq(s) => s.close().await,
            Self::NoOp(s) => s.close().await,
            Self::InMemory(s) => s.close().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeadLetterConfig;
    use crate::dead_letter::classifier::{FailureKind, HandlerFailure};
    use crate::environment::RuntimeEnvironment;

    fn in_memory() -> DeadLetterStore {
        let mut config = DeadLetterConfig::default();
        config.dead_letter.source_queues = vec!["orders".into()];
        DeadLetterStore::InMemory(InMemoryDeadLetterStore::new(StoreContext::from_config(
            &config,
            RuntimeEnvironment::Test,
        )))
    }

    #[derive(Serialize)]
    struct OrderPlaced {
        order_id: u64,
    }

    #[tokio::test]
    async fn send_failure_records_type_names_and_kind() {
        let store = in_memory();
        let info = store
            .send_failure(
                &OrderPlaced { order_id: 9 },
                &HandlerFailure::timeout("upstream"),
                "OrderHandler",
                "orders",
                3,
            )
            .await
            .unwrap();

        assert!(info.message_type.ends_with("OrderPlaced"));
        assert_eq!(info.original_message, r#"{"order_id":9}"#);
        assert_eq!(info.failure_kind, Some(FailureKind::Transient));
        assert_eq!(store.backend_name(), "in_memory");
        assert_eq!(store.as_in_memory().unwrap().raw_entries("orders").len(), 1);
    }

    #[tokio::test]
    async fn dispatch_reaches_backend() {
        let store = in_memory();
        assert!(store.health_check().await.unwrap());
        assert!(store.supports_expiry());
        assert_eq!(store.calculate_retry_delay(2), Duration::from_secs(2));
        assert!(!store.purge_dead_letter_message("orders", Uuid::new_v4()).await.unwrap());
        store.close().await;
    }
}
