//! # No-Op Dead-Letter Store
//!
//! Used when persistence is disabled. Every operation is reduced to a log line
//! and retry decisions are deliberately conservative: a single retry, and only
//! for transient failures.

use async_trait::async_trait;
use std::error::Error as StdError;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::dead_letter::classifier::FailureKind;
use crate::dead_letter::envelope::{DeadLetterRequest, DeadLetterStatistics, FailedMessageInfo};
use crate::dead_letter::service::{DeadLetterService, StoreContext};
use crate::error::DeadLetterResult;

const BACKEND: &str = "noop";

#[derive(Debug, Clone)]
pub struct NoOpDeadLetterStore {
    context: StoreContext,
}

impl NoOpDeadLetterStore {
    pub fn new(context: StoreContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl DeadLetterService for NoOpDeadLetterStore {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    fn context(&self) -> &StoreContext {
        &self.context
    }

    fn supports_expiry(&self) -> bool {
        false
    }

    fn should_retry(&self, error: &(dyn StdError + 'static), attempt_count: u32) -> bool {
        attempt_count <= 1 && self.context.retry_policy.classify(error) == FailureKind::Transient
    }

    /// `2^attempt` seconds, uncapped apart from saturation
    fn calculate_retry_delay(&self, attempt_count: u32) -> Duration {
        Duration::from_secs(2u64.saturating_pow(attempt_count))
    }

    async fn ensure_topology(&self, source_queue: &str) -> DeadLetterResult<()> {
        info!(backend = BACKEND, source_queue = %source_queue, "Topology not created; dead-letter persistence disabled");
        Ok(())
    }

    async fn send_to_dead_letter(
        &self,
        request: DeadLetterRequest,
    ) -> DeadLetterResult<FailedMessageInfo> {
        let info = self.context.build_envelope(request);
        warn!(
            backend = BACKEND,
            message_id = %info.message_id,
            message_type = %info.message_type,
            source_queue = %info.source_queue,
            handler_type = %info.handler_type(),
            attempt_count = info.attempt_count,
            reason = %info.failure_reason(),
            "🪦 DEAD_LETTER: Persistence disabled; failed message only logged"
        );
        Ok(info)
    }

    async fn list_dead_letter_messages(
        &self,
        queue_name: &str,
        max_count: usize,
    ) -> DeadLetterResult<Vec<FailedMessageInfo>> {
        info!(backend = BACKEND, queue = %queue_name, max_count, "List requested; nothing is stored");
        Ok(Vec::new())
    }

    async fn reprocess_dead_letter_message(
        &self,
        queue_name: &str,
        message_id: Uuid,
    ) -> DeadLetterResult<bool> {
        info!(backend = BACKEND, queue = %queue_name, message_id = %message_id, "Reprocess requested; nothing is stored");
        Ok(false)
    }

    async fn purge_dead_letter_message(
        &self,
        queue_name: &str,
        message_id: Uuid,
    ) -> DeadLetterResult<bool> {
        info!(backend = BACKEND, queue = %queue_name, message_id = %message_id, "Purge requested; nothing is stored");
        Ok(false)
    }

    async fn get_dead_letter_statistics(&self) -> DeadLetterResult<DeadLetterStatistics> {
        let mut stats = DeadLetterStatistics::new();
        for queue_name in self.known_queues() {
            stats.record(queue_name, 0);
        }
        Ok(stats)
    }

    async fn health_check(&self) -> DeadLetterResult<bool> {
        Ok(true)
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeadLetterConfig;
    use crate::dead_letter::classifier::HandlerFailure;
    use crate::environment::RuntimeEnvironment;

    fn store() -> NoOpDeadLetterStore {
        NoOpDeadLetterStore::new(StoreContext::from_config(
            &DeadLetterConfig::default(),
            RuntimeEnvironment::Test,
        ))
    }

    #[test]
    fn retries_transient_once() {
        let store = store();
        let err = HandlerFailure::network("reset");
        assert!(store.should_retry(&err, 1));
        assert!(!store.should_retry(&err, 2));
    }

    #[test]
    fn never_retries_non_transient_after_first_attempt() {
        let store = store();
        assert!(!store.should_retry(&HandlerFailure::validation("bad"), 1));
        assert!(!store.should_retry(&HandlerFailure::data_integrity("corrupt"), 1));
    }

    #[test]
    fn uncapped_base_two_delay() {
        let store = store();
        assert_eq!(store.calculate_retry_delay(1), Duration::from_secs(2));
        assert_eq!(store.calculate_retry_delay(3), Duration::from_secs(8));
        assert_eq!(store.calculate_retry_delay(10), Duration::from_secs(1024));
    }

    #[tokio::test]
    async fn operations_are_inert() {
        let store = store();
        let request = DeadLetterRequest::new(
            &"payload",
            &HandlerFailure::validation("bad"),
            "Handler",
            "orders",
            1,
        )
        .unwrap();
        let info = store.send_to_dead_letter(request).await.unwrap();

        assert!(store.list_dead_letter_messages("orders", 10).await.unwrap().is_empty());
        assert!(!store.purge_dead_letter_message("orders", info.message_id).await.unwrap());
        let stats = store.get_dead_letter_statistics().await.unwrap();
        assert_eq!(stats.total_dead_letter_messages, 0);
    }
}
