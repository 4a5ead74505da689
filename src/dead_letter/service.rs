//! # Dead-Letter Service Contract
//!
//! The operations every backend implements, and the [`StoreContext`] that
//! carries the configuration each backend shares: topology, retry policy,
//! environment metadata and notification dispatch.

use async_trait::async_trait;
use chrono::Utc;
use std::error::Error as StdError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};
use uuid::Uuid;

use crate::config::DeadLetterConfig;
use crate::dead_letter::envelope::{
    DeadLetterRequest, DeadLetterStatistics, EnvironmentMetadata, FailedMessageInfo,
};
use crate::dead_letter::notifier::{AdminNotifier, NotificationDispatcher, TracingNotifier};
use crate::dead_letter::retry::RetryPolicy;
use crate::dead_letter::topology::QueueTopology;
use crate::environment::RuntimeEnvironment;
use crate::error::{DeadLetterError, DeadLetterResult};

/// Dead-letter store contract
///
/// Reprocess and purge return `Ok(false)` when no entry with the requested id
/// is present; that is not an error. Infrastructure failures in send,
/// reprocess and purge are always returned. `queue_name` arguments accept
/// either the dead-letter queue name (`dlq.orders`) or the source queue
/// (`orders`).
#[async_trait]
pub trait DeadLetterService: Send + Sync + 'static {
    fn backend_name(&self) -> &'static str;

    fn context(&self) -> &StoreContext;

    /// Whether the backend discards entries once the TTL elapses
    fn supports_expiry(&self) -> bool;

    fn should_retry(&self, error: &(dyn StdError + 'static), attempt_count: u32) -> bool {
        self.context().retry_policy.should_retry(error, attempt_count)
    }

    fn calculate_retry_delay(&self, attempt_count: u32) -> Duration {
        self.context().retry_policy.calculate_retry_delay(attempt_count)
    }

    /// Dead-letter queue names covered by statistics
    fn known_queues(&self) -> Vec<String> {
        self.context().known_queues()
    }

    /// Idempotently create exchange, queue and binding for a source queue
    async fn ensure_topology(&self, source_queue: &str) -> DeadLetterResult<()>;

    async fn send_to_dead_letter(
        &self,
        request: DeadLetterRequest,
    ) -> DeadLetterResult<FailedMessageInfo>;

    /// Non-destructive browse of up to `max_count` entries, in queue order
    async fn list_dead_letter_messages(
        &self,
        queue_name: &str,
        max_count: usize,
    ) -> DeadLetterResult<Vec<FailedMessageInfo>>;

    async fn reprocess_dead_letter_message(
        &self,
        queue_name: &str,
        message_id: Uuid,
    ) -> DeadLetterResult<bool>;

    async fn purge_dead_letter_message(
        &self,
        queue_name: &str,
        message_id: Uuid,
    ) -> DeadLetterResult<bool>;

    async fn get_dead_letter_statistics(&self) -> DeadLetterResult<DeadLetterStatistics>;

    async fn health_check(&self) -> DeadLetterResult<bool>;

    /// Release broker resources; never fails
    async fn close(&self);
}

/// Configuration shared by every backend instance
#[derive(Debug, Clone)]
pub struct StoreContext {
    pub topology: QueueTopology,
    pub retry_policy: RetryPolicy,
    pub environment_metadata: EnvironmentMetadata,
    pub notifications: NotificationDispatcher,
    pub attempt_spacing: Duration,
    pub browse_limit: usize,
    pub source_queues: Vec<String>,
}

impl StoreContext {
    pub fn from_config(config: &DeadLetterConfig, environment: RuntimeEnvironment) -> Self {
        Self {
            topology: QueueTopology::from_config(&config.dead_letter),
            retry_policy: RetryPolicy::from_config(&config.retry),
            environment_metadata: EnvironmentMetadata::capture(environment, &config.application),
            notifications: NotificationDispatcher::new(
                config.dead_letter.notify_administrators,
                Arc::new(TracingNotifier),
            ),
            attempt_spacing: config.dead_letter.attempt_spacing(),
            browse_limit: config.dead_letter.browse_limit,
            source_queues: config.dead_letter.known_source_queues(),
        }
    }

    /// Replace the notifier while keeping the enabled flag from configuration
    pub fn with_notifier(mut self, notifier: Arc<dyn AdminNotifier>) -> Self {
        self.notifications = NotificationDispatcher::new(self.notifications.is_enabled(), notifier);
        self
    }

    pub fn with_notifications(mut self, notifications: NotificationDispatcher) -> Self {
        self.notifications = notifications;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn build_envelope(&self, request: DeadLetterRequest) -> FailedMessageInfo {
        FailedMessageInfo::from_request(
            request,
            Utc::now(),
            self.attempt_spacing,
            self.environment_metadata.clone(),
        )
    }

    pub fn known_queues(&self) -> Vec<String> {
        self.source_queues
            .iter()
            .map(|source| self.topology.queue_name(source))
            .collect()
    }

    /// Browse size after applying the configured bound
    pub fn browse_count(&self, max_count: usize) -> usize {
        max_count.min(self.browse_limit)
    }
}

/// Run a backend round trip on its own task so dropping the caller's future
/// cannot stop it halfway through an ack, nack or delete
pub(crate) async fn run_to_completion<F, T>(operation: &'static str, fut: F) -> DeadLetterResult<T>
where
    F: Future<Output = DeadLetterResult<T>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(fut)
        .await
        .map_err(|e| DeadLetterError::task_failed(operation, e.to_string()))?
}

pub(crate) fn log_dead_lettered(backend: &str, queue_name: &str, info: &FailedMessageInfo) {
    warn!(
        backend = %backend,
        queue = %queue_name,
        message_id = %info.message_id,
        message_type = %info.message_type,
        source_queue = %info.source_queue,
        handler_type = %info.handler_type(),
        attempt_count = info.attempt_count,
        failure_kind = ?info.failure_kind,
        reason = %info.failure_reason(),
        "🪦 DEAD_LETTER: Message moved to dead-letter queue"
    );
}

pub(crate) fn log_send_failure(
    backend: &str,
    queue_name: &str,
    info: &FailedMessageInfo,
    err: &DeadLetterError,
) {
    error!(
        backend = %backend,
        queue = %queue_name,
        message_id = %info.message_id,
        source_queue = %info.source_queue,
        original_failure = %info.failure_reason(),
        error = %err,
        "❌ DEAD_LETTER: Failed to persist dead-letter entry"
    );
}
