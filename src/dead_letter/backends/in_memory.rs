//! # In-Memory Dead-Letter Store
//!
//! Process-local implementation of the full contract. Used as the stub broker
//! in tests and for running without infrastructure. Messages republished by
//! reprocessing are captured per source queue so callers can inspect them.
//!
//! `set_unavailable(true)` makes every broker call fail with
//! [`MessagingError::Unavailable`], which is how tests exercise the
//! infrastructure-failure paths.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::dead_letter::envelope::{DeadLetterRequest, DeadLetterStatistics, FailedMessageInfo};
use crate::dead_letter::service::{log_dead_lettered, log_send_failure, DeadLetterService, StoreContext};
use crate::dead_letter::topology::{DeadLetterHeaders, ReprocessHeaders};
use crate::error::{DeadLetterError, DeadLetterResult};
use crate::messaging::MessagingError;

const BACKEND: &str = "in_memory";

/// One stored dead-letter message as a broker would hold it
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub body: Vec<u8>,
    pub message_id: Uuid,
    pub headers: Value,
    pub routing_key: String,
    pub enqueued_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A payload republished to its source queue by reprocessing
#[derive(Debug, Clone, PartialEq)]
pub struct RepublishedMessage {
    pub source_queue: String,
    pub body: String,
    pub headers: Value,
    pub correlation_id: Uuid,
}

#[derive(Debug, Default)]
struct InMemoryState {
    queues: HashMap<String, VecDeque<StoredEntry>>,
    source_queues: HashMap<String, Vec<RepublishedMessage>>,
    declared: HashSet<String>,
}

impl InMemoryState {
    fn prune_expired(&mut self, queue_name: &str, now: DateTime<Utc>) {
        if let Some(queue) = self.queues.get_mut(queue_name) {
            let before = queue.len();
            queue.retain(|entry| entry.expires_at.map_or(true, |at| at > now));
            let expired = before - queue.len();
            if expired > 0 {
                debug!(queue = %queue_name, expired, "Expired dead-letter entries dropped");
            }
        }
    }

    /// Position of the entry with `message_id`
    fn position_of(&self, queue_name: &str, message_id: Uuid) -> Option<usize> {
        self.queues
            .get(queue_name)?
            .iter()
            .position(|entry| entry.message_id == message_id)
    }
}

#[derive(Debug)]
pub struct InMemoryDeadLetterStore {
    context: StoreContext,
    state: Arc<Mutex<InMemoryState>>,
    unavailable: AtomicBool,
}

impl InMemoryDeadLetterStore {
    pub fn new(context: StoreContext) -> Self {
        Self {
            context,
            state: Arc::new(Mutex::new(InMemoryState::default())),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Simulate a broker outage
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Messages republished to `source_queue`, oldest first
    pub fn republished(&self, source_queue: &str) -> Vec<RepublishedMessage> {
        self.state
            .lock()
            .source_queues
            .get(source_queue)
            .cloned()
            .unwrap_or_default()
    }

    /// Raw entries currently held for a dead-letter queue
    pub fn raw_entries(&self, queue_name: &str) -> Vec<StoredEntry> {
        let queue_name = self.context.topology.resolve_queue_name(queue_name);
        self.state
            .lock()
            .queues
            .get(&queue_name)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Push an arbitrary body, e.g. one written by another producer
    pub fn inject_raw(&self, queue_name: &str, body: Vec<u8>) -> Uuid {
        let queue_name = self.context.topology.resolve_queue_name(queue_name);
        let message_id = Uuid::new_v4();
        self.state
            .lock()
            .queues
            .entry(queue_name.clone())
            .or_default()
            .push_back(StoredEntry {
                body,
                message_id,
                headers: Value::Null,
                routing_key: queue_name,
                enqueued_at: Utc::now(),
                expires_at: None,
            });
        message_id
    }

    pub fn is_declared(&self, source_queue: &str) -> bool {
        self.state
            .lock()
            .declared
            .contains(&self.context.topology.queue_name(source_queue))
    }

    fn check_available(&self) -> Result<(), MessagingError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(MessagingError::unavailable(BACKEND, "simulated broker outage"));
        }
        Ok(())
    }

    /// Find and remove one entry; undecodable matches are still removed
    fn take_entry(&self, queue_name: &str, message_id: Uuid) -> Option<(usize, StoredEntry)> {
        let mut state = self.state.lock();
        state.prune_expired(queue_name, Utc::now());
        let position = state.position_of(queue_name, message_id)?;
        let entry = state.queues.get_mut(queue_name)?.remove(position)?;
        Some((position, entry))
    }
}

#[async_trait]
impl DeadLetterService for InMemoryDeadLetterStore {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    fn context(&self) -> &StoreContext {
        &self.context
    }

    fn supports_expiry(&self) -> bool {
        true
    }

    async fn ensure_topology(&self, source_queue: &str) -> DeadLetterResult<()> {
        self.check_available()?;
        let queue_name = self.context.topology.queue_name(source_queue);
        let mut state = self.state.lock();
        if state.declared.insert(queue_name.clone()) {
            state.queues.entry(queue_name.clone()).or_default();
            debug!(queue = %queue_name, "In-memory dead-letter queue declared");
        }
        Ok(())
    }

    #[instrument(skip(self, request), fields(source_queue = %request.source_queue))]
    async fn send_to_dead_letter(
        &self,
        request: DeadLetterRequest,
    ) -> DeadLetterResult<FailedMessageInfo> {
        let info = self.context.build_envelope(request);
        let queue_name = self.context.topology.queue_name(&info.source_queue);

        let result = async {
            self.ensure_topology(&info.source_queue).await?;
            self.check_available()?;
            let body = info.to_bytes()?;
            let now = Utc::now();
            let expires_at = self
                .context
                .topology
                .ttl()
                .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
                .map(|ttl| now + ttl);

            self.state
                .lock()
                .queues
                .entry(queue_name.clone())
                .or_default()
                .push_back(StoredEntry {
                    body,
                    message_id: info.message_id,
                    headers: DeadLetterHeaders::from_envelope(&info).to_json(),
                    routing_key: self.context.topology.routing_key(&info.source_queue),
                    enqueued_at: now,
                    expires_at,
                });
            Ok::<(), DeadLetterError>(())
        }
        .await;

        if let Err(e) = result {
            log_send_failure(BACKEND, &queue_name, &info, &e);
            return Err(e);
        }

        log_dead_lettered(BACKEND, &queue_name, &info);
        self.context.notifications.dispatch(&queue_name, &info);
        Ok(info)
    }

    async fn list_dead_letter_messages(
        &self,
        queue_name: &str,
        max_count: usize,
    ) -> DeadLetterResult<Vec<FailedMessageInfo>> {
        self.check_available()?;
        let queue_name = self.context.topology.resolve_queue_name(queue_name);
        let limit = self.context.browse_count(max_count);

        let mut state = self.state.lock();
        state.prune_expired(&queue_name, Utc::now());

        let Some(queue) = state.queues.get(&queue_name) else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::with_capacity(limit.min(queue.len()));
        for entry in queue.iter().take(limit) {
            match FailedMessageInfo::from_bytes(&entry.body) {
                Ok(info) => entries.push(info),
                Err(e) => warn!(
                    queue = %queue_name,
                    message_id = %entry.message_id,
                    error = %e,
                    "⚠️ DEAD_LETTER: Skipping undecodable entry during browse"
                ),
            }
        }
        Ok(entries)
    }

    #[instrument(skip(self), fields(backend = BACKEND))]
    async fn reprocess_dead_letter_message(
        &self,
        queue_name: &str,
        message_id: Uuid,
    ) -> DeadLetterResult<bool> {
        self.check_available()?;
        let queue_name = self.context.topology.resolve_queue_name(queue_name);

        let Some((position, entry)) = self.take_entry(&queue_name, message_id) else {
            info!(queue = %queue_name, message_id = %message_id, "Reprocess found no matching entry");
            return Ok(false);
        };

        let info = match FailedMessageInfo::from_bytes(&entry.body) {
            Ok(info) => info,
            Err(e) => {
                let mut state = self.state.lock();
                let queue = state.queues.entry(queue_name.clone()).or_default();
                queue.insert(position.min(queue.len()), entry);
                return Err(e);
            }
        };

        let headers = ReprocessHeaders::new(info.message_id, Utc::now());
        self.state
            .lock()
            .source_queues
            .entry(info.source_queue.clone())
            .or_default()
            .push(RepublishedMessage {
                source_queue: info.source_queue.clone(),
                body: info.original_message.clone(),
                headers: headers.to_json(),
                correlation_id: headers.correlation_id,
            });

        info!(
            queue = %queue_name,
            message_id = %message_id,
            source_queue = %info.source_queue,
            correlation_id = %headers.correlation_id,
            "♻️ DEAD_LETTER: Message reprocessed to source queue"
        );
        Ok(true)
    }

    #[instrument(skip(self), fields(backend = BACKEND))]
    async fn purge_dead_letter_message(
        &self,
        queue_name: &str,
        message_id: Uuid,
    ) -> DeadLetterResult<bool> {
        self.check_available()?;
        let queue_name = self.context.topology.resolve_queue_name(queue_name);

        let purged = self.take_entry(&queue_name, message_id).is_some();
        if purged {
            info!(queue = %queue_name, message_id = %message_id, "🗑️ DEAD_LETTER: Message purged");
        } else {
            info!(queue = %queue_name, message_id = %message_id, "Purge found no matching entry");
        }
        Ok(purged)
    }

    async fn get_dead_letter_statistics(&self) -> DeadLetterResult<DeadLetterStatistics> {
        let mut stats = DeadLetterStatistics::new();
        let now = Utc::now();

        for queue_name in self.known_queues() {
            if let Err(e) = self.check_available() {
                warn!(queue = %queue_name, error = %e, "⚠️ DEAD_LETTER: Skipping queue in statistics");
                stats.record_unavailable(queue_name);
                continue;
            }
            let mut state = self.state.lock();
            state.prune_expired(&queue_name, now);
            let depth = state.queues.get(&queue_name).map_or(0, |q| q.len() as u64);
            stats.record(queue_name, depth);
        }

        Ok(stats)
    }

    async fn health_check(&self) -> DeadLetterResult<bool> {
        Ok(!self.unavailable.load(Ordering::SeqCst))
    }

    async fn close(&self) {
        debug!(backend = BACKEND, "In-memory dead-letter store closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeadLetterConfig;
    use crate::dead_letter::classifier::HandlerFailure;
    use crate::environment::RuntimeEnvironment;

    fn store() -> InMemoryDeadLetterStore {
        let mut config = DeadLetterConfig::default();
        config.dead_letter.source_queues = vec!["orders".into()];
        InMemoryDeadLetterStore::new(StoreContext::from_config(&config, RuntimeEnvironment::Test))
    }

    fn request(order_id: u64) -> DeadLetterRequest {
        DeadLetterRequest::new(
            &serde_json::json!({ "order_id": order_id }),
            &HandlerFailure::validation("missing customer"),
            "OrderHandler",
            "orders",
            2,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn send_declares_topology_and_stores_headers() {
        let store = store();
        let info = store.send_to_dead_letter(request(1)).await.unwrap();

        assert!(store.is_declared("orders"));
        let raw = store.raw_entries("orders");
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].message_id, info.message_id);
        assert_eq!(raw[0].routing_key, "deadletter.orders");
        assert_eq!(raw[0].headers["attempt-count"], 2);
        assert_eq!(raw[0].headers["source-queue"], "orders");
        assert!(raw[0].expires_at.is_some());
    }

    #[tokio::test]
    async fn send_failure_is_returned() {
        let store = store();
        store.set_unavailable(true);
        let err = store.send_to_dead_letter(request(1)).await.unwrap_err();
        assert!(err.is_infrastructure());
    }

    #[tokio::test]
    async fn list_skips_undecodable_entries() {
        let store = store();
        store.send_to_dead_letter(request(1)).await.unwrap();
        store.inject_raw("orders", b"not an envelope".to_vec());
        store.send_to_dead_letter(request(2)).await.unwrap();

        let listed = store.list_dead_letter_messages("orders", 10).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(store.raw_entries("dlq.orders").len(), 3);
    }

    #[tokio::test]
    async fn purge_removes_undecodable_entry_by_id() {
        let store = store();
        let id = store.inject_raw("orders", b"garbage".to_vec());
        assert!(store.purge_dead_letter_message("orders", id).await.unwrap());
        assert!(store.raw_entries("orders").is_empty());
    }

    #[tokio::test]
    async fn reprocess_of_undecodable_entry_restores_it() {
        let store = store();
        let id = store.inject_raw("orders", b"garbage".to_vec());
        assert!(store.reprocess_dead_letter_message("orders", id).await.is_err());
        assert_eq!(store.raw_entries("orders").len(), 1);
    }

    #[tokio::test]
    async fn statistics_skip_unavailable_queues() {
        let store = store();
        store.set_unavailable(true);
        let stats = store.get_dead_letter_statistics().await.unwrap();
        assert_eq!(stats.total_dead_letter_messages, 0);
        assert_eq!(stats.unavailable_queues, vec!["dlq.orders", "dlq.default"]);
    }
}
