//! # RabbitMQ Dead-Letter Store
//!
//! Local/self-hosted broker backend using the `lapin` crate (AMQP 0.9.1).
//!
//! ## Topology
//!
//! | Item | Declaration |
//! |------|-------------|
//! | exchange | `exchange_name`, topic, durable |
//! | queue | `<queue_prefix>.<source>`, durable, `x-message-ttl` in ms |
//! | binding | routing key `<routing_key_prefix>.<source>` |
//!
//! Messages are persistent (`delivery_mode = 2`) and carry `message_id`,
//! `timestamp`, `expiration` and the dead-letter headers.
//!
//! ## Session model
//!
//! Each store owns one connection and one channel, opened on first use under
//! the session mutex and reopened when the broker drops them. Every channel
//! operation happens while that mutex is held, so concurrent callers are
//! serialized per store. The guard is moved into a spawned task for the
//! duration of the round trips: a caller that gives up stops waiting, but a
//! browse, ack or nack that has started always runs to the end.
//!
//! ## Browse and lookup
//!
//! Entries are fetched with `basic.get` (manual ack) and handed back with a
//! single `basic.nack(multiple, requeue)`, which returns them to their
//! original positions. Reprocess and purge scan up to the queue depth for
//! the requested id, ack only the match and requeue everything else.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashSet;
use lapin::options::{
    BasicAckOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions, ConfirmSelectOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::loader::redact_url;
use crate::config::RabbitMqConfig;
use crate::dead_letter::envelope::{DeadLetterRequest, DeadLetterStatistics, FailedMessageInfo};
use crate::dead_letter::service::{
    log_dead_lettered, log_send_failure, run_to_completion, DeadLetterService, StoreContext,
};
use crate::dead_letter::topology::{
    DeadLetterHeaders, QueueTopology, ReprocessHeaders, CONTENT_TYPE_JSON,
    HEADER_ATTEMPT_COUNT, HEADER_FAILED_AT, HEADER_FAILURE_REASON, HEADER_HANDLER_TYPE,
    HEADER_ORIGINAL_MESSAGE_ID, HEADER_ORIGINAL_MESSAGE_TYPE, HEADER_REPROCESSED_AT,
    HEADER_REPROCESSED_FROM_DLQ, HEADER_SOURCE_QUEUE,
};
use crate::error::{DeadLetterError, DeadLetterResult};
use crate::messaging::MessagingError;

const BACKEND: &str = "rabbitmq";
const PERSISTENT: u8 = 2;

struct AmqpSession {
    connection: Connection,
    channel: Channel,
}

impl std::fmt::Debug for AmqpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpSession")
            .field("connected", &self.is_open())
            .finish()
    }
}

impl AmqpSession {
    async fn open(config: &RabbitMqConfig) -> Result<Self, MessagingError> {
        let timeout = Duration::from_secs(config.connection_timeout_seconds.max(1));

        let connection = tokio::time::timeout(
            timeout,
            Connection::connect(
                &config.url,
                ConnectionProperties::default()
                    .with_connection_name(config.connection_name.clone().into()),
            ),
        )
        .await
        .map_err(|_| MessagingError::timeout("rabbitmq connect", timeout.as_secs()))?
        .map_err(|e| MessagingError::connection(format!("RabbitMQ connection failed: {e}")))?;

        let channel = open_channel(&connection).await?;

        info!(
            url = %redact_url(&config.url),
            connection_name = %config.connection_name,
            "🐇 RABBITMQ: Dead-letter connection established"
        );

        Ok(Self {
            connection,
            channel,
        })
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    /// Replace a channel the broker closed (e.g. after a 404 on passive declare)
    async fn ensure_channel(&mut self) -> Result<(), MessagingError> {
        if !self.channel.status().connected() {
            debug!("Reopening RabbitMQ channel");
            self.channel = open_channel(&self.connection).await?;
        }
        Ok(())
    }
}

async fn open_channel(connection: &Connection) -> Result<Channel, MessagingError> {
    let channel = connection
        .create_channel()
        .await
        .map_err(|e| MessagingError::connection(format!("RabbitMQ channel creation failed: {e}")))?;

    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await
        .map_err(|e| {
            MessagingError::configuration("rabbitmq", format!("Failed to enable publisher confirms: {e}"))
        })?;

    Ok(channel)
}

type SessionGuard = OwnedMutexGuard<Option<AmqpSession>>;

fn session_mut(guard: &mut SessionGuard) -> Result<&mut AmqpSession, MessagingError> {
    guard
        .as_mut()
        .ok_or_else(|| MessagingError::connection("RabbitMQ session not established"))
}

#[derive(Debug)]
pub struct RabbitMqDeadLetterStore {
    context: StoreContext,
    config: RabbitMqConfig,
    session: Arc<Mutex<Option<AmqpSession>>>,
    declared: Arc<DashSet<String>>,
}

impl RabbitMqDeadLetterStore {
    /// No connection is made until the first operation
    pub fn new(context: StoreContext, config: RabbitMqConfig) -> Self {
        Self {
            context,
            config,
            session: Arc::new(Mutex::new(None)),
            declared: Arc::new(DashSet::new()),
        }
    }

    pub fn connection_url_redacted(&self) -> String {
        redact_url(&self.config.url)
    }

    pub async fn is_connected(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(AmqpSession::is_open)
    }

    /// Lock the session, opening or replacing it when needed
    async fn acquire(&self) -> Result<SessionGuard, MessagingError> {
        let mut guard = Arc::clone(&self.session).lock_owned().await;

        let reusable = match guard.as_mut() {
            Some(session) if session.connection.status().connected() => {
                session.ensure_channel().await.is_ok()
            }
            _ => false,
        };

        if !reusable {
            if guard.take().is_some() {
                warn!(
                    url = %self.connection_url_redacted(),
                    "⚠️ RABBITMQ: Dead-letter session lost, reconnecting"
                );
            }
            *guard = Some(AmqpSession::open(&self.config).await?);
        }

        Ok(guard)
    }
}

#[async_trait]
impl DeadLetterService for RabbitMqDeadLetterStore {
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
        if self.declared.contains(source_queue) {
            return Ok(());
        }

        let mut guard = self.acquire().await?;
        let topology = self.context.topology.clone();
        let declared = Arc::clone(&self.declared);
        let source_queue = source_queue.to_string();

        run_to_completion("ensure_topology", async move {
            let session = session_mut(&mut guard)?;
            declare_topology(&session.channel, &topology, &declared, &source_queue).await?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self, request), fields(source_queue = %request.source_queue))]
    async fn send_to_dead_letter(
        &self,
        request: DeadLetterRequest,
    ) -> DeadLetterResult<FailedMessageInfo> {
        let info = self.context.build_envelope(request);
        let queue_name = self.context.topology.queue_name(&info.source_queue);

        let result = match self.acquire().await {
            Ok(mut guard) => {
                let topology = self.context.topology.clone();
                let declared = Arc::clone(&self.declared);
                let envelope = info.clone();

                run_to_completion("send_to_dead_letter", async move {
                    let session = session_mut(&mut guard)?;
                    declare_topology(&session.channel, &topology, &declared, &envelope.source_queue)
                        .await?;
                    publish_envelope(&session.channel, &topology, &envelope).await?;
                    Ok(())
                })
                .await
            }
            Err(e) => Err(DeadLetterError::from(e)),
        };

        if let Err(e) = result {
            log_send_failure(BACKEND, &queue_name, &info, &e);
            return Err(e);
        }

        log_dead_lettered(BACKEND, &queue_name, &info);
        self.context.notifications.dispatch(&queue_name, &info);
        Ok(info)
    }

    #[instrument(skip(self), fields(backend = BACKEND))]
    async fn list_dead_letter_messages(
        &self,
        queue_name: &str,
        max_count: usize,
    ) -> DeadLetterResult<Vec<FailedMessageInfo>> {
        let queue_name = self.context.topology.resolve_queue_name(queue_name);
        let limit = self.context.browse_count(max_count);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut guard = self.acquire().await?;

        run_to_completion("list_dead_letter_messages", async move {
            let session = session_mut(&mut guard)?;
            let mut entries = Vec::new();
            let mut last_tag = None;

            let depth = match queue_depth(&session.channel, &queue_name).await {
                Ok(depth) => depth as usize,
                Err(MessagingError::QueueNotFound { .. }) => return Ok(entries),
                Err(e) => return Err(e.into()),
            };

            let outcome = async {
                for _ in 0..limit.min(depth) {
                    let Some(message) = session
                        .channel
                        .basic_get(&queue_name, BasicGetOptions { no_ack: false })
                        .await
                        .map_err(|e| MessagingError::receive(&queue_name, format!("basic_get failed: {e}")))?
                    else {
                        break;
                    };

                    last_tag = Some(message.delivery.delivery_tag);
                    match FailedMessageInfo::from_bytes(&message.delivery.data) {
                        Ok(info) => entries.push(info),
                        Err(e) => warn!(
                            queue = %queue_name,
                            delivery_tag = message.delivery.delivery_tag,
                            error = %e,
                            "⚠️ DEAD_LETTER: Skipping undecodable entry during browse"
                        ),
                    }
                }
                Ok::<(), MessagingError>(())
            }
            .await;

            requeue_through(&session.channel, &queue_name, last_tag).await?;
            outcome?;
            Ok(entries)
        })
        .await
    }

    #[instrument(skip(self), fields(backend = BACKEND))]
    async fn reprocess_dead_letter_message(
        &self,
        queue_name: &str,
        message_id: Uuid,
    ) -> DeadLetterResult<bool> {
        let queue_name = self.context.topology.resolve_queue_name(queue_name);
        let scan_limit = self.context.browse_limit;
        let mut guard = self.acquire().await?;

        run_to_completion("reprocess_dead_letter_message", async move {
            let session = session_mut(&mut guard)?;
            let channel = &session.channel;

            let located = locate(channel, &queue_name, message_id, scan_limit).await?;
            let Some((tag, info)) = located.matched else {
                requeue_through(channel, &queue_name, located.last_other).await?;
                info!(queue = %queue_name, message_id = %message_id, "Reprocess found no matching entry");
                return Ok(false);
            };

            let headers = ReprocessHeaders::new(info.message_id, Utc::now());
            if let Err(e) = publish_reprocessed(channel, &info, &headers).await {
                error!(
                    queue = %queue_name,
                    message_id = %message_id,
                    source_queue = %info.source_queue,
                    error = %e,
                    "❌ DEAD_LETTER: Republish failed; entry returned to dead-letter queue"
                );
                requeue_through(channel, &queue_name, Some(tag)).await?;
                return Err(e.into());
            }

            channel
                .basic_ack(tag, BasicAckOptions::default())
                .await
                .map_err(|e| MessagingError::ack(&queue_name, tag, e.to_string()))?;
            requeue_through(channel, &queue_name, located.last_other).await?;

            info!(
                queue = %queue_name,
                message_id = %message_id,
                source_queue = %info.source_queue,
                correlation_id = %headers.correlation_id,
                "♻️ DEAD_LETTER: Message reprocessed to source queue"
            );
            Ok(true)
        })
        .await
    }

    #[instrument(skip(self), fields(backend = BACKEND))]
    async fn purge_dead_letter_message(
        &self,
        queue_name: &str,
        message_id: Uuid,
    ) -> DeadLetterResult<bool> {
        let queue_name = self.context.topology.resolve_queue_name(queue_name);
        let scan_limit = self.context.browse_limit;
        let mut guard = self.acquire().await?;

        run_to_completion("purge_dead_letter_message", async move {
            let session = session_mut(&mut guard)?;
            let channel = &session.channel;

            let located = locate(channel, &queue_name, message_id, scan_limit).await?;
            let Some((tag, _)) = located.matched else {
                requeue_through(channel, &queue_name, located.last_other).await?;
                info!(queue = %queue_name, message_id = %message_id, "Purge found no matching entry");
                return Ok(false);
            };

            channel
                .basic_ack(tag, BasicAckOptions::default())
                .await
                .map_err(|e| MessagingError::ack(&queue_name, tag, e.to_string()))?;
            requeue_through(channel, &queue_name, located.last_other).await?;

            info!(queue = %queue_name, message_id = %message_id, "🗑️ DEAD_LETTER: Message purged");
            Ok(true)
        })
        .await
    }

    async fn get_dead_letter_statistics(&self) -> DeadLetterResult<DeadLetterStatistics> {
        let queues = self.known_queues();
        let mut guard = self.acquire().await?;

        run_to_completion("get_dead_letter_statistics", async move {
            let session = session_mut(&mut guard)?;
            let mut stats = DeadLetterStatistics::new();

            for queue_name in queues {
                let depth = match session.ensure_channel().await {
                    Ok(()) => queue_depth(&session.channel, &queue_name).await,
                    Err(e) => Err(e),
                };
                match depth {
                    Ok(depth) => stats.record(queue_name, depth),
                    Err(MessagingError::QueueNotFound { .. }) => stats.record(queue_name, 0),
                    Err(e) => {
                        warn!(queue = %queue_name, error = %e, "⚠️ DEAD_LETTER: Skipping queue in statistics");
                        stats.record_unavailable(queue_name);
                    }
                }
            }

            Ok(stats)
        })
        .await
    }

    async fn health_check(&self) -> DeadLetterResult<bool> {
        match self.acquire().await {
            Ok(guard) => Ok(guard.as_ref().is_some_and(AmqpSession::is_open)),
            Err(e) => {
                warn!(url = %self.connection_url_redacted(), error = %e, "RabbitMQ health check failed");
                Ok(false)
            }
        }
    }

    async fn close(&self) {
        let Some(session) = self.session.lock().await.take() else {
            return;
        };

        if let Err(e) = session.channel.close(200, "closing").await {
            warn!(error = %e, "Failed to close RabbitMQ channel cleanly");
        }
        if let Err(e) = session.connection.close(200, "closing").await {
            warn!(error = %e, "Failed to close RabbitMQ connection cleanly");
        }
        info!(url = %self.connection_url_redacted(), "🐇 RABBITMQ: Dead-letter connection closed");
    }
}

async fn declare_topology(
    channel: &Channel,
    topology: &QueueTopology,
    declared: &DashSet<String>,
    source_queue: &str,
) -> Result<(), MessagingError> {
    if declared.contains(source_queue) {
        return Ok(());
    }

    let exchange = topology.exchange_name();
    let queue_name = topology.queue_name(source_queue);
    let routing_key = topology.routing_key(source_queue);

    channel
        .exchange_declare(
            exchange,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| MessagingError::queue_creation(exchange, format!("Exchange declare failed: {e}")))?;

    let mut args = FieldTable::default();
    if let Some(ttl_ms) = topology.ttl_millis() {
        args.insert("x-message-ttl".into(), AMQPValue::LongLongInt(ttl_ms as i64));
    }

    channel
        .queue_declare(
            &queue_name,
            QueueDeclareOptions {
                durable: true,
                exclusive: false,
                auto_delete: false,
                ..Default::default()
            },
            args,
        )
        .await
        .map_err(|e| MessagingError::queue_creation(&queue_name, format!("Queue declare failed: {e}")))?;

    channel
        .queue_bind(
            &queue_name,
            exchange,
            &routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| MessagingError::queue_creation(&queue_name, format!("Queue bind failed: {e}")))?;

    declared.insert(source_queue.to_string());
    debug!(queue = %queue_name, routing_key = %routing_key, "Dead-letter topology declared");
    Ok(())
}

fn dead_letter_headers(headers: &DeadLetterHeaders) -> FieldTable {
    let mut table = FieldTable::default();
    table.insert(
        HEADER_ORIGINAL_MESSAGE_TYPE.into(),
        AMQPValue::LongString(headers.original_message_type.clone().into()),
    );
    table.insert(
        HEADER_FAILURE_REASON.into(),
        AMQPValue::LongString(headers.failure_reason.clone().into()),
    );
    table.insert(
        HEADER_ATTEMPT_COUNT.into(),
        AMQPValue::LongLongInt(i64::from(headers.attempt_count)),
    );
    table.insert(
        HEADER_SOURCE_QUEUE.into(),
        AMQPValue::LongString(headers.source_queue.clone().into()),
    );
    table.insert(
        HEADER_HANDLER_TYPE.into(),
        AMQPValue::LongString(headers.handler_type.clone().into()),
    );
    table.insert(
        HEADER_FAILED_AT.into(),
        AMQPValue::LongString(headers.failed_at.clone().into()),
    );
    table
}

fn reprocess_headers(headers: &ReprocessHeaders) -> FieldTable {
    let mut table = FieldTable::default();
    table.insert(HEADER_REPROCESSED_FROM_DLQ.into(), AMQPValue::Boolean(true));
    table.insert(
        HEADER_ORIGINAL_MESSAGE_ID.into(),
        AMQPValue::LongString(headers.original_message_id.to_string().into()),
    );
    table.insert(
        HEADER_REPROCESSED_AT.into(),
        AMQPValue::LongString(headers.reprocessed_at.clone().into()),
    );
    table
}

async fn publish_envelope(
    channel: &Channel,
    topology: &QueueTopology,
    info: &FailedMessageInfo,
) -> DeadLetterResult<()> {
    let queue_name = topology.queue_name(&info.source_queue);
    let body = info.to_bytes()?;

    let mut properties = BasicProperties::default()
        .with_delivery_mode(PERSISTENT)
        .with_content_type(CONTENT_TYPE_JSON.into())
        .with_message_id(info.message_id.to_string().into())
        .with_type(short_string_value(&info.message_type).into())
        .with_timestamp(info.last_attempt_at.timestamp().max(0) as u64)
        .with_headers(dead_letter_headers(&DeadLetterHeaders::from_envelope(info)));
    if let Some(ttl_ms) = topology.ttl_millis() {
        properties = properties.with_expiration(ttl_ms.to_string().into());
    }

    let confirmation = channel
        .basic_publish(
            topology.exchange_name(),
            &topology.routing_key(&info.source_queue),
            BasicPublishOptions {
                mandatory: true,
                ..Default::default()
            },
            &body,
            properties,
        )
        .await
        .map_err(|e| MessagingError::send(&queue_name, format!("Publish failed: {e}")))?
        .await
        .map_err(|e| MessagingError::send(&queue_name, format!("Publish confirmation failed: {e}")))?;

    check_confirmation(&queue_name, confirmation)?;
    Ok(())
}

/// AMQP short strings are limited to 255 bytes
fn short_string_value(value: &str) -> String {
    const MAX: usize = 255;
    if value.len() <= MAX {
        return value.to_string();
    }
    let mut end = MAX;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}

/// Republish the original payload to its source queue via the default exchange
async fn publish_reprocessed(
    channel: &Channel,
    info: &FailedMessageInfo,
    headers: &ReprocessHeaders,
) -> Result<(), MessagingError> {
    let properties = BasicProperties::default()
        .with_delivery_mode(PERSISTENT)
        .with_content_type(CONTENT_TYPE_JSON.into())
        .with_correlation_id(headers.correlation_id.to_string().into())
        .with_timestamp(Utc::now().timestamp().max(0) as u64)
        .with_headers(reprocess_headers(headers));

    let confirmation = channel
        .basic_publish(
            "",
            &info.source_queue,
            BasicPublishOptions {
                mandatory: true,
                ..Default::default()
            },
            info.original_message.as_bytes(),
            properties,
        )
        .await
        .map_err(|e| MessagingError::send(&info.source_queue, format!("Republish failed: {e}")))?
        .await
        .map_err(|e| {
            MessagingError::send(&info.source_queue, format!("Republish confirmation failed: {e}"))
        })?;

    check_confirmation(&info.source_queue, confirmation)
}

/// A returned (unroutable) or nacked publish is a failure
fn check_confirmation(queue_name: &str, confirmation: Confirmation) -> Result<(), MessagingError> {
    match confirmation {
        Confirmation::Ack(None) | Confirmation::NotRequested => Ok(()),
        Confirmation::Ack(Some(_)) => Err(MessagingError::send(
            queue_name,
            "message was returned as unroutable",
        )),
        Confirmation::Nack(_) => Err(MessagingError::publish_not_confirmed(queue_name)),
    }
}

#[derive(Debug, Default)]
struct Located {
    matched: Option<(u64, FailedMessageInfo)>,
    /// Highest delivery tag fetched before the match, still unacknowledged
    last_other: Option<u64>,
}

/// Fetch entries until `message_id` is found, the queue is exhausted or
/// `scan_limit` entries have been inspected
async fn locate(
    channel: &Channel,
    queue_name: &str,
    message_id: Uuid,
    scan_limit: usize,
) -> Result<Located, MessagingError> {
    let depth = match queue_depth(channel, queue_name).await {
        Ok(depth) => depth,
        Err(MessagingError::QueueNotFound { .. }) => return Ok(Located::default()),
        Err(e) => return Err(e),
    };
    let scan = (depth as usize).min(scan_limit);
    let mut located = Located::default();

    for _ in 0..scan {
        let fetched = channel
            .basic_get(queue_name, BasicGetOptions { no_ack: false })
            .await;

        let message = match fetched {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(e) => {
                requeue_through(channel, queue_name, located.last_other).await?;
                return Err(MessagingError::receive(queue_name, format!("basic_get failed: {e}")));
            }
        };

        let tag = message.delivery.delivery_tag;
        match FailedMessageInfo::from_bytes(&message.delivery.data) {
            Ok(info) if info.message_id == message_id => {
                located.matched = Some((tag, info));
                break;
            }
            Ok(_) => {}
            Err(e) => debug!(queue = %queue_name, delivery_tag = tag, error = %e, "Undecodable entry skipped during lookup"),
        }
        located.last_other = Some(tag);
    }

    Ok(located)
}

/// Return every unacknowledged delivery up to `last_tag` to the queue
async fn requeue_through(
    channel: &Channel,
    queue_name: &str,
    last_tag: Option<u64>,
) -> Result<(), MessagingError> {
    let Some(tag) = last_tag else {
        return Ok(());
    };

    channel
        .basic_nack(
            tag,
            BasicNackOptions {
                multiple: true,
                requeue: true,
            },
        )
        .await
        .map_err(|e| MessagingError::nack(queue_name, tag, e.to_string()))
}

async fn queue_depth(channel: &Channel, queue_name: &str) -> Result<u64, MessagingError> {
    let queue = channel
        .queue_declare(
            queue_name,
            QueueDeclareOptions {
                passive: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| {
            let message = e.to_string();
            if message.contains("NOT_FOUND") || message.contains("404") {
                MessagingError::queue_not_found(queue_name)
            } else {
                MessagingError::queue_stats(queue_name, message)
            }
        })?;

    Ok(u64::from(queue.message_count()))
}
