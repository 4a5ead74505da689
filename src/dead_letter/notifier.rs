//! # Administrator Notification
//!
//! Fire-and-forget side channel invoked after an entry has been persisted.
//! Dispatch runs on a detached task; a failed notification is logged with
//! `notification_failed = true` and never reaches the dead-letter caller.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, warn};
use uuid::Uuid;

use crate::dead_letter::envelope::FailedMessageInfo;

#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("Notification channel is full")]
    ChannelFull,

    #[error("Notification channel is closed")]
    ChannelClosed,

    #[error("Notification delivery failed: {message}")]
    Delivery { message: String },
}

/// Summary sent to administrators; the payload itself is never included
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminNotification {
    pub message_id: Uuid,
    pub queue_name: String,
    pub source_queue: String,
    pub message_type: String,
    pub handler_type: String,
    pub failure_reason: String,
    pub attempt_count: u32,
}

impl AdminNotification {
    pub fn from_envelope(queue_name: &str, info: &FailedMessageInfo) -> Self {
        Self {
            message_id: info.message_id,
            queue_name: queue_name.to_string(),
            source_queue: info.source_queue.clone(),
            message_type: info.message_type.clone(),
            handler_type: info.handler_type().to_string(),
            failure_reason: info.failure_reason().to_string(),
            attempt_count: info.attempt_count,
        }
    }
}

#[async_trait]
pub trait AdminNotifier: Send + Sync + std::fmt::Debug + 'static {
    async fn notify(&self, notification: &AdminNotification) -> Result<(), NotificationError>;
}

/// Error-level log line on the `dead_letter::admin` target
#[derive(Debug, Clone, Default)]
pub struct TracingNotifier;

#[async_trait]
impl AdminNotifier for TracingNotifier {
    async fn notify(&self, notification: &AdminNotification) -> Result<(), NotificationError> {
        error!(
            target: "dead_letter::admin",
            message_id = %notification.message_id,
            queue = %notification.queue_name,
            source_queue = %notification.source_queue,
            message_type = %notification.message_type,
            handler_type = %notification.handler_type,
            attempt_count = notification.attempt_count,
            reason = %notification.failure_reason,
            "🚨 ADMIN: Message dead-lettered"
        );
        Ok(())
    }
}

/// Bounded outbound queue drained by whatever alerting integration owns the receiver
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    sender: mpsc::Sender<AdminNotification>,
}

impl ChannelNotifier {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AdminNotification>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl AdminNotifier for ChannelNotifier {
    async fn notify(&self, notification: &AdminNotification) -> Result<(), NotificationError> {
        self.sender
            .try_send(notification.clone())
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => NotificationError::ChannelFull,
                mpsc::error::TrySendError::Closed(_) => NotificationError::ChannelClosed,
            })
    }
}

/// Spawns notifications off the caller's path when enabled
#[derive(Debug, Clone)]
pub struct NotificationDispatcher {
    enabled: bool,
    notifier: Arc<dyn AdminNotifier>,
}

impl NotificationDispatcher {
    pub fn new(enabled: bool, notifier: Arc<dyn AdminNotifier>) -> Self {
        Self { enabled, notifier }
    }

    pub fn disabled() -> Self {
        Self::new(false, Arc::new(TracingNotifier))
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Returns the spawned task handle so tests can wait for delivery
    pub fn dispatch(
        &self,
        queue_name: &str,
        info: &FailedMessageInfo,
    ) -> Option<tokio::task::JoinHandle<()>> {
        if !self.enabled {
            return None;
        }

        let notification = AdminNotification::from_envelope(queue_name, info);
        let notifier = Arc::clone(&self.notifier);

        Some(tokio::spawn(async move {
            if let Err(e) = notifier.notify(&notification).await {
                warn!(
                    notification_failed = true,
                    message_id = %notification.message_id,
                    queue = %notification.queue_name,
                    error = %e,
                    "⚠️ ADMIN: Administrator notification failed; dead-letter entry is persisted"
                );
            }
        }))
    }
}
