//! # Dead-Letter Subsystem
//!
//! Failure classification, bounded retry with exponential backoff, and the
//! dead-letter stores that park messages once retries are exhausted.
//!
//! ```rust,no_run
//! use dead_letter_core::config::ConfigManager;
//! use dead_letter_core::dead_letter::{create_dead_letter_service, DeadLetterService, HandlerFailure};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let store = create_dead_letter_service(&manager);
//!
//! let payload = serde_json::json!({"order_id": 42});
//! let failure = HandlerFailure::timeout("payment gateway");
//! let attempt = 3;
//!
//! if store.should_retry(&failure, attempt) {
//!     tokio::time::sleep(store.calculate_retry_delay(attempt)).await;
//! } else {
//!     store.send_failure(&payload, &failure, "OrderHandler", "orders", attempt).await?;
//! }
//! store.close().await;
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod classifier;
pub mod envelope;
pub mod notifier;
pub mod retry;
pub mod selector;
pub mod service;
pub mod store;
pub mod topology;

pub use backends::{
    InMemoryDeadLetterStore, NoOpDeadLetterStore, PgmqDeadLetterStore, RabbitMqDeadLetterStore,
};
pub use classifier::{
    ErrorClassifier, FailureCause, FailureKind, HandlerFailure, StandardFailureClassifier,
};
pub use envelope::{
    DeadLetterRequest, DeadLetterStatistics, EnvironmentMetadata, FailedMessageInfo,
    FailureAttempt,
};
pub use notifier::{
    AdminNotification, AdminNotifier, ChannelNotifier, NotificationDispatcher, NotificationError,
    TracingNotifier,
};
pub use retry::RetryPolicy;
pub use selector::{create_dead_letter_service, BackendKind, BackendSelector};
pub use service::{DeadLetterService, StoreContext};
pub use store::DeadLetterStore;
pub use topology::{DeadLetterHeaders, QueueTopology, ReprocessHeaders};
