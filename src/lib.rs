#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, RabbitMQ in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Dead-Letter Core
//!
//! Failure-aware message delivery for asynchronous handlers: decide whether a
//! failed handler should be retried, compute the backoff, and once retries
//! are exhausted park the message with its failure history in a durable
//! dead-letter queue that operators can list, reprocess or purge.
//!
//! ## Backends
//!
//! | Environment | Backend |
//! |-------------|---------|
//! | development, test | RabbitMQ (`lapin`) |
//! | staging, production | PGMQ on PostgreSQL (`pgmq` + `sqlx`) |
//! | persistence disabled | no-op, logging only |
//!
//! An in-memory store implements the same contract for tests and embedded use.
//!
//! ## Module Organization
//!
//! - [`dead_letter`] - classifier, retry policy, envelope, stores, selector
//! - [`config`] - YAML configuration with environment overrides
//! - [`environment`] - runtime environment detection
//! - [`messaging`] - broker infrastructure errors
//! - [`logging`] - structured logging setup
//! - [`error`] - crate error type
//!
//! ## Testing
//!
//! ```bash
//! cargo test                        # unit + in-memory integration tests
//! cargo test -- --ignored           # broker-backed tests (RabbitMQ / PostgreSQL)
//! ```

pub mod config;
pub mod dead_letter;
pub mod environment;
pub mod error;
pub mod logging;
pub mod messaging;

pub use config::{ConfigManager, DeadLetterConfig};
pub use dead_letter::{
    create_dead_letter_service, BackendKind, BackendSelector, DeadLetterRequest,
    DeadLetterService, DeadLetterStatistics, DeadLetterStore, FailedMessageInfo, FailureKind,
    HandlerFailure, RetryPolicy,
};
pub use environment::RuntimeEnvironment;
pub use error::{DeadLetterError, DeadLetterResult};
pub use messaging::MessagingError;
