//! # Messaging
//!
//! Broker-level error types shared by the dead-letter backends.

pub mod errors;

pub use errors::MessagingError;
