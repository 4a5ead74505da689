//! Concrete dead-letter store implementations.

pub mod in_memory;
pub mod noop;
pub mod pgmq;
pub mod rabbitmq;

pub use in_memory::{InMemoryDeadLetterStore, RepublishedMessage, StoredEntry};
pub use noop::NoOpDeadLetterStore;
pub use pgmq::{pgmq_queue_name, PgmqDeadLetterStore};
pub use rabbitmq::RabbitMqDeadLetterStore;
