//! # Structured Logging Module
//!
//! Environment-aware structured logging. Console output is human-readable in
//! development and test, JSON in staging and production. Setting
//! `DEAD_LETTER_LOG_DIR` adds a JSON file sink.

use std::path::PathBuf;
use std::process;
use std::sync::OnceLock;

use chrono::Utc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::environment::RuntimeEnvironment;

static LOGGER_INITIALIZED: OnceLock<Option<WorkerGuard>> = OnceLock::new();

/// Initialize structured logging for the detected environment
pub fn init_structured_logging() {
    init_structured_logging_for(RuntimeEnvironment::detect());
}

pub fn init_structured_logging_for(environment: RuntimeEnvironment) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let filter = || {
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_log_level(environment)))
        };

        let console = if environment.is_production_like() {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .json()
                .with_filter(filter())
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(true)
                .with_filter(filter())
                .boxed()
        };

        let (file_layer, guard, log_path) = match std::env::var("DEAD_LETTER_LOG_DIR") {
            Ok(dir) if !dir.trim().is_empty() => {
                let log_dir = PathBuf::from(dir);
                let file_name = format!(
                    "{}.{}.{}.log",
                    environment,
                    process::id(),
                    Utc::now().format("%Y%m%d_%H%M%S")
                );
                let appender = tracing_appender::rolling::never(&log_dir, &file_name);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let layer = fmt::layer()
                    .with_writer(writer)
                    .with_target(true)
                    .with_ansi(false)
                    .json()
                    .with_filter(filter())
                    .boxed();
                (Some(layer), Some(guard), Some(log_dir.join(file_name)))
            }
            _ => (None, None, None),
        };

        let subscriber = tracing_subscriber::registry().with(console).with(file_layer);

        // A host application may already own the global subscriber
        if subscriber.try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = process::id(),
            environment = %environment,
            log_file = ?log_path,
            "🔧 STRUCTURED LOGGING: Initialized"
        );

        guard
    });
}

/// Default filter directive per environment
pub fn default_log_level(environment: RuntimeEnvironment) -> &'static str {
    match environment {
        RuntimeEnvironment::Development | RuntimeEnvironment::Test => "debug",
        RuntimeEnvironment::Staging | RuntimeEnvironment::Production => "info",
    }
}

/// Log structured data for an administrative dead-letter operation
pub fn log_dead_letter_operation(
    operation: &str,
    backend: &str,
    queue: &str,
    message_id: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        backend = %backend,
        queue = %queue,
        message_id = message_id,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "🪦 DEAD_LETTER_OPERATION"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn production_defaults_to_info() {
        assert_eq!(default_log_level(RuntimeEnvironment::Production), "info");
        assert_eq!(default_log_level(RuntimeEnvironment::Staging), "info");
        assert_eq!(default_log_level(RuntimeEnvironment::Test), "debug");
    }

    #[test]
    fn init_is_idempotent() {
        init_structured_logging_for(RuntimeEnvironment::Test);
        init_structured_logging_for(RuntimeEnvironment::Test);
        log_dead_letter_operation("purge", "in_memory", "dlq.orders", None, "not_found", None);
    }
}
