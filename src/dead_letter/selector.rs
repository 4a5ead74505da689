//! # Backend Selector
//!
//! Maps the runtime environment to a concrete store through a fixed table.
//! Development and test run against a self-hosted RabbitMQ; every other
//! environment uses PGMQ on managed PostgreSQL. Disabling persistence
//! (`dead_letter.enabled = false`) selects the no-op store everywhere.
//!
//! Selection never opens a connection; stores connect on first use.

use std::fmt;
use std::sync::Arc;
use tracing::info;

use super::backends::{NoOpDeadLetterStore, PgmqDeadLetterStore, RabbitMqDeadLetterStore};
use super::notifier::AdminNotifier;
use super::service::StoreContext;
use super::store::DeadLetterStore;
use crate::config::loader::{redact_url, ConfigManager};
use crate::config::DeadLetterConfig;
use crate::environment::RuntimeEnvironment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Self-hosted broker (RabbitMQ)
    LocalBroker,
    /// Managed service (PGMQ)
    ManagedBroker,
    /// Persistence turned off
    Disabled,
}

const BACKEND_TABLE: [(RuntimeEnvironment, BackendKind); 4] = [
    (RuntimeEnvironment::Development, BackendKind::LocalBroker),
    (RuntimeEnvironment::Test, BackendKind::LocalBroker),
    (RuntimeEnvironment::Staging, BackendKind::ManagedBroker),
    (RuntimeEnvironment::Production, BackendKind::ManagedBroker),
];

impl BackendKind {
    pub fn for_environment(environment: RuntimeEnvironment) -> Self {
        BACKEND_TABLE
            .iter()
            .find(|(env, _)| *env == environment)
            .map_or(Self::ManagedBroker, |(_, kind)| *kind)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocalBroker => "local_broker",
            Self::ManagedBroker => "managed_broker",
            Self::Disabled => "disabled",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct BackendSelector {
    config: DeadLetterConfig,
    environment: RuntimeEnvironment,
    notifier: Option<Arc<dyn AdminNotifier>>,
}

impl BackendSelector {
    pub fn new(config: DeadLetterConfig, environment: RuntimeEnvironment) -> Self {
        Self {
            config,
            environment,
            notifier: None,
        }
    }

    pub fn from_manager(manager: &ConfigManager) -> Self {
        Self::new(manager.config().clone(), manager.environment())
    }

    /// Route administrator notifications somewhere other than the log
    pub fn with_notifier(mut self, notifier: Arc<dyn AdminNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn environment(&self) -> RuntimeEnvironment {
        self.environment
    }

    pub fn backend_kind(&self) -> BackendKind {
        if !self.config.dead_letter.enabled {
            return BackendKind::Disabled;
        }
        BackendKind::for_environment(self.environment)
    }

    pub fn store_context(&self) -> StoreContext {
        let context = StoreContext::from_config(&self.config, self.environment);
        match &self.notifier {
            Some(notifier) => context.with_notifier(Arc::clone(notifier)),
            None => context,
        }
    }

    pub fn create_dead_letter_service(&self) -> DeadLetterStore {
        let kind = self.backend_kind();
        let context = self.store_context();

        match kind {
            BackendKind::LocalBroker => {
                info!(
                    environment = %self.environment,
                    backend = "rabbitmq",
                    url = %redact_url(&self.config.rabbitmq.url),
                    "🪦 DEAD_LETTER: Selected local broker backend"
                );
                DeadLetterStore::RabbitMq(RabbitMqDeadLetterStore::new(
                    context,
                    self.config.rabbitmq.clone(),
                ))
            }
            BackendKind::ManagedBroker => {
                info!(
                    environment = %self.environment,
                    backend = "pgmq",
                    url = %redact_url(&self.config.pgmq.database_url),
                    "🪦 DEAD_LETTER: Selected managed broker backend"
                );
                DeadLetterStore::Pgmq(PgmqDeadLetterStore::new(context, self.config.pgmq.clone()))
            }
            BackendKind::Disabled => {
                info!(
                    environment = %self.environment,
                    backend = "noop",
                    "🪦 DEAD_LETTER: Persistence disabled, failed messages are only logged"
                );
                DeadLetterStore::NoOp(NoOpDeadLetterStore::new(context))
            }
        }
    }
}

/// Select a store for the loaded configuration and its environment
pub fn create_dead_letter_service(manager: &ConfigManager) -> DeadLetterStore {
    BackendSelector::from_manager(manager).create_dead_letter_service()
}
