//! # Dead-Letter Admin
//!
//! Operator tool for inspecting and resolving dead-lettered messages.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use uuid::Uuid;

use dead_letter_core::config::ConfigManager;
use dead_letter_core::dead_letter::{BackendSelector, DeadLetterService, FailedMessageInfo};
use dead_letter_core::logging;
use dead_letter_core::RuntimeEnvironment;

#[derive(Parser, Debug)]
#[command(name = "dead-letter-admin")]
#[command(about = "Inspect, reprocess and purge dead-lettered messages")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Environment (development, test, staging, production); detected when omitted
    #[arg(short, long, env = "DEAD_LETTER_ENV")]
    environment: Option<String>,

    /// Directory containing dead-letter.yaml (default: config)
    #[arg(short, long)]
    config_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Browse entries without removing them
    List {
        /// Source queue or dead-letter queue name
        queue: String,
        /// Maximum number of entries
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Republish an entry to its source queue and remove it
    Reprocess {
        /// Source queue or dead-letter queue name
        queue: String,
        /// Message id of the entry
        #[arg(value_name = "UUID")]
        message_id: Uuid,
    },
    /// Remove an entry without republishing
    Purge {
        /// Source queue or dead-letter queue name
        queue: String,
        /// Message id of the entry
        #[arg(value_name = "UUID")]
        message_id: Uuid,
    },
    /// Depth of every known dead-letter queue
    Stats,
    /// Check backend connectivity
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let environment = match cli.environment.as_deref() {
        Some(name) => name
            .parse::<RuntimeEnvironment>()
            .with_context(|| format!("invalid --environment '{name}'"))?,
        None => RuntimeEnvironment::detect(),
    };
    logging::init_structured_logging_for(environment);

    let manager = match cli.config_dir {
        Some(dir) => ConfigManager::load_from_directory_with_env(Some(dir), environment),
        None => ConfigManager::load_or_default_with_env(None, environment),
    }
    .context("failed to load dead-letter configuration")?;

    let selector = BackendSelector::new(manager.config().clone(), environment);
    let store = selector.create_dead_letter_service();

    let outcome = run(&store, cli.command, cli.format).await;
    store.close().await;
    outcome
}

async fn run<S: DeadLetterService>(store: &S, command: Commands, format: OutputFormat) -> Result<()> {
    match command {
        Commands::List { queue, limit } => {
            let entries = store
                .list_dead_letter_messages(&queue, limit)
                .await
                .with_context(|| format!("failed to list {queue}"))?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
                OutputFormat::Table => print_entries(&entries),
            }
        }
        Commands::Reprocess { queue, message_id } => {
            let found = store
                .reprocess_dead_letter_message(&queue, message_id)
                .await
                .with_context(|| format!("failed to reprocess {message_id} from {queue}"))?;
            report(store.backend_name(), found, "reprocessed", message_id, &queue);
        }
        Commands::Purge { queue, message_id } => {
            let found = store
                .purge_dead_letter_message(&queue, message_id)
                .await
                .with_context(|| format!("failed to purge {message_id} from {queue}"))?;
            report(store.backend_name(), found, "purged", message_id, &queue);
        }
        Commands::Stats => {
            let stats = store
                .get_dead_letter_statistics()
                .await
                .context("failed to gather statistics")?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
                OutputFormat::Table => {
                    println!("{:<40} {:>10}", "QUEUE", "MESSAGES");
                    for (queue, depth) in &stats.messages_by_queue {
                        println!("{queue:<40} {depth:>10}");
                    }
                    for queue in &stats.unavailable_queues {
                        println!("{queue:<40} {:>10}", "n/a");
                    }
                    println!("{:<40} {:>10}", "TOTAL", stats.total_dead_letter_messages);
                }
            }
        }
        Commands::Health => {
            let healthy = store.health_check().await.context("health check failed")?;
            println!(
                "{} backend: {}",
                store.backend_name(),
                if healthy { "healthy" } else { "unreachable" }
            );
            if !healthy {
                anyhow::bail!("{} backend is unreachable", store.backend_name());
            }
        }
    }
    Ok(())
}

fn print_entries(entries: &[FailedMessageInfo]) {
    if entries.is_empty() {
        println!("No dead-letter entries");
        return;
    }
    println!(
        "{:<36}  {:<20}  {:>8}  {:<24}  REASON",
        "MESSAGE ID", "SOURCE", "ATTEMPTS", "LAST ATTEMPT"
    );
    for info in entries {
        println!(
            "{:<36}  {:<20}  {:>8}  {:<24}  {}",
            info.message_id,
            info.source_queue,
            info.attempt_count,
            info.last_attempt_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            info.failure_reason()
        );
    }
}

fn report(backend: &str, found: bool, action: &str, message_id: Uuid, queue: &str) {
    let id = message_id.to_string();
    let status = if found { action } else { "not_found" };
    logging::log_dead_letter_operation(action, backend, queue, Some(&id), status, None);

    if found {
        println!("{message_id} {action}");
    } else {
        println!("{message_id} not found in {queue}; nothing {action}");
    }
}
