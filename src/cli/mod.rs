//! CLI commands for msgqueue using clap.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{default_config_path, load_config, QueueConfig};
use crate::core::{EntryStatus, MessageQueue, PriorityHint, QueueEntry};
use crate::error::Error;
use crate::processor::{AsyncQueueProcessor, OutboxDelivery, RetryDriver};
use crate::stats::format_age;
use crate::storage::{FileLockManager, FileQueuePersistence};

/// Width of the message column in `list` output.
const MESSAGE_PREVIEW_CHARS: usize = 60;

/// msgqueue - durable file-backed priority message queue.
#[derive(Parser, Debug)]
#[command(name = "msgqueue")]
#[command(version)]
#[command(about = "Durable file-backed priority message queue", long_about = None)]
pub struct Commands {
    /// Path to the JSON config file (default: ~/.msgqueue/config.json)
    #[arg(long, global = true, env = "MSGQUEUE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Queue directory, overriding `queue_directory` from the config
    #[arg(long, global = true, env = "MSGQUEUE_DIR")]
    pub queue_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Add a message to the queue
    Enqueue {
        /// Message body; parsed as JSON when possible, otherwise stored as a string
        message: String,

        /// Priority score (0.0-1.0) or level: urgent, high, regular, low
        #[arg(long, short)]
        priority: Option<PriorityHint>,
    },

    /// List entries in dequeue order
    List {
        /// Only show entries with this status
        #[arg(long, short)]
        status: Option<EntryStatus>,
    },

    /// Show queue statistics
    Stats {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show queue health
    Health {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Remove entries older than max_age_days
    Cleanup,

    /// Reset a FAILED entry to PENDING
    Requeue {
        /// Queue ID
        queue_id: String,
    },

    /// Reset entries stuck in PROCESSING back to PENDING
    Recover {
        /// Only entries last updated more than this many seconds ago
        #[arg(long, default_value_t = 300)]
        older_than: u64,
    },

    /// Deliver queued messages to the outbox file
    Process {
        /// Process a single batch and exit
        #[arg(long)]
        once: bool,

        /// Seconds to sleep between batches
        #[arg(long, default_value_t = 1.0)]
        interval: f64,

        /// Re-drive failed entries with exponential backoff
        #[arg(long)]
        retry: bool,
    },
}

impl Commands {
    /// Run the command.
    pub async fn run(&self) -> Result<()> {
        let queue = Arc::new(self.open_queue()?);

        match &self.command {
            Command::Enqueue { message, priority } => cmd_enqueue(&queue, message, *priority),
            Command::List { status } => cmd_list(&queue, *status),
            Command::Stats { json } => cmd_stats(&queue, *json),
            Command::Health { json } => cmd_health(&queue, *json),
            Command::Cleanup => cmd_cleanup(&queue),
            Command::Requeue { queue_id } => cmd_requeue(&queue, queue_id),
            Command::Recover { older_than } => cmd_recover(&queue, *older_than),
            Command::Process { once, interval, retry } => {
                cmd_process(queue, *once, *interval, *retry).await
            }
        }
    }

    /// Resolve config from file, env and flags.
    pub fn load_config(&self) -> Result<QueueConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => match default_config_path() {
                Ok(path) => load_config(&path)?,
                Err(e) => {
                    tracing::debug!("No default config path ({}), using defaults", e);
                    QueueConfig::default()
                }
            },
        };

        if let Some(dir) = &self.queue_dir {
            config.queue_directory = dir.clone();
        }

        Ok(config)
    }

    /// Open the queue with a cross-process file lock, since the CLI and a
    /// running `process` loop may share the same queue file.
    fn open_queue(&self) -> Result<MessageQueue> {
        let config = self.load_config()?;
        let persistence = FileQueuePersistence::new(config.queue_file())
            .with_lock_manager(Arc::new(FileLockManager::new()));

        Ok(MessageQueue::with_persistence(config, Arc::new(persistence)))
    }
}

// Command implementations

fn cmd_enqueue(queue: &MessageQueue, message: &str, priority: Option<PriorityHint>) -> Result<()> {
    let message = parse_message(message);

    let queue_id = match priority {
        Some(hint) => queue.enqueue_with_priority(message, hint)?,
        None => queue.enqueue(message)?,
    };

    println!("{}", queue_id);
    Ok(())
}

fn cmd_list(queue: &MessageQueue, status: Option<EntryStatus>) -> Result<()> {
    let entries = queue.list(status);

    if entries.is_empty() {
        println!("No entries.");
        return Ok(());
    }

    let now = chrono::Utc::now();
    println!(
        "{:<26}  {:<10}  {:>5}  {:>8}  {:>8}  MESSAGE",
        "ID", "STATUS", "PRIO", "ATTEMPTS", "AGE"
    );
    for entry in &entries {
        println!(
            "{:<26}  {:<10}  {:>5.2}  {:>8}  {:>8}  {}",
            entry.queue_id,
            entry.status,
            entry.priority_score,
            entry.delivery_attempts(),
            format_age(entry.age(now).num_milliseconds() as f64 / 1000.0),
            preview(entry)
        );
    }
    println!("\n{} entries", entries.len());

    Ok(())
}

fn cmd_stats(queue: &MessageQueue, json: bool) -> Result<()> {
    let stats = queue.get_statistics();

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("{}", stats);
    }
    Ok(())
}

fn cmd_health(queue: &MessageQueue, json: bool) -> Result<()> {
    let health = queue.get_health_status();

    if json {
        println!("{}", serde_json::to_string_pretty(&health)?);
    } else {
        println!("{}", health);
    }
    Ok(())
}

fn cmd_cleanup(queue: &MessageQueue) -> Result<()> {
    let removed = queue.cleanup_expired()?;
    println!("Removed {} expired entries", removed);
    Ok(())
}

fn cmd_requeue(queue: &MessageQueue, queue_id: &str) -> Result<()> {
    if queue.requeue(queue_id)? {
        println!("Re-queued {}", queue_id);
        return Ok(());
    }

    match queue.get(queue_id) {
        None => Err(Error::NotFound(format!("queue entry {}", queue_id)).into()),
        Some(entry) => bail!("Entry {} is {}, only FAILED entries can be re-queued", queue_id, entry.status),
    }
}

fn cmd_recover(queue: &MessageQueue, older_than: u64) -> Result<()> {
    let threshold = chrono::Duration::from_std(Duration::from_secs(older_than))
        .map_err(|_| Error::Config(format!("Invalid --older-than: {}", older_than)))?;
    let recovered = queue.recover_stuck(threshold)?;
    println!("Recovered {} stuck entries", recovered);
    Ok(())
}

async fn cmd_process(queue: Arc<MessageQueue>, once: bool, interval: f64, retry: bool) -> Result<()> {
    let interval = Duration::try_from_secs_f64(interval)
        .map_err(|_| Error::Config(format!("Invalid interval: {}", interval)))?;

    let handler = OutboxDelivery::in_directory(&queue.config().queue_directory);
    println!("Delivering to {}", handler.path().display());

    let mut processor = AsyncQueueProcessor::new(Arc::clone(&queue), Arc::new(handler));
    if retry {
        processor = processor.with_retry_driver(RetryDriver::from_queue(Arc::clone(&queue)));
    }

    if once {
        let report = processor.process_batch().await?;
        processor.cleanup_if_needed().await;
        println!(
            "Dequeued {}: {} delivered, {} failed, {} skipped",
            report.dequeued, report.delivered, report.failed, report.skipped
        );
        return Ok(());
    }

    // Handle Ctrl+C
    let stop = processor.stop_handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Interrupt received, stopping after the current batch");
        stop.stop();
    });

    processor.start_processing(interval).await?;
    Ok(())
}

/// JSON if it parses, otherwise the raw text as a string message.
fn parse_message(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn preview(entry: &QueueEntry) -> String {
    let text = match &entry.message {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    if text.chars().count() > MESSAGE_PREVIEW_CHARS {
        let truncated: String = text.chars().take(MESSAGE_PREVIEW_CHARS - 3).collect();
        format!("{}...", truncated)
    } else {
        text
    }
}
