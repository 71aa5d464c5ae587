//! Configuration loading for msgqueue.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Name of the persisted queue file inside `queue_directory`.
pub const QUEUE_FILE_NAME: &str = "queue.json";

/// Get the msgqueue home directory (~/.msgqueue).
pub fn get_home_dir() -> Result<PathBuf> {
    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".msgqueue"))
}

/// Get the default config file path.
pub fn default_config_path() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("config.json"))
}

/// Load the queue config from a JSON file.
///
/// A missing file yields the defaults. A file that exists but does not parse
/// or fails validation is an error.
pub fn load_config(path: &Path) -> Result<QueueConfig> {
    if !path.exists() {
        tracing::debug!("No config at {}, using defaults", path.display());
        return Ok(QueueConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: QueueConfig = serde_json::from_str(&content)
        .map_err(|e| Error::Config(format!("Invalid config {}: {}", path.display(), e)))?;

    config.validate()?;

    tracing::debug!("Loaded config from {}", path.display());
    Ok(config)
}

/// Queue configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct QueueConfig {
    #[serde(default = "default_queue_directory")]
    pub queue_directory: PathBuf,

    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    #[serde(default = "default_processing_batch_size")]
    pub processing_batch_size: usize,

    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,

    /// Seconds.
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay: f64,

    /// Seconds.
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay: f64,

    /// Seconds between cleanup runs in the processing loop.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,

    /// Attempts after which the retry driver leaves an entry FAILED.
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,
}

fn default_queue_directory() -> PathBuf {
    PathBuf::from("message_queue")
}

fn default_max_queue_size() -> usize {
    1000
}

fn default_processing_batch_size() -> usize {
    10
}

fn default_max_age_days() -> u32 {
    7
}

fn default_retry_base_delay() -> f64 {
    1.0
}

fn default_retry_max_delay() -> f64 {
    300.0
}

fn default_cleanup_interval() -> u64 {
    3600
}

fn default_max_delivery_attempts() -> u32 {
    5
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_directory: default_queue_directory(),
            max_queue_size: default_max_queue_size(),
            processing_batch_size: default_processing_batch_size(),
            max_age_days: default_max_age_days(),
            retry_base_delay: default_retry_base_delay(),
            retry_max_delay: default_retry_max_delay(),
            cleanup_interval: default_cleanup_interval(),
            max_delivery_attempts: default_max_delivery_attempts(),
        }
    }
}

impl QueueConfig {
    /// Config rooted at a specific queue directory, other fields default.
    pub fn with_directory(dir: impl Into<PathBuf>) -> Self {
        Self {
            queue_directory: dir.into(),
            ..Self::default()
        }
    }

    /// Path of the persisted queue file.
    pub fn queue_file(&self) -> PathBuf {
        self.queue_directory.join(QUEUE_FILE_NAME)
    }

    pub fn max_age(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.max_age_days))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval)
    }

    /// Falls back to the default for values `validate` would reject.
    pub fn retry_base_delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.retry_base_delay)
            .unwrap_or_else(|_| Duration::from_secs_f64(default_retry_base_delay()))
    }

    /// Falls back to the default for values `validate` would reject.
    pub fn retry_max_delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.retry_max_delay)
            .unwrap_or_else(|_| Duration::from_secs_f64(default_retry_max_delay()))
    }

    /// Reject values the queue cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.max_queue_size == 0 {
            return Err(Error::Config("max_queue_size must be greater than 0".to_string()));
        }
        if self.processing_batch_size == 0 {
            return Err(Error::Config(
                "processing_batch_size must be greater than 0".to_string(),
            ));
        }
        if !(self.retry_base_delay.is_finite() && self.retry_base_delay > 0.0) {
            return Err(Error::Config(format!(
                "retry_base_delay must be a positive number of seconds, got {}",
                self.retry_base_delay
            )));
        }
        if !self.retry_max_delay.is_finite() || self.retry_max_delay < self.retry_base_delay {
            return Err(Error::Config(format!(
                "retry_max_delay ({}) must be >= retry_base_delay ({})",
                self.retry_max_delay, self.retry_base_delay
            )));
        }
        Ok(())
    }
}
