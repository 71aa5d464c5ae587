//! Delivery contract between the processor and the embedding application.

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::error::Result;

/// Field that makes [`OutboxDelivery`] reject a message.
pub const UNDELIVERABLE_FIELD: &str = "undeliverable";

/// What happened to a delivery attempt.
///
/// `Rejected` is an expected failure (target refused, message invalid).
/// Unexpected failures are reported as `Err` from [`DeliveryHandler::deliver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Rejected(String),
}

impl DeliveryOutcome {
    pub fn rejected(reason: impl Into<String>) -> Self {
        DeliveryOutcome::Rejected(reason.into())
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered)
    }
}

impl From<bool> for DeliveryOutcome {
    fn from(delivered: bool) -> Self {
        if delivered {
            DeliveryOutcome::Delivered
        } else {
            DeliveryOutcome::rejected("delivery callback returned false")
        }
    }
}

/// Transport that actually hands a message to its destination.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn deliver(&self, message: &Value) -> Result<DeliveryOutcome>;
}

/// Adapts a plain `Fn(&Value) -> bool` into a [`DeliveryHandler`].
pub struct FnDelivery<F> {
    callback: F,
}

impl<F> FnDelivery<F>
where
    F: Fn(&Value) -> bool + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

#[async_trait]
impl<F> DeliveryHandler for FnDelivery<F>
where
    F: Fn(&Value) -> bool + Send + Sync,
{
    async fn deliver(&self, message: &Value) -> Result<DeliveryOutcome> {
        Ok((self.callback)(message).into())
    }
}

/// Appends each delivered message as one JSON line to an outbox file.
#[derive(Debug, Clone)]
pub struct OutboxDelivery {
    path: PathBuf,
}

impl OutboxDelivery {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Outbox at `<queue_directory>/outbox.jsonl`.
    pub fn in_directory(dir: &Path) -> Self {
        Self::new(dir.join("outbox.jsonl"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DeliveryHandler for OutboxDelivery {
    async fn deliver(&self, message: &Value) -> Result<DeliveryOutcome> {
        if message.get(UNDELIVERABLE_FIELD).and_then(Value::as_bool) == Some(true) {
            return Ok(DeliveryOutcome::rejected("message is marked undeliverable"));
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut line = serde_json::to_string(message)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        tracing::trace!("Wrote message to outbox {}", self.path.display());
        Ok(DeliveryOutcome::Delivered)
    }
}
