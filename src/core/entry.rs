//! Queue entry data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::str::FromStr;

use super::priority::clamp_score;

/// Metadata key counting failed delivery attempts.
pub const META_DELIVERY_ATTEMPTS: &str = "delivery_attempts";

/// Metadata key holding the most recent delivery error.
pub const META_LAST_ERROR: &str = "last_error";

/// Metadata key set by the retry driver when it re-drives an entry.
pub const META_RETRY_SCHEDULED_AT: &str = "retry_scheduled_at";

/// Entry lifecycle status.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryStatus {
    Pending,
    Processing,
    Delivered,
    Failed,
    Expired,
}

impl EntryStatus {
    pub const ALL: [EntryStatus; 5] = [
        EntryStatus::Pending,
        EntryStatus::Processing,
        EntryStatus::Delivered,
        EntryStatus::Failed,
        EntryStatus::Expired,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntryStatus::Pending => "PENDING",
            EntryStatus::Processing => "PROCESSING",
            EntryStatus::Delivered => "DELIVERED",
            EntryStatus::Failed => "FAILED",
            EntryStatus::Expired => "EXPIRED",
        }
    }

    /// DELIVERED and EXPIRED never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, EntryStatus::Delivered | EntryStatus::Expired)
    }
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EntryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "PENDING" => Ok(EntryStatus::Pending),
            "PROCESSING" => Ok(EntryStatus::Processing),
            "DELIVERED" => Ok(EntryStatus::Delivered),
            "FAILED" => Ok(EntryStatus::Failed),
            "EXPIRED" => Ok(EntryStatus::Expired),
            _ => Err(format!("Unknown entry status: {}", s)),
        }
    }
}

/// A message plus its queue-management state.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct QueueEntry {
    /// Opaque payload. `Null` when the stored entry has no message.
    #[serde(default)]
    pub message: Value,

    pub queue_id: String,

    #[serde(deserialize_with = "deserialize_score")]
    pub priority_score: f64,

    pub status: EntryStatus,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub metadata: Map<String, Value>,
}

fn deserialize_score<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    f64::deserialize(deserializer).map(clamp_score)
}

impl QueueEntry {
    /// Create a new PENDING entry with a fresh ULID.
    pub fn new(message: Value, priority_score: f64) -> Self {
        Self::new_at(message, priority_score, Utc::now())
    }

    pub fn new_at(message: Value, priority_score: f64, now: DateTime<Utc>) -> Self {
        let mut metadata = Map::new();
        metadata.insert(META_DELIVERY_ATTEMPTS.to_string(), Value::from(0u32));

        Self {
            message,
            queue_id: ulid::Ulid::new().to_string(),
            priority_score: clamp_score(priority_score),
            status: EntryStatus::Pending,
            created_at: now,
            updated_at: now,
            metadata,
        }
    }

    pub fn has_message(&self) -> bool {
        !self.message.is_null()
    }

    pub fn delivery_attempts(&self) -> u32 {
        self.metadata
            .get(META_DELIVERY_ATTEMPTS)
            .and_then(Value::as_u64)
            .map_or(0, |n| u32::try_from(n).unwrap_or(u32::MAX))
    }

    pub fn last_error(&self) -> Option<&str> {
        self.metadata.get(META_LAST_ERROR).and_then(Value::as_str)
    }

    /// Age relative to `now`, by `created_at`. Never negative.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.created_at).max(chrono::Duration::zero())
    }

    pub fn mark_processing(&mut self, now: DateTime<Utc>) {
        self.set_status(EntryStatus::Processing, now);
    }

    pub fn mark_delivered(&mut self, now: DateTime<Utc>) {
        self.set_status(EntryStatus::Delivered, now);
    }

    /// Record a failed attempt.
    pub fn mark_failed(&mut self, error: &str, now: DateTime<Utc>) {
        let attempts = self.delivery_attempts().saturating_add(1);
        self.metadata
            .insert(META_DELIVERY_ATTEMPTS.to_string(), Value::from(attempts));
        self.metadata
            .insert(META_LAST_ERROR.to_string(), Value::from(error));
        self.set_status(EntryStatus::Failed, now);
    }

    /// Put the entry back in line. Attempts and last error are kept.
    pub fn reset_pending(&mut self, now: DateTime<Utc>) {
        self.set_status(EntryStatus::Pending, now);
    }

    fn set_status(&mut self, status: EntryStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now.max(self.created_at);
    }
}

/// Dequeue order: higher score first, then oldest first.
pub fn dequeue_order(a: &QueueEntry, b: &QueueEntry) -> Ordering {
    b.priority_score
        .total_cmp(&a.priority_score)
        .then_with(|| a.created_at.cmp(&b.created_at))
}
