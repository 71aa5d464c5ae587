//! Queue statistics - pure computation over an entry set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::{EntryStatus, QueueEntry};

pub const PRIORITY_HIGH: &str = "high";
pub const PRIORITY_MEDIUM: &str = "medium";
pub const PRIORITY_LOW: &str = "low";
pub const PRIORITY_VERY_LOW: &str = "very_low";

pub const NEVER_RETRIED: &str = "never_retried";
pub const RETRIED_ONCE: &str = "retried_once";
pub const RETRIED_FEW: &str = "retried_few";
pub const RETRIED_MANY: &str = "retried_many";

/// Snapshot of queue contents.
///
/// Ages are in seconds, measured from `created_at`. They are `None` when
/// the queue is empty.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct QueueStatistics {
    pub total_entries: usize,
    pub pending_entries: usize,
    pub processing_entries: usize,
    pub delivered_entries: usize,
    pub failed_entries: usize,
    pub expired_entries: usize,
    pub status_distribution: BTreeMap<String, usize>,
    pub priority_distribution: BTreeMap<String, usize>,
    pub retry_distribution: BTreeMap<String, usize>,
    pub oldest_entry_age: Option<f64>,
    pub newest_entry_age: Option<f64>,
    pub average_age: Option<f64>,
    pub oldest_entry_age_formatted: Option<String>,
    pub newest_entry_age_formatted: Option<String>,
    pub average_age_formatted: Option<String>,
}

impl QueueStatistics {
    /// Share of entries currently PROCESSING, 0 for an empty queue.
    pub fn processing_ratio(&self) -> f64 {
        ratio(self.processing_entries, self.total_entries)
    }

    /// Share of entries currently FAILED, 0 for an empty queue.
    pub fn failure_rate(&self) -> f64 {
        ratio(self.failed_entries, self.total_entries)
    }
}

impl Default for QueueStatistics {
    fn default() -> Self {
        QueueStatisticsCalculator::calculate_at(&[], Utc::now())
    }
}

impl std::fmt::Display for QueueStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Queue Stats:")?;
        writeln!(f, "  Pending:    {}", self.pending_entries)?;
        writeln!(f, "  Processing: {}", self.processing_entries)?;
        writeln!(f, "  Delivered:  {}", self.delivered_entries)?;
        writeln!(f, "  Failed:     {}", self.failed_entries)?;
        writeln!(f, "  Expired:    {}", self.expired_entries)?;
        writeln!(f, "  Total:      {}", self.total_entries)?;

        let priority = [PRIORITY_HIGH, PRIORITY_MEDIUM, PRIORITY_LOW, PRIORITY_VERY_LOW]
            .iter()
            .map(|bucket| format!("{}={}", bucket, self.priority_distribution.get(*bucket).copied().unwrap_or(0)))
            .collect::<Vec<_>>()
            .join(" ");
        writeln!(f, "  Priority:   {}", priority)?;

        let retries = [NEVER_RETRIED, RETRIED_ONCE, RETRIED_FEW, RETRIED_MANY]
            .iter()
            .map(|bucket| format!("{}={}", bucket, self.retry_distribution.get(*bucket).copied().unwrap_or(0)))
            .collect::<Vec<_>>()
            .join(" ");
        writeln!(f, "  Retries:    {}", retries)?;

        let age = |formatted: &Option<String>| formatted.clone().unwrap_or_else(|| "-".to_string());
        write!(
            f,
            "  Age:        oldest {}, newest {}, average {}",
            age(&self.oldest_entry_age_formatted),
            age(&self.newest_entry_age_formatted),
            age(&self.average_age_formatted)
        )
    }
}

/// Computes [`QueueStatistics`].
pub struct QueueStatisticsCalculator;

impl QueueStatisticsCalculator {
    pub fn calculate(entries: &[QueueEntry]) -> QueueStatistics {
        Self::calculate_at(entries, Utc::now())
    }

    /// Compute statistics with ages measured relative to `now`.
    pub fn calculate_at(entries: &[QueueEntry], now: DateTime<Utc>) -> QueueStatistics {
        let mut status_distribution: BTreeMap<String, usize> = EntryStatus::ALL
            .iter()
            .map(|status| (status.as_str().to_string(), 0))
            .collect();
        let mut priority_distribution: BTreeMap<String, usize> =
            [PRIORITY_HIGH, PRIORITY_MEDIUM, PRIORITY_LOW, PRIORITY_VERY_LOW]
                .iter()
                .map(|bucket| (bucket.to_string(), 0))
                .collect();
        let mut retry_distribution: BTreeMap<String, usize> =
            [NEVER_RETRIED, RETRIED_ONCE, RETRIED_FEW, RETRIED_MANY]
                .iter()
                .map(|bucket| (bucket.to_string(), 0))
                .collect();

        let mut ages = Vec::with_capacity(entries.len());

        for entry in entries {
            *status_distribution
                .entry(entry.status.as_str().to_string())
                .or_default() += 1;
            *priority_distribution
                .entry(priority_bucket(entry.priority_score).to_string())
                .or_default() += 1;
            *retry_distribution
                .entry(retry_bucket(entry.delivery_attempts()).to_string())
                .or_default() += 1;
            ages.push(seconds(entry.age(now)));
        }

        let count = |status: EntryStatus| status_distribution[status.as_str()];

        let oldest = ages.iter().copied().reduce(f64::max);
        let newest = ages.iter().copied().reduce(f64::min);
        let average = if ages.is_empty() {
            None
        } else {
            Some(ages.iter().sum::<f64>() / ages.len() as f64)
        };

        QueueStatistics {
            total_entries: entries.len(),
            pending_entries: count(EntryStatus::Pending),
            processing_entries: count(EntryStatus::Processing),
            delivered_entries: count(EntryStatus::Delivered),
            failed_entries: count(EntryStatus::Failed),
            expired_entries: count(EntryStatus::Expired),
            oldest_entry_age: oldest,
            newest_entry_age: newest,
            average_age: average,
            oldest_entry_age_formatted: oldest.map(format_age),
            newest_entry_age_formatted: newest.map(format_age),
            average_age_formatted: average.map(format_age),
            status_distribution,
            priority_distribution,
            retry_distribution,
        }
    }
}

/// Priority bucket name for a score.
pub fn priority_bucket(score: f64) -> &'static str {
    if score >= 0.8 {
        PRIORITY_HIGH
    } else if score >= 0.6 {
        PRIORITY_MEDIUM
    } else if score >= 0.4 {
        PRIORITY_LOW
    } else {
        PRIORITY_VERY_LOW
    }
}

/// Retry bucket name for an attempt count.
pub fn retry_bucket(attempts: u32) -> &'static str {
    match attempts {
        0 => NEVER_RETRIED,
        1 => RETRIED_ONCE,
        2..=4 => RETRIED_FEW,
        _ => RETRIED_MANY,
    }
}

/// Human-readable age, two most significant units: "45s", "3m 20s", "2h 15m", "4d 1h".
pub fn format_age(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 {
        seconds as u64
    } else {
        0
    };

    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let secs = total % 60;

    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

fn seconds(duration: chrono::Duration) -> f64 {
    duration.num_milliseconds() as f64 / 1000.0
}

fn ratio(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}
