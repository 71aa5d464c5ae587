//! Retry driver - moves FAILED entries back to PENDING under exponential backoff.
//!
//! The queue itself never retries. A processor only re-drives failures when a
//! [`RetryDriver`] is attached to it.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::config::QueueConfig;
use crate::core::entry::META_RETRY_SCHEDULED_AT;
use crate::core::{EntryStatus, MessageQueue, QueueEntry};
use crate::error::Result;

/// Set once an entry has used up its attempts.
const META_RETRIES_EXHAUSTED: &str = "retries_exhausted";

/// Backoff settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            base_delay: config.retry_base_delay(),
            max_delay: config.retry_max_delay(),
            max_attempts: config.max_delivery_attempts,
        }
    }

    /// `base_delay * 2^(attempts - 1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// When a failed entry becomes eligible again, if ever.
    pub fn next_attempt_at(&self, entry: &QueueEntry) -> Option<DateTime<Utc>> {
        let attempts = entry.delivery_attempts();
        if attempts >= self.max_attempts {
            return None;
        }
        let delay = chrono::Duration::from_std(self.delay_for(attempts)).ok()?;
        entry.updated_at.checked_add_signed(delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

/// Re-drives failed entries whose backoff has elapsed.
#[derive(Debug, Clone)]
pub struct RetryDriver {
    queue: Arc<MessageQueue>,
    policy: RetryPolicy,
}

impl RetryDriver {
    pub fn new(queue: Arc<MessageQueue>, policy: RetryPolicy) -> Self {
        Self { queue, policy }
    }

    /// Driver using the queue's own retry settings.
    pub fn from_queue(queue: Arc<MessageQueue>) -> Self {
        let policy = RetryPolicy::from_config(queue.config());
        Self::new(queue, policy)
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Reset every due FAILED entry to PENDING. Returns how many were re-driven.
    pub fn requeue_due(&self) -> Result<usize> {
        let policy = &self.policy;

        self.queue.modify(|entries, now| {
            let mut requeued = 0;
            let mut dirty = false;

            for entry in entries.iter_mut().filter(|e| e.status == EntryStatus::Failed) {
                match policy.next_attempt_at(entry) {
                    Some(due) if due <= now => {
                        entry.reset_pending(now);
                        entry
                            .metadata
                            .insert(META_RETRY_SCHEDULED_AT.to_string(), Value::from(now.to_rfc3339()));
                        tracing::debug!(
                            "Retrying {} (attempt {})",
                            entry.queue_id,
                            entry.delivery_attempts() + 1
                        );
                        requeued += 1;
                        dirty = true;
                    }
                    Some(_) => {}
                    None => {
                        if !entry.metadata.contains_key(META_RETRIES_EXHAUSTED) {
                            tracing::warn!(
                                "Entry {} failed {} times, giving up: {}",
                                entry.queue_id,
                                entry.delivery_attempts(),
                                entry.last_error().unwrap_or("unknown error")
                            );
                            entry
                                .metadata
                                .insert(META_RETRIES_EXHAUSTED.to_string(), Value::Bool(true));
                            dirty = true;
                        }
                    }
                }
            }

            if requeued > 0 {
                tracing::info!("Re-queued {} failed entries for retry", requeued);
            }
            Ok((requeued, dirty))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            max_attempts: 3,
        }
    }

    #[test]
    fn test_delay_for() {
        let policy = policy();

        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(5), Duration::from_secs(10));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_defaults_follow_config() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(300));
        assert_eq!(policy.max_attempts, 5);
    }

    #[test]
    fn test_requeue_due() {
        let temp_dir = TempDir::new().unwrap();
        let queue = Arc::new(MessageQueue::new(QueueConfig::with_directory(temp_dir.path())));

        // Failed long enough ago to be due
        let mut due = QueueEntry::new(json!("due"), 0.5);
        due.mark_failed("timeout", Utc::now());
        due.created_at = Utc::now() - chrono::Duration::minutes(5);
        due.updated_at = due.created_at;

        // Failed just now, still backing off
        let mut waiting = QueueEntry::new(json!("waiting"), 0.5);
        waiting.mark_failed("timeout", Utc::now());

        // Out of attempts
        let mut exhausted = QueueEntry::new(json!("exhausted"), 0.5);
        for _ in 0..3 {
            exhausted.mark_failed("refused", Utc::now());
        }
        exhausted.created_at = Utc::now() - chrono::Duration::hours(1);
        exhausted.updated_at = exhausted.created_at;

        let ids = (due.queue_id.clone(), waiting.queue_id.clone(), exhausted.queue_id.clone());
        queue
            .persistence()
            .save_entries(&[due, waiting, exhausted])
            .unwrap();

        let policy = RetryPolicy {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(600),
            max_attempts: 3,
        };
        let driver = RetryDriver::new(Arc::clone(&queue), policy);
        assert_eq!(driver.requeue_due().unwrap(), 1);

        let due = queue.get(&ids.0).unwrap();
        assert_eq!(due.status, EntryStatus::Pending);
        assert_eq!(due.delivery_attempts(), 1);
        assert!(due.metadata.contains_key(META_RETRY_SCHEDULED_AT));

        assert_eq!(queue.get(&ids.1).unwrap().status, EntryStatus::Failed);

        let exhausted = queue.get(&ids.2).unwrap();
        assert_eq!(exhausted.status, EntryStatus::Failed);
        assert_eq!(exhausted.metadata[META_RETRIES_EXHAUSTED], true);

        assert_eq!(driver.requeue_due().unwrap(), 0);
    }
}
