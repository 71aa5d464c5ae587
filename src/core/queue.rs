//! Priority message queue backed by a single JSON file.
//!
//! Every mutation is a whole-file read-modify-write inside
//! [`FileQueuePersistence::atomic_operation`]. Entries move through:
//!
//! - PENDING    : waiting for delivery
//! - PROCESSING : handed out by `dequeue`
//! - DELIVERED  : delivery confirmed (terminal)
//! - FAILED     : delivery failed; stays until re-queued or cleaned up

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::stats::{HealthStatus, QueueHealthMonitor, QueueStatistics, QueueStatisticsCalculator};
use crate::storage::FileQueuePersistence;

use super::entry::{dequeue_order, EntryStatus, QueueEntry};
use super::priority::{resolve_priority, PriorityHint, PRIORITY_FIELD};

/// Queue operations.
#[derive(Debug)]
pub struct MessageQueue {
    config: QueueConfig,
    persistence: Arc<FileQueuePersistence>,
    monitor: QueueHealthMonitor,
    span: tracing::Span,
}

impl MessageQueue {
    /// Queue stored at `<queue_directory>/queue.json` with in-process locking.
    pub fn new(config: QueueConfig) -> Self {
        let persistence = Arc::new(FileQueuePersistence::new(config.queue_file()));
        Self::with_persistence(config, persistence)
    }

    /// Queue over an explicitly constructed persistence (e.g. one with a file lock manager).
    pub fn with_persistence(config: QueueConfig, persistence: Arc<FileQueuePersistence>) -> Self {
        let span = tracing::debug_span!("message_queue", file = %persistence.path().display());
        Self {
            config,
            persistence,
            monitor: QueueHealthMonitor::default(),
            span,
        }
    }

    pub fn with_health_monitor(mut self, monitor: QueueHealthMonitor) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn persistence(&self) -> &Arc<FileQueuePersistence> {
        &self.persistence
    }

    /// Enqueue a message, taking its priority from the message's `priority` field.
    pub fn enqueue(&self, message: Value) -> Result<String> {
        let hint = PriorityHint::from_message(&message);
        if hint.is_none() && message.get(PRIORITY_FIELD).is_some() {
            tracing::debug!("Unrecognized priority on message, using default");
        }
        self.insert(message, resolve_priority(hint))
    }

    /// Enqueue with an explicit priority, ignoring any `priority` field on the message.
    pub fn enqueue_with_priority(&self, message: Value, priority: impl Into<PriorityHint>) -> Result<String> {
        self.insert(message, priority.into().score())
    }

    fn insert(&self, message: Value, priority_score: f64) -> Result<String> {
        let _span = self.span.enter();
        let max = self.config.max_queue_size;

        self.persistence.atomic_operation(|store| {
            let mut entries = store.load_entries_for_update()?;
            if entries.len() >= max {
                tracing::warn!("Rejecting enqueue: queue holds {} entries (max {})", entries.len(), max);
                return Err(Error::CapacityExceeded {
                    current: entries.len(),
                    max,
                });
            }

            let mut entry = QueueEntry::new(message, priority_score);
            let ids: HashSet<&str> = entries.iter().map(|e| e.queue_id.as_str()).collect();
            while ids.contains(entry.queue_id.as_str()) {
                entry.queue_id = ulid::Ulid::new().to_string();
            }
            drop(ids);

            let id = entry.queue_id.clone();
            entries.push(entry);
            store.save_entries(&entries)?;

            tracing::debug!("Enqueued message {} (priority {:.2})", id, priority_score);
            Ok(id)
        })
    }

    /// Take up to `batch_size` PENDING entries in priority order and mark them PROCESSING.
    ///
    /// The returned entries already carry the PROCESSING status that was persisted.
    pub fn dequeue(&self, batch_size: usize) -> Result<Vec<QueueEntry>> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }

        self.modify(|entries, now| {
            let mut pending: Vec<usize> = entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.status == EntryStatus::Pending)
                .map(|(i, _)| i)
                .collect();
            pending.sort_by(|&a, &b| dequeue_order(&entries[a], &entries[b]));
            pending.truncate(batch_size);

            let batch: Vec<QueueEntry> = pending
                .into_iter()
                .map(|i| {
                    entries[i].mark_processing(now);
                    entries[i].clone()
                })
                .collect();

            if !batch.is_empty() {
                tracing::debug!("Dequeued {} entries", batch.len());
            }
            let dirty = !batch.is_empty();
            Ok((batch, dirty))
        })
    }

    /// Mark an entry DELIVERED. Returns false if the id is unknown or EXPIRED.
    ///
    /// Marking an already DELIVERED entry again is a no-op returning true.
    pub fn mark_delivered(&self, queue_id: &str) -> Result<bool> {
        self.modify(|entries, now| match find(entries, queue_id) {
            Some(entry) if entry.status == EntryStatus::Delivered => Ok((true, false)),
            Some(entry) if entry.status.is_terminal() => {
                tracing::warn!("Cannot mark {} entry {} delivered", entry.status, queue_id);
                Ok((false, false))
            }
            Some(entry) => {
                entry.mark_delivered(now);
                tracing::debug!("Marked {} delivered", queue_id);
                Ok((true, true))
            }
            None => {
                tracing::warn!("Cannot mark unknown entry {} delivered", queue_id);
                Ok((false, false))
            }
        })
    }

    /// Record a failed delivery attempt.
    ///
    /// Returns false, leaving the entry untouched, if the id is unknown or the
    /// entry is already DELIVERED or EXPIRED.
    pub fn mark_failed(&self, queue_id: &str, error: &str) -> Result<bool> {
        self.modify(|entries, now| match find(entries, queue_id) {
            Some(entry) if entry.status.is_terminal() => {
                tracing::warn!(
                    "Ignoring failure for {} entry {}: {}",
                    entry.status,
                    queue_id,
                    error
                );
                Ok((false, false))
            }
            Some(entry) => {
                entry.mark_failed(error, now);
                tracing::debug!(
                    "Marked {} failed (attempt {}): {}",
                    queue_id,
                    entry.delivery_attempts(),
                    error
                );
                Ok((true, true))
            }
            None => {
                tracing::warn!("Cannot mark unknown entry {} failed", queue_id);
                Ok((false, false))
            }
        })
    }

    /// Manually put a FAILED entry back to PENDING.
    ///
    /// Returns false if the id is unknown or the entry is not FAILED.
    pub fn requeue(&self, queue_id: &str) -> Result<bool> {
        self.modify(|entries, now| match find(entries, queue_id) {
            Some(entry) if entry.status == EntryStatus::Failed => {
                entry.reset_pending(now);
                tracing::info!("Re-queued failed entry {}", queue_id);
                Ok((true, true))
            }
            Some(entry) => {
                tracing::debug!("Not re-queueing {}: status is {}", queue_id, entry.status);
                Ok((false, false))
            }
            None => Ok((false, false)),
        })
    }

    /// Reset PROCESSING entries untouched for longer than `older_than` back to PENDING.
    ///
    /// This is an operator action for entries orphaned by a crashed consumer;
    /// nothing calls it automatically.
    pub fn recover_stuck(&self, older_than: chrono::Duration) -> Result<usize> {
        self.modify(|entries, now| {
            let cutoff = now - older_than;
            let mut recovered = 0;
            for entry in entries.iter_mut() {
                if entry.status == EntryStatus::Processing && entry.updated_at <= cutoff {
                    entry.reset_pending(now);
                    tracing::info!("Recovered stuck entry: {}", entry.queue_id);
                    recovered += 1;
                }
            }
            Ok((recovered, recovered > 0))
        })
    }

    /// Remove every entry created more than `max_age_days` ago.
    pub fn cleanup_expired(&self) -> Result<usize> {
        let max_age = self.config.max_age();

        self.modify(|entries, now| {
            let cutoff = now - max_age;
            let before = entries.len();
            entries.retain(|entry| {
                let keep = entry.created_at >= cutoff;
                if !keep {
                    tracing::debug!("Expiring {} entry {}", entry.status, entry.queue_id);
                }
                keep
            });
            let removed = before - entries.len();
            Ok((removed, removed > 0))
        })
    }

    /// Look up one entry.
    pub fn get(&self, queue_id: &str) -> Option<QueueEntry> {
        self.persistence
            .load_entries()
            .into_iter()
            .find(|e| e.queue_id == queue_id)
    }

    /// Entries in dequeue order, optionally filtered by status.
    pub fn list(&self, status: Option<EntryStatus>) -> Vec<QueueEntry> {
        let mut entries: Vec<QueueEntry> = self
            .persistence
            .load_entries()
            .into_iter()
            .filter(|e| status.map_or(true, |s| e.status == s))
            .collect();
        entries.sort_by(dequeue_order);
        entries
    }

    pub fn len(&self) -> usize {
        self.persistence.load_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_statistics(&self) -> QueueStatistics {
        QueueStatisticsCalculator::calculate(&self.persistence.load_entries())
    }

    pub fn get_health_status(&self) -> HealthStatus {
        self.monitor.check(&self.persistence.load_entries())
    }

    /// Locked read-modify-write over the full entry set.
    ///
    /// `f` returns its result and whether it changed anything; the file is
    /// only rewritten when it did.
    pub(crate) fn modify<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Vec<QueueEntry>, DateTime<Utc>) -> Result<(T, bool)>,
    {
        let _span = self.span.enter();
        self.persistence.atomic_operation(|store| {
            let mut entries = store.load_entries_for_update()?;
            let (result, dirty) = f(&mut entries, Utc::now())?;
            if dirty {
                store.save_entries(&entries)?;
            }
            Ok(result)
        })
    }
}

fn find<'a>(entries: &'a mut [QueueEntry], queue_id: &str) -> Option<&'a mut QueueEntry> {
    entries.iter_mut().find(|e| e.queue_id == queue_id)
}
