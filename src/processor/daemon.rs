//! Processing loop draining the queue into a delivery handler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::Instrument;

use crate::core::{MessageQueue, QueueEntry};
use crate::error::{Error, Result};

use super::delivery::{DeliveryHandler, DeliveryOutcome};
use super::retry::RetryDriver;

/// Counts from one `process_batch` call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub dequeued: usize,
    pub delivered: usize,
    pub failed: usize,
    /// Entries without a message, left PROCESSING.
    pub skipped: usize,
}

/// Stops a running processor at its next loop boundary.
#[derive(Debug, Clone)]
pub struct StopHandle {
    running: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Cooperative consumer loop.
pub struct AsyncQueueProcessor {
    queue: Arc<MessageQueue>,
    handler: Arc<dyn DeliveryHandler>,
    retry_driver: Option<RetryDriver>,
    batch_size: usize,
    cleanup_interval: Duration,
    running: Arc<AtomicBool>,
    last_cleanup: Mutex<Option<Instant>>,
}

impl AsyncQueueProcessor {
    /// Create a processor using the queue's batch size and cleanup interval.
    pub fn new(queue: Arc<MessageQueue>, handler: Arc<dyn DeliveryHandler>) -> Self {
        let batch_size = queue.config().processing_batch_size.max(1);
        let cleanup_interval = queue.config().cleanup_interval();

        Self {
            queue,
            handler,
            retry_driver: None,
            batch_size,
            cleanup_interval,
            running: Arc::new(AtomicBool::new(false)),
            last_cleanup: Mutex::new(None),
        }
    }

    /// Attach a retry driver; without one failed entries stay FAILED.
    pub fn with_retry_driver(mut self, driver: RetryDriver) -> Self {
        self.retry_driver = Some(driver);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn queue(&self) -> &Arc<MessageQueue> {
        &self.queue
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            running: Arc::clone(&self.running),
        }
    }

    /// Run until stopped, sleeping `interval` between iterations.
    ///
    /// The flag is checked once per iteration, so a stop takes effect after
    /// the current batch and sleep finish.
    pub async fn start_processing(&self, interval: Duration) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::Other("Processor already running".to_string()));
        }

        tracing::info!(
            "Queue processor started (batch size {}, interval {:?})",
            self.batch_size,
            interval
        );

        async {
            while self.running.load(Ordering::SeqCst) {
                match self.process_batch().await {
                    Ok(report) if report.dequeued > 0 => {
                        tracing::info!(
                            "Processed batch: {} delivered, {} failed, {} skipped",
                            report.delivered,
                            report.failed,
                            report.skipped
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!("Batch processing error: {}", e),
                }

                self.cleanup_if_needed().await;

                if let Some(driver) = &self.retry_driver {
                    let driver = driver.clone();
                    if let Err(e) = run_blocking(move || driver.requeue_due()).await {
                        tracing::error!("Retry driver error: {}", e);
                    }
                }

                sleep(interval).await;
            }
        }
        .instrument(tracing::info_span!("queue_processor"))
        .await;

        tracing::info!("Queue processor stopped");
        Ok(())
    }

    /// Ask the loop to stop after its current iteration.
    pub fn stop_processing(&self) {
        self.running.store(false, Ordering::SeqCst);
        tracing::info!("Queue processor stopping");
    }

    /// Dequeue one batch and attempt delivery of each entry.
    ///
    /// Only a failure to dequeue is returned as an error. Delivery failures,
    /// handler errors and handler panics are recorded on the entry.
    /// `delivered` and `failed` count only results that were persisted.
    pub async fn process_batch(&self) -> Result<BatchReport> {
        let queue = Arc::clone(&self.queue);
        let batch_size = self.batch_size;
        let batch = run_blocking(move || queue.dequeue(batch_size)).await?;
        let mut report = BatchReport {
            dequeued: batch.len(),
            ..BatchReport::default()
        };

        for entry in batch {
            if !entry.has_message() {
                tracing::warn!(
                    "Entry {} has no message, leaving it PROCESSING for inspection",
                    entry.queue_id
                );
                report.skipped += 1;
                continue;
            }

            let outcome = self.attempt(&entry).await;
            let delivered = outcome.is_ok();

            let queue = Arc::clone(&self.queue);
            let queue_id = entry.queue_id.clone();
            let recorded = run_blocking(move || match outcome {
                Ok(()) => queue.mark_delivered(&queue_id),
                Err(reason) => queue.mark_failed(&queue_id, &reason),
            })
            .await;

            match recorded {
                Ok(true) if delivered => report.delivered += 1,
                Ok(true) => report.failed += 1,
                Ok(false) => tracing::warn!(
                    "Result for {} not recorded: entry is gone or already final",
                    entry.queue_id
                ),
                Err(e) => tracing::error!("Failed to record result for {}: {}", entry.queue_id, e),
            }
        }

        Ok(report)
    }

    /// Run `cleanup_expired` if the cleanup interval has passed since the last run.
    ///
    /// Returns the number removed, or `None` when no cleanup was due.
    pub async fn cleanup_if_needed(&self) -> Option<usize> {
        {
            let mut last_cleanup = self.last_cleanup.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(last) = *last_cleanup {
                if last.elapsed() < self.cleanup_interval {
                    return None;
                }
            }
            *last_cleanup = Some(Instant::now());
        }

        let queue = Arc::clone(&self.queue);
        match run_blocking(move || queue.cleanup_expired()).await {
            Ok(removed) => {
                if removed > 0 {
                    tracing::info!("Cleaned up {} expired entries", removed);
                }
                Some(removed)
            }
            Err(e) => {
                tracing::error!("Cleanup failed: {}", e);
                Some(0)
            }
        }
    }

    /// One delivery attempt. `Err` carries the reason recorded on the entry.
    ///
    /// The handler runs in its own task so that a panic surfaces as a
    /// `JoinError` here instead of unwinding through the loop.
    async fn attempt(&self, entry: &QueueEntry) -> std::result::Result<(), String> {
        let handler = Arc::clone(&self.handler);
        let message = entry.message.clone();

        match tokio::spawn(async move { handler.deliver(&message).await }).await {
            Ok(Ok(DeliveryOutcome::Delivered)) => {
                tracing::debug!("Delivered {}", entry.queue_id);
                Ok(())
            }
            Ok(Ok(DeliveryOutcome::Rejected(reason))) => {
                tracing::warn!("Delivery of {} rejected: {}", entry.queue_id, reason);
                Err(reason)
            }
            Ok(Err(e)) => {
                tracing::error!("Delivery of {} errored: {}", entry.queue_id, e);
                Err(e.to_string())
            }
            Err(e) => {
                tracing::error!("Delivery handler panicked on {}: {}", entry.queue_id, e);
                Err(format!("delivery handler panicked: {}", e))
            }
        }
    }
}

/// Run queue file work on the blocking pool.
///
/// Queue operations do synchronous file I/O and may wait on a lock file, so
/// they stay off the async worker threads.
async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Other(format!("Queue task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::core::EntryStatus;
    use crate::processor::delivery::FnDelivery;
    use crate::processor::retry::RetryPolicy;
    use crate::storage::{FileLockManager, FileQueuePersistence, LockManager};
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn queue(temp_dir: &TempDir) -> Arc<MessageQueue> {
        Arc::new(MessageQueue::new(QueueConfig::with_directory(temp_dir.path())))
    }

    struct Scripted;

    #[async_trait]
    impl DeliveryHandler for Scripted {
        async fn deliver(&self, message: &Value) -> Result<DeliveryOutcome> {
            match message["mode"].as_str() {
                Some("reject") => Ok(DeliveryOutcome::rejected("recipient offline")),
                Some("error") => Err(Error::Delivery("socket closed".to_string())),
                Some("panic") => panic!("handler bug"),
                _ => Ok(DeliveryOutcome::Delivered),
            }
        }
    }

    #[tokio::test]
    async fn test_all_delivered() {
        let temp_dir = TempDir::new().unwrap();
        let queue = queue(&temp_dir);
        for i in 0..5 {
            queue.enqueue(json!({"n": i})).unwrap();
        }

        let processor = AsyncQueueProcessor::new(Arc::clone(&queue), Arc::new(FnDelivery::new(|_| true)));
        let report = processor.process_batch().await.unwrap();

        assert_eq!(report.dequeued, 5);
        assert_eq!(report.delivered, 5);
        assert!(queue.list(None).iter().all(|e| e.status == EntryStatus::Delivered));
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        crate::logging::init_test();
        let temp_dir = TempDir::new().unwrap();
        let queue = queue(&temp_dir);
        let ok = queue.enqueue(json!({"mode": "ok"})).unwrap();
        let rejected = queue.enqueue(json!({"mode": "reject"})).unwrap();
        let errored = queue.enqueue(json!({"mode": "error"})).unwrap();
        let panicked = queue.enqueue(json!({"mode": "panic"})).unwrap();

        let processor = AsyncQueueProcessor::new(Arc::clone(&queue), Arc::new(Scripted));
        let report = processor.process_batch().await.unwrap();

        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 3);
        assert_eq!(queue.get(&ok).unwrap().status, EntryStatus::Delivered);

        let rejected = queue.get(&rejected).unwrap();
        assert_eq!(rejected.status, EntryStatus::Failed);
        assert_eq!(rejected.last_error(), Some("recipient offline"));

        let errored = queue.get(&errored).unwrap();
        assert_eq!(errored.status, EntryStatus::Failed);
        assert!(errored.last_error().unwrap().contains("socket closed"));

        let panicked = queue.get(&panicked).unwrap();
        assert_eq!(panicked.status, EntryStatus::Failed);
        assert_eq!(panicked.delivery_attempts(), 1);
        assert!(panicked.last_error().unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn test_false_result_marks_failed() {
        let temp_dir = TempDir::new().unwrap();
        let queue = queue(&temp_dir);
        let id = queue.enqueue(json!("x")).unwrap();

        let processor = AsyncQueueProcessor::new(Arc::clone(&queue), Arc::new(FnDelivery::new(|_| false)));
        processor.process_batch().await.unwrap();

        let entry = queue.get(&id).unwrap();
        assert_eq!(entry.status, EntryStatus::Failed);
        assert_eq!(entry.delivery_attempts(), 1);
    }

    #[tokio::test]
    async fn test_missing_message_left_processing() {
        let temp_dir = TempDir::new().unwrap();
        let queue = queue(&temp_dir);
        let id = queue.enqueue(Value::Null).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler = FnDelivery::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });

        let processor = AsyncQueueProcessor::new(Arc::clone(&queue), Arc::new(handler));
        let report = processor.process_batch().await.unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(queue.get(&id).unwrap().status, EntryStatus::Processing);
    }

    #[tokio::test]
    async fn test_batch_size_limits_dequeue() {
        let temp_dir = TempDir::new().unwrap();
        let queue = queue(&temp_dir);
        for i in 0..5 {
            queue.enqueue(json!(i)).unwrap();
        }

        let processor = AsyncQueueProcessor::new(Arc::clone(&queue), Arc::new(FnDelivery::new(|_| true)))
            .with_batch_size(2);

        assert_eq!(processor.process_batch().await.unwrap().delivered, 2);
        assert_eq!(queue.list(Some(EntryStatus::Pending)).len(), 3);
    }

    #[tokio::test]
    async fn test_unrecorded_result_not_counted() {
        let temp_dir = TempDir::new().unwrap();
        let queue = queue(&temp_dir);
        let id = queue.enqueue(json!("x")).unwrap();

        // Damage the queue file during delivery so the result cannot be saved
        let path = queue.persistence().path().to_path_buf();
        let handler = FnDelivery::new(move |_| {
            std::fs::write(&path, "[{").unwrap();
            true
        });

        let processor = AsyncQueueProcessor::new(Arc::clone(&queue), Arc::new(handler));
        let report = processor.process_batch().await.unwrap();

        assert_eq!(report.dequeued, 1);
        assert_eq!(report.delivered, 0);
        assert_eq!(report.failed, 0);
        assert!(queue.get(&id).is_none());
    }

    #[tokio::test]
    async fn test_held_lock_does_not_block_runtime() {
        let temp_dir = TempDir::new().unwrap();
        let config = QueueConfig::with_directory(temp_dir.path());
        let persistence = FileQueuePersistence::new(config.queue_file()).with_lock_manager(Arc::new(
            FileLockManager::new().with_acquire_timeout(Duration::from_millis(200)),
        ));
        let queue = Arc::new(MessageQueue::with_persistence(config, Arc::new(persistence)));
        queue.enqueue(json!("x")).unwrap();

        // Another process holds the queue lock
        let held = FileLockManager::new().acquire(queue.persistence().path()).unwrap();

        let processor = AsyncQueueProcessor::new(Arc::clone(&queue), Arc::new(FnDelivery::new(|_| true)));
        let started = Instant::now();
        let result = tokio::time::timeout(Duration::from_millis(50), processor.process_batch()).await;

        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_millis(150));

        // Let the abandoned attempt give up on the lock before releasing it
        sleep(Duration::from_millis(400)).await;
        drop(held);
        let report = processor.process_batch().await.unwrap();
        assert_eq!(report.delivered, 1);
    }

    #[tokio::test]
    async fn test_cleanup_if_needed() {
        let temp_dir = TempDir::new().unwrap();
        let queue = queue(&temp_dir);
        let old = crate::core::QueueEntry::new_at(json!("old"), 0.5, Utc::now() - chrono::Duration::days(30));
        queue.persistence().save_entries(&[old]).unwrap();

        let processor = AsyncQueueProcessor::new(Arc::clone(&queue), Arc::new(FnDelivery::new(|_| true)));

        assert_eq!(processor.cleanup_if_needed().await, Some(1));
        assert_eq!(processor.cleanup_if_needed().await, None);

        let processor = processor.with_cleanup_interval(Duration::ZERO);
        assert_eq!(processor.cleanup_if_needed().await, Some(0));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let temp_dir = TempDir::new().unwrap();
        let queue = queue(&temp_dir);
        for i in 0..3 {
            queue.enqueue(json!(i)).unwrap();
        }

        let processor = Arc::new(AsyncQueueProcessor::new(
            Arc::clone(&queue),
            Arc::new(FnDelivery::new(|_| true)),
        ));
        let runner = Arc::clone(&processor);
        let task = tokio::spawn(async move { runner.start_processing(Duration::from_millis(10)).await });

        for _ in 0..200 {
            if queue.list(Some(EntryStatus::Delivered)).len() == 3 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(processor.is_running());
        assert!(processor.start_processing(Duration::from_millis(10)).await.is_err());

        processor.stop_processing();
        task.await.unwrap().unwrap();

        assert!(!processor.is_running());
        assert_eq!(queue.list(Some(EntryStatus::Delivered)).len(), 3);
    }

    #[tokio::test]
    async fn test_retry_driver_redelivers() {
        let temp_dir = TempDir::new().unwrap();
        let queue = queue(&temp_dir);
        let id = queue.enqueue(json!("flaky")).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler = FnDelivery::new(move |_| counter.fetch_add(1, Ordering::SeqCst) > 0);

        let policy = RetryPolicy {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_attempts: 3,
        };
        let processor = AsyncQueueProcessor::new(Arc::clone(&queue), Arc::new(handler))
            .with_retry_driver(RetryDriver::new(Arc::clone(&queue), policy));
        let stop = processor.stop_handle();

        let processor = Arc::new(processor);
        let runner = Arc::clone(&processor);
        let task = tokio::spawn(async move { runner.start_processing(Duration::from_millis(5)).await });

        for _ in 0..200 {
            if queue.get(&id).map(|e| e.status) == Some(EntryStatus::Delivered) {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        stop.stop();
        task.await.unwrap().unwrap();

        let entry = queue.get(&id).unwrap();
        assert_eq!(entry.status, EntryStatus::Delivered);
        assert_eq!(entry.delivery_attempts(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
