//! Whole-file JSON persistence for queue entries.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;

use crate::core::QueueEntry;
use crate::error::{Error, Result};

use super::lock::{LockManager, NoopLockManager};

/// Durable storage of the full entry set as one JSON array.
#[derive(Debug)]
pub struct FileQueuePersistence {
    path: PathBuf,
    mutex: Mutex<()>,
    lock_manager: Arc<dyn LockManager>,
}

impl FileQueuePersistence {
    /// Persistence at `path` with in-process locking only.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mutex: Mutex::new(()),
            lock_manager: Arc::new(NoopLockManager),
        }
    }

    /// Add a cross-process lock manager on top of the in-process mutex.
    pub fn with_lock_manager(mut self, lock_manager: Arc<dyn LockManager>) -> Self {
        self.lock_manager = lock_manager;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all entries in file order.
    ///
    /// Never fails: a missing file is an empty queue, an unreadable or
    /// malformed file is logged and treated as empty, and individual entries
    /// that do not parse are skipped. Only for read-only callers; anything
    /// that saves what it loaded uses [`Self::load_entries_for_update`].
    pub fn load_entries(&self) -> Vec<QueueEntry> {
        let raw = match self.read_raw() {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("{}, treating queue as empty", e);
                return Vec::new();
            }
        };

        let mut seen = HashSet::with_capacity(raw.len());
        let mut entries = Vec::with_capacity(raw.len());

        for (index, value) in raw.into_iter().enumerate() {
            match serde_json::from_value::<QueueEntry>(value) {
                Ok(entry) => {
                    if seen.insert(entry.queue_id.clone()) {
                        entries.push(entry);
                    } else {
                        tracing::warn!("Skipping duplicate queue entry {}", entry.queue_id);
                    }
                }
                Err(e) => {
                    tracing::warn!("Skipping unparseable queue entry #{}: {}", index, e);
                }
            }
        }

        entries
    }

    /// Load all entries for a read-modify-write.
    ///
    /// A missing or blank file is an empty queue. A file that cannot be read,
    /// is not a JSON array, or holds an entry that does not parse is an
    /// `Error::Persistence`, so the caller never saves over data it could not see.
    pub fn load_entries_for_update(&self) -> Result<Vec<QueueEntry>> {
        let raw = self.read_raw()?;

        let mut seen = HashSet::with_capacity(raw.len());
        let mut entries = Vec::with_capacity(raw.len());

        for (index, value) in raw.into_iter().enumerate() {
            let entry = serde_json::from_value::<QueueEntry>(value).map_err(|e| {
                Error::Persistence(format!(
                    "Queue file {} has an unparseable entry #{}: {}",
                    self.path.display(),
                    index,
                    e
                ))
            })?;
            if seen.insert(entry.queue_id.clone()) {
                entries.push(entry);
            } else {
                return Err(Error::Persistence(format!(
                    "Queue file {} has duplicate entry {}",
                    self.path.display(),
                    entry.queue_id
                )));
            }
        }

        Ok(entries)
    }

    /// Raw array from the queue file; empty when the file is missing or blank.
    fn read_raw(&self) -> Result<Vec<Value>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::Persistence(format!(
                    "Failed to read queue file {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        if content.trim().is_empty() {
            return Ok(Vec::new());
        }

        serde_json::from_str(&content).map_err(|e| {
            Error::Persistence(format!(
                "Queue file {} is not a JSON array: {}",
                self.path.display(),
                e
            ))
        })
    }

    /// Persist the full entry set, replacing the file.
    ///
    /// Writes a sibling temp file and renames it over the queue file, so a
    /// crash mid-write leaves the previous contents intact.
    pub fn save_entries(&self, entries: &[QueueEntry]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let content = serde_json::to_string_pretty(entries)?;
        let tmp_path = self.temp_path();

        let written = File::create(&tmp_path).and_then(|mut file| {
            file.write_all(content.as_bytes())?;
            file.sync_all()
        });
        if let Err(e) = written.and_then(|()| fs::rename(&tmp_path, &self.path)) {
            fs::remove_file(&tmp_path).ok();
            return Err(Error::Persistence(format!(
                "Failed to write {}: {}",
                self.path.display(),
                e
            )));
        }

        tracing::trace!("Saved {} entries to {}", entries.len(), self.path.display());
        Ok(())
    }

    /// Run `f` while holding both the in-process mutex and the lock manager's lock.
    ///
    /// Both locks are released on every exit path, including when `f` errors.
    /// `f` must not call `atomic_operation` on the same persistence again.
    pub fn atomic_operation<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Self) -> Result<T>,
    {
        let _local = self.mutex.lock().unwrap_or_else(PoisonError::into_inner);
        let _shared = self.lock_manager.acquire(&self.path)?;
        f(self)
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".{}.tmp", std::process::id()));
        self.path.with_file_name(name)
    }
}
