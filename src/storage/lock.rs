//! Lock managers guarding the queue file.
//!
//! The persistence layer always serializes callers inside one process with its
//! own mutex. A [`LockManager`] adds a second, optional layer for callers in
//! other processes sharing the same queue directory.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use crate::error::{Error, Result};

/// Held while the lock is owned; dropping it releases the lock.
pub trait LockGuard: Send {}

impl<T: Send> LockGuard for T {}

/// Boxed guard returned by [`LockManager::acquire`].
pub type LockHandle = Box<dyn LockGuard>;

/// Pluggable lock acquisition for a resource path.
pub trait LockManager: Send + Sync + std::fmt::Debug {
    fn acquire(&self, resource: &Path) -> Result<LockHandle>;
}

/// No cross-process locking; relies on the in-process mutex only.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLockManager;

impl LockManager for NoopLockManager {
    fn acquire(&self, _resource: &Path) -> Result<LockHandle> {
        Ok(Box::new(()))
    }
}

/// Cross-process lock based on a `<resource>.lock` file holding the owner pid.
#[derive(Debug, Clone)]
pub struct FileLockManager {
    acquire_timeout: Duration,
    retry_interval: Duration,
    stale_after: Duration,
}

impl Default for FileLockManager {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(5),
            retry_interval: Duration::from_millis(25),
            stale_after: Duration::from_secs(30),
        }
    }
}

impl FileLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Lock file path for a resource.
    pub fn lock_path(resource: &Path) -> PathBuf {
        let mut name = resource
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        resource.with_file_name(name)
    }

    /// One attempt at taking the lock.
    fn try_acquire(&self, lock_path: &Path) -> Result<Option<FileLock>> {
        match OpenOptions::new().write(true).create_new(true).open(lock_path) {
            Ok(mut file) => {
                let lock = FileLock {
                    lock_path: lock_path.to_path_buf(),
                };
                write_owner(&mut file)?;
                tracing::trace!("Acquired lock: {}", lock_path.display());
                Ok(Some(lock))
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if self.is_stale(lock_path) {
                    self.break_stale(lock_path);
                }
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a lock judged stale.
    ///
    /// The lock is first renamed to a name only this caller knows, then
    /// checked again. If another process replaced it with a fresh lock in
    /// between, that lock is linked back into place instead of deleted.
    fn break_stale(&self, lock_path: &Path) {
        let aside = lock_path.with_extension(format!(
            "lock.stale.{}.{}",
            std::process::id(),
            ulid::Ulid::new()
        ));
        if std::fs::rename(lock_path, &aside).is_err() {
            // Already broken or released by someone else
            return;
        }

        if self.is_stale(&aside) {
            tracing::warn!("Removed stale lock: {}", lock_path.display());
        } else if let Err(e) = std::fs::hard_link(&aside, lock_path) {
            tracing::warn!("Could not restore live lock {}: {}", lock_path.display(), e);
        }
        std::fs::remove_file(&aside).ok();
    }

    fn is_stale(&self, lock_path: &Path) -> bool {
        let modified = match lock_path.metadata().and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(_) => return false,
        };
        SystemTime::now()
            .duration_since(modified)
            .map_or(false, |age| age >= self.stale_after)
    }
}

impl LockManager for FileLockManager {
    fn acquire(&self, resource: &Path) -> Result<LockHandle> {
        let lock_path = Self::lock_path(resource);
        if let Some(parent) = lock_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let deadline = Instant::now() + self.acquire_timeout;
        loop {
            if let Some(lock) = self.try_acquire(&lock_path)? {
                return Ok(Box::new(lock));
            }
            if Instant::now() >= deadline {
                return Err(Error::Lock(format!(
                    "Timed out after {:?} waiting for {}",
                    self.acquire_timeout,
                    lock_path.display()
                )));
            }
            std::thread::sleep(self.retry_interval);
        }
    }
}

fn write_owner(file: &mut File) -> Result<()> {
    file.write_all(format!("{}\n", std::process::id()).as_bytes())?;
    file.sync_all()?;
    Ok(())
}

/// Lock file guard - removes the lock file when dropped.
#[derive(Debug)]
struct FileLock {
    lock_path: PathBuf,
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.lock_path) {
            tracing::warn!("Failed to release lock {}: {}", self.lock_path.display(), e);
        } else {
            tracing::trace!("Released lock: {}", self.lock_path.display());
        }
    }
}
