//! Storage layer - whole-file persistence and the locks guarding it.

pub mod lock;
pub mod persistence;

pub use lock::{FileLockManager, LockGuard, LockHandle, LockManager, NoopLockManager};
pub use persistence::FileQueuePersistence;
