//! msgqueue library root.

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod processor;
pub mod stats;
pub mod storage;

pub use cli::Commands;
pub use config::{load_config, QueueConfig};
pub use core::{EntryStatus, MessageQueue, PriorityHint, PriorityLevel, QueueEntry};
pub use error::{Error, Result};
pub use processor::{AsyncQueueProcessor, DeliveryHandler, DeliveryOutcome, RetryDriver};
pub use stats::{HealthStatus, QueueStatistics};
pub use storage::FileQueuePersistence;
