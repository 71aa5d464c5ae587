//! Core module - entry model, priorities and the message queue.
//!
//! This module contains the heart of msgqueue:
//! - Queue entries and their status machine
//! - Priority hints resolved at the enqueue boundary
//! - File-backed priority queue operations

pub mod entry;
pub mod priority;
pub mod queue;

pub use entry::{dequeue_order, EntryStatus, QueueEntry};
pub use priority::{PriorityHint, PriorityLevel, DEFAULT_PRIORITY};
pub use queue::MessageQueue;
