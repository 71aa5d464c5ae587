//! Processing side of the queue: delivery handlers, the consumer loop and retries.

pub mod daemon;
pub mod delivery;
pub mod retry;

pub use daemon::{AsyncQueueProcessor, BatchReport, StopHandle};
pub use delivery::{DeliveryHandler, DeliveryOutcome, FnDelivery, OutboxDelivery};
pub use retry::{RetryDriver, RetryPolicy};
