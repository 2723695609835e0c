//! Content check queue.
//!
//! Content records are periodically re-checked (is it pinned, does it need
//! a deal, is it staged). [`QueueManager`] feeds those checks into a bounded
//! channel consumed through a [`CheckReceiver`]:
//!
//! - an id already waiting in the channel is coalesced, never duplicated;
//! - a full channel is reported as [`QueueError::Backpressure`], enqueueing
//!   never blocks;
//! - [`QueueManager::enqueue_after`] schedules a delayed re-check.

mod error;
mod manager;


pub use error::QueueError;
pub use manager::{CheckReceiver, Enqueued, QueueManager};
