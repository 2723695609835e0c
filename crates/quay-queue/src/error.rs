//! Error types for the check queue.

/// Errors returned when enqueueing a check.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// The work channel is full. The caller decides whether to retry later.
    #[error("check queue full (capacity {capacity})")]
    Backpressure {
        /// Capacity of the work channel.
        capacity: usize,
    },

    /// The receiving side is gone.
    #[error("check queue closed")]
    Closed,
}
