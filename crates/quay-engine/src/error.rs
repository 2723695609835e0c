//! Error types for the orchestrator.

/// Errors that can occur during orchestrator operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Staging zone error.
    #[error("staging error: {0}")]
    Staging(#[from] quay_staging::StagingError),

    /// Check queue error.
    #[error("queue error: {0}")]
    Queue(#[from] quay_queue::QueueError),

    /// Registry error.
    #[error("registry error: {0}")]
    Registry(#[from] quay_registry::RegistryError),

    /// Shuttle error.
    #[error("shuttle error: {0}")]
    Shuttle(#[from] quay_shuttle::ShuttleError),
}
