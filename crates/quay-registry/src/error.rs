//! Error types for the registries.

use quay_types::ContentId;

/// Errors returned by registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A retrieval for this content is already running.
    #[error("retrieval already in progress for {0}")]
    AlreadyInProgress(ContentId),
}
