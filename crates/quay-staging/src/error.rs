//! Error types for staging zones.

use quay_types::{ContentId, ZoneId};

/// Errors returned by staging operations.
#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    /// No zone with this id exists (or it was trimmed from history).
    #[error("zone {0} not found")]
    ZoneNotFound(ZoneId),

    /// The zone is already sealed.
    #[error("zone {0} is already sealed")]
    AlreadySealed(ZoneId),

    /// The zone is still open and has not reached its maximum lifetime.
    #[error("zone {0} is still open")]
    NotReady(ZoneId),

    /// Deal making is disabled and the zone has not reached its maximum
    /// lifetime.
    #[error("deal making is disabled, zone {0} cannot be sealed yet")]
    DealMakingDisabled(ZoneId),

    /// Another seal of this zone is waiting on the deal sink.
    #[error("zone {0} is already being sealed")]
    SealInProgress(ZoneId),

    /// Zero-sized content cannot be staged.
    #[error("content {0} has zero size")]
    EmptyItem(ContentId),

    /// A deal sink refused a zone.
    #[error("deal sink error: {0}")]
    Sink(String),
}
