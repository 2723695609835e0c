//! Error types for the shuttle registry and RPC ingress.

use quay_types::ShuttleHandle;

/// Errors returned by shuttle operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShuttleError {
    /// A live shuttle is already registered under this handle.
    #[error("shuttle {0} is already connected")]
    DuplicateShuttle(ShuttleHandle),

    /// No shuttle is registered under this handle.
    #[error("shuttle {0} not found")]
    ShuttleNotFound(ShuttleHandle),

    /// The shuttle's outbound channel is closed.
    #[error("shuttle {0} is disconnected")]
    ShuttleDisconnected(ShuttleHandle),

    /// The shuttle's outbound channel is full.
    #[error("outbound channel to shuttle {0} is full")]
    Backpressure(ShuttleHandle),

    /// The inbound RPC channel is full; the message was dropped.
    #[error("rpc ingress full, message dropped ({dropped} dropped so far)")]
    IngressFull {
        /// Total messages dropped since startup, this one included.
        dropped: u64,
    },

    /// The inbound RPC channel has no consumer any more.
    #[error("rpc ingress closed")]
    IngressClosed,
}
