//! Error types for peer probing.

use std::time::Duration;

use quay_types::PeerId;

/// Why a single probe produced no RTT.
///
/// [`PeerProber::ping_many`](crate::PeerProber::ping_many) absorbs these;
/// only [`PeerProber::ping_one`](crate::PeerProber::ping_one) surfaces them.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// The peer did not answer within the per-peer timeout.
    #[error("ping to {peer} timed out after {after:?}")]
    Timeout {
        /// The probed peer.
        peer: PeerId,
        /// The timeout that elapsed.
        after: Duration,
    },

    /// The probe failed at the network layer.
    #[error("network error: {0}")]
    Net(#[from] quay_net::NetError),
}
