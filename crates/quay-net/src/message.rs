//! Protocol messages for the Quay network layer.
//!
//! All messages are serialized with postcard over QUIC streams.

use serde::{Deserialize, Serialize};
use quay_types::{ShuttleCommand, ShuttleHello, ShuttleMessage};

/// Protocol messages exchanged between the orchestrator, shuttles and probed peers.
///
/// Each message is sent as a length-prefixed postcard-encoded payload
/// over a QUIC stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuayMessage {
    /// Latency probe (bi-directional, expects [`QuayMessage::Pong`]).
    Ping {
        /// Timestamp (millis since epoch) when the ping was sent.
        timestamp: u64,
    },

    /// Answer to a [`QuayMessage::Ping`], echoing its timestamp.
    Pong {
        /// Timestamp of the ping being answered.
        timestamp: u64,
    },

    /// Shuttle registration (bi-directional, expects [`QuayMessage::HelloAck`]).
    Hello(ShuttleHello),

    /// Result of a [`QuayMessage::Hello`].
    HelloAck {
        /// Whether the shuttle is now registered.
        accepted: bool,
        /// Rejection reason, if any.
        reason: Option<String>,
    },

    /// Shuttle → orchestrator RPC (uni-directional).
    Shuttle(ShuttleMessage),

    /// Orchestrator → shuttle command (uni-directional).
    Command(ShuttleCommand),
}
