//! Network protocol on iroh QUIC.
//!
//! This crate implements Quay's network layer on top of [iroh] QUIC connections:
//!
//! - [`QuayMessage`]: the wire protocol (postcard-serialized).
//! - [`QuayTransport`]: manages an iroh [`Endpoint`], connection pooling,
//!   request/response streams and latency probes.
//! - [`AddressBook`]: peer addresses with TTL-based expiry.
//! - [`Pinger`]: the probe primitive the peer prober is written against.
//!
//! [`Endpoint`]: iroh::Endpoint

mod address_book;
mod error;
mod message;
mod transport;

use std::time::Duration;

pub use address_book::AddressBook;
pub use error::NetError;
pub use message::QuayMessage;
pub use transport::{QuayTransport, decode_frame, encode_frame};

use quay_types::PeerId;

/// A single network probe: ping one peer and report its round-trip time.
///
/// Implementations resolve the peer through an [`AddressBook`]. Timeouts
/// are the caller's concern. Tests substitute a mock to avoid real
/// endpoints.
#[async_trait::async_trait]
pub trait Pinger: Send + Sync {
    /// Ping `peer` once and return the measured round-trip time.
    async fn ping(&self, peer: PeerId) -> Result<Duration, NetError>;
}

/// Default ALPN protocol identifier (no cluster secret).
pub const QUAY_ALPN: &[u8] = b"quay/0";

/// Derive a deployment-specific ALPN from a shared secret.
///
/// The ALPN is `quay/0/<first 16 hex chars of blake3(secret)>`. Shuttles
/// configured with a different secret fail the TLS handshake before any
/// application data is exchanged.
pub fn cluster_alpn(secret: &[u8]) -> Vec<u8> {
    let hash = blake3::hash(secret);
    let hex = hash.to_hex();
    format!("quay/0/{}", &hex[..16]).into_bytes()
}
