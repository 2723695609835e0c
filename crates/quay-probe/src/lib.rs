//! Peer latency probing for Quay.
//!
//! This crate provides:
//!
//! - [`PeerProber`]: pings candidate peers with bounded parallelism and a
//!   per-peer timeout, dropping the ones that do not answer.
//! - [`PingManyResult`]: the RTTs of one probing round, with
//!   [`PingManyResult::top_peers`] to pick the fastest peers.

mod error;
mod prober;
mod result;


pub use error::ProbeError;
pub use prober::PeerProber;
pub use result::PingManyResult;
