//! Shuttle connections for Quay.
//!
//! Shuttles are remote workers that hold and move content on the
//! orchestrator's behalf. This crate tracks them:
//!
//! - [`ShuttleRegistry`]: connected shuttles, their liveness and
//!   outbound command channels.
//! - [`RpcIngress`]: the shared bounded channel carrying shuttle messages
//!   to the orchestrator.

mod error;
mod ingress;
mod registry;


pub use error::ShuttleError;
pub use ingress::{InboundMessage, IngressReceiver, RpcIngress};
pub use registry::{ShuttleInfo, ShuttleRegistry};
