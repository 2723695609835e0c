//! Orchestrator tying all Quay components together.
//!
//! The [`Orchestrator`] owns the peer prober, the deduplication registries,
//! the staging zones, the check queue and the shuttle registry, and applies
//! shuttle messages to them.

pub mod error;
pub mod orchestrator;

pub use error::EngineError;
pub use orchestrator::{Orchestrator, OrchestratorConfig};
