//! Process-wide deduplication registries.
//!
//! Each registry owns its map behind its own lock and only exposes
//! operations that complete under that lock:
//!
//! - [`RetrievalRegistry`]: at most one retrieval per content record.
//! - [`InflightCids`]: reference counts of CIDs being fetched or processed.
//! - [`TransferStatusCache`]: bounded LRU of remote transfer statuses.
//! - [`ShuttleAssignments`]: pins and retrievals handed to each shuttle.

mod assignments;
mod error;
mod inflight;
mod retrieval;
mod transfer_cache;


pub use assignments::{ReleasedWork, ShuttleAssignments};
pub use error::RegistryError;
pub use inflight::InflightCids;
pub use quay_types::RetrievalOutcome;
pub use retrieval::{RetrievalProgress, RetrievalRegistry, RetrievalTicket};
pub use transfer_cache::{DEFAULT_TRANSFER_CACHE_CAPACITY, TransferStatusCache};
