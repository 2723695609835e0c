//! Shared types and identifiers for Quay.
//!
//! This crate defines the core types used across the Quay workspace:
//! identifiers ([`Cid`], [`PeerId`], [`ContentId`], [`ZoneId`], [`GroupKey`],
//! [`ShuttleHandle`], [`TransferId`]), the shuttle RPC vocabulary
//! ([`ShuttleMessage`], [`ShuttleCommand`], [`ShuttleHello`]),
//! and component configuration ([`ProbeConfig`], [`StagingConfig`],
//! [`QueueConfig`], [`ShuttleConfig`]).

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ID types
// ---------------------------------------------------------------------------

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        pub struct $name([u8; 32]);

        impl $name {
            /// Create an ID by hashing arbitrary data with BLAKE3.
            pub fn from_data(data: &[u8]) -> Self {
                Self(blake3::hash(data).into())
            }

            /// Return the raw 32-byte representation.
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Short hex prefix for log lines.
            pub fn fmt_short(&self) -> String {
                self.0[..5].iter().map(|b| format!("{b:02x}")).collect()
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for byte in &self.0 {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }
    };
}

macro_rules! define_seq_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        pub struct $name(pub u64);

        impl From<u64> for $name {
            fn from(n: u64) -> Self {
                Self(n)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

define_id!(
    /// Content-addressed identifier for a block or DAG root: `blake3(data)`.
    Cid
);

define_id!(
    /// Network identity of a peer or shuttle, derived from its iroh endpoint key.
    PeerId
);

define_seq_id!(
    /// Database identifier of a pinned content record.
    ContentId
);

define_seq_id!(
    /// Process-unique identifier of a staging zone.
    ZoneId
);

define_seq_id!(
    /// Logical group that content is staged under (a user or collection id).
    GroupKey
);

macro_rules! define_name {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Create from anything string-like.
            pub fn new(name: impl Into<String>) -> Self {
                Self(name.into())
            }

            /// Borrow the underlying string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

define_name!(
    /// Unique name a shuttle registers under.
    ShuttleHandle
);

define_name!(
    /// Identifier of a remote data transfer (a data-transfer channel id).
    TransferId
);

// ---------------------------------------------------------------------------
// Shuttle RPC vocabulary
// ---------------------------------------------------------------------------

/// Handshake a shuttle sends when it connects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShuttleHello {
    /// Name the shuttle registers under.
    pub handle: ShuttleHandle,
    /// Hostname the shuttle serves content from.
    pub hostname: String,
    /// Private shuttles only take work for their own users.
    pub private: bool,
}

/// Periodic health/workload report from a shuttle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShuttleStatus {
    /// Free bytes left in the shuttle's blockstore.
    pub blockstore_free: u64,
    /// Number of pins the shuttle holds.
    pub pin_count: u64,
    /// Number of pins waiting in the shuttle's own queue.
    pub pin_queue_len: u64,
    /// The shuttle reports it is running low on disk.
    pub space_low: bool,
}

/// Lifecycle of a remote data transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferState {
    /// Channel opened, no data moved yet.
    Requested,
    /// Data is flowing.
    Ongoing,
    /// Transfer finished successfully.
    Completed,
    /// Transfer failed.
    Failed,
    /// Transfer was cancelled by either side.
    Cancelled,
}

impl TransferState {
    /// Whether no further updates are expected.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Last known status of a remote data transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStatus {
    /// Current state.
    pub state: TransferState,
    /// Bytes sent so far.
    pub sent: u64,
    /// Free-form message from the shuttle (error text on failure).
    pub message: String,
}

/// How a retrieval ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetrievalOutcome {
    /// All content was fetched.
    Succeeded,
    /// The retrieval failed with the given reason.
    Failed(String),
    /// The retrieval was cancelled before it finished.
    Cancelled,
}

/// Messages a shuttle sends to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShuttleMessage {
    /// Health and workload report.
    Heartbeat(ShuttleStatus),
    /// A pin finished and the content is stored on the shuttle.
    PinComplete {
        /// Content record that was pinned.
        content_id: ContentId,
        /// Root of the pinned DAG.
        cid: Cid,
        /// Total size in bytes.
        size: u64,
    },
    /// A pin failed.
    PinFailed {
        /// Content record that failed.
        content_id: ContentId,
        /// Root of the DAG that failed to pin.
        cid: Cid,
        /// Why the pin failed.
        reason: String,
    },
    /// Status update for a data transfer the shuttle is running.
    TransferStatus {
        /// Which transfer.
        transfer_id: TransferId,
        /// Its latest status.
        status: TransferStatus,
    },
    /// Byte progress of a retrieval the shuttle is running.
    RetrievalProgress {
        /// Content being retrieved.
        content_id: ContentId,
        /// Bytes received so far.
        bytes: u64,
    },
    /// A retrieval stopped, successfully or not.
    RetrievalFinished {
        /// Content that was being retrieved.
        content_id: ContentId,
        /// How it ended.
        outcome: RetrievalOutcome,
    },
}

/// Commands the orchestrator sends to a shuttle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShuttleCommand {
    /// Pin content on the shuttle.
    AddPin {
        /// Content record to pin.
        content_id: ContentId,
        /// Root of the DAG.
        cid: Cid,
    },
    /// Retrieve content from the storage network.
    RetrieveContent {
        /// Content record to retrieve.
        content_id: ContentId,
        /// Root of the DAG.
        cid: Cid,
    },
    /// Stop a running retrieval. The shuttle answers with
    /// [`ShuttleMessage::RetrievalFinished`].
    CancelRetrieval {
        /// Content whose retrieval should stop.
        content_id: ContentId,
    },
    /// Drop a pin from the shuttle.
    Unpin {
        /// Content record to unpin.
        content_id: ContentId,
    },
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Peer probing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeConfig {
    /// Timeout for a single peer's ping.
    pub per_peer_timeout: Duration,
    /// Upper bound on a whole `ping_many` round.
    pub round_timeout: Duration,
    /// Maximum number of pings in flight at once.
    pub concurrency: usize,
    /// How long a probed peer's address stays in the address book.
    pub addr_ttl: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            per_peer_timeout: Duration::from_millis(1_000),
            round_timeout: Duration::from_secs(5),
            concurrency: 16,
            addr_ttl: Duration::from_secs(120),
        }
    }
}

/// Staging zone thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagingConfig {
    /// A zone whose aggregate size reaches this is full and ready for a deal.
    pub min_size: u64,
    /// Hard cap on a zone's aggregate size.
    pub max_size: u64,
    /// A zone holding this many items is full regardless of size.
    pub max_items: usize,
    /// A zone older than this is sealed even if it never filled up, and even
    /// while deal making is disabled.
    pub max_lifetime: Duration,
    /// Sealed zones remembered per group for listing.
    pub max_sealed_history: usize,
    /// How often the sealer looks for ready zones.
    pub seal_interval: Duration,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            min_size: 3_865_470_566,  // 3.6 GiB
            max_size: 33_285_996_544, // 31 GiB
            max_items: 10_000,
            max_lifetime: Duration::from_secs(8 * 3600),
            max_sealed_history: 32,
            seal_interval: Duration::from_secs(30),
        }
    }
}

/// Content check queue parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Capacity of the bounded work channel.
    pub capacity: usize,
    /// Delay before a check that hit a full channel is retried.
    pub retry_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 100_000,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Shuttle registry and RPC ingress parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShuttleConfig {
    /// A shuttle with no heartbeat for this long is no longer live.
    pub liveness_timeout: Duration,
    /// Capacity of each shuttle's outbound command channel.
    pub outbound_capacity: usize,
    /// Capacity of the shared inbound RPC channel.
    pub ingress_capacity: usize,
}

impl Default for ShuttleConfig {
    fn default() -> Self {
        Self {
            liveness_timeout: Duration::from_secs(60),
            outbound_capacity: 1_024,
            ingress_capacity: 10_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
