//! Peer address book with TTL-based expiry.
//!
//! Probed peers are added with a short TTL so a ping can route to them even
//! if they were never seen before; shuttles that dialled in are added
//! permanently. Expired entries are invisible to lookups and removed by
//! [`AddressBook::purge_expired`].

use std::collections::HashMap;
use std::sync::RwLock;

use quay_types::PeerId;
use tokio::time::{Duration, Instant};
use tracing::trace;

struct BookEntry {
    addr: iroh::EndpointAddr,
    /// `None` for permanent entries.
    expires_at: Option<Instant>,
}

impl BookEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }
}

/// Maps a [`PeerId`] to the [`iroh::EndpointAddr`] used to reach it.
#[derive(Default)]
pub struct AddressBook {
    entries: RwLock<HashMap<PeerId, BookEntry>>,
}

impl AddressBook {
    /// Create an empty address book.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an address that expires after `ttl`.
    ///
    /// A permanent entry for the same peer is left untouched; an existing
    /// temporary entry has its address replaced and its expiry extended.
    pub fn insert_temp(&self, peer: PeerId, addr: iroh::EndpointAddr, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        let mut entries = self.entries.write().expect("address book lock poisoned");

        match entries.get_mut(&peer) {
            Some(entry) if entry.expires_at.is_none() => {}
            Some(entry) => {
                entry.addr = addr;
                entry.expires_at = entry.expires_at.map(|t| t.max(expires_at));
            }
            None => {
                entries.insert(
                    peer,
                    BookEntry {
                        addr,
                        expires_at: Some(expires_at),
                    },
                );
            }
        }
        trace!(peer = %peer.fmt_short(), ttl_ms = ttl.as_millis(), "address added");
    }

    /// Add an address that never expires.
    pub fn insert_permanent(&self, peer: PeerId, addr: iroh::EndpointAddr) {
        self.entries
            .write()
            .expect("address book lock poisoned")
            .insert(
                peer,
                BookEntry {
                    addr,
                    expires_at: None,
                },
            );
    }

    /// Look up a live address for `peer`.
    pub fn get(&self, peer: &PeerId) -> Option<iroh::EndpointAddr> {
        let entries = self.entries.read().expect("address book lock poisoned");
        let entry = entries.get(peer)?;
        if entry.is_expired(Instant::now()) {
            return None;
        }
        Some(entry.addr.clone())
    }

    /// Forget a peer.
    pub fn remove(&self, peer: &PeerId) -> bool {
        self.entries
            .write()
            .expect("address book lock poisoned")
            .remove(peer)
            .is_some()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().expect("address book lock poisoned");
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        before - entries.len()
    }

    /// Number of entries, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.entries.read().expect("address book lock poisoned").len()
    }

    /// Whether the book is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for AddressBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressBook")
            .field("len", &self.len())
            .finish()
    }
}
