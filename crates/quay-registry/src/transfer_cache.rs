//! Bounded cache of remote transfer statuses.
//!
//! Shuttles report transfer progress asynchronously. The last status of
//! each transfer is kept here so status queries do not have to round-trip
//! to the shuttle. The cache is bounded by entry count; when full, the
//! least recently accessed transfer is evicted.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use quay_types::{TransferId, TransferStatus};
use tracing::trace;

/// Default number of transfer statuses kept.
pub const DEFAULT_TRANSFER_CACHE_CAPACITY: usize = 50_000;

/// Thread-safe LRU cache of [`TransferStatus`] keyed by [`TransferId`].
pub struct TransferStatusCache {
    capacity: usize,
    /// `None` when caching is disabled.
    inner: Option<Mutex<LruCache<TransferId, TransferStatus>>>,
}

impl TransferStatusCache {
    /// Create a cache holding at most `capacity` statuses.
    ///
    /// A `capacity` of 0 disables caching entirely.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
        }
    }

    /// Store the latest status of a transfer, evicting the least recently
    /// used entry if the cache is full.
    pub fn put(&self, id: TransferId, status: TransferStatus) {
        let Some(inner) = &self.inner else {
            return;
        };

        let mut cache = inner.lock().expect("transfer cache lock poisoned");
        if let Some((evicted, _)) = cache.push(id.clone(), status)
            && evicted != id
        {
            trace!(%evicted, "evicted transfer status");
        }
    }

    /// Look up a transfer status and promote it to most-recently-used.
    pub fn get(&self, id: &TransferId) -> Option<TransferStatus> {
        let inner = self.inner.as_ref()?;
        inner
            .lock()
            .expect("transfer cache lock poisoned")
            .get(id)
            .cloned()
    }

    /// Current number of cached statuses.
    pub fn len(&self) -> usize {
        self.inner.as_ref().map_or(0, |inner| {
            inner.lock().expect("transfer cache lock poisoned").len()
        })
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of statuses kept.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for TransferStatusCache {
    fn default() -> Self {
        Self::new(DEFAULT_TRANSFER_CACHE_CAPACITY)
    }
}

impl std::fmt::Debug for TransferStatusCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferStatusCache")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}
