//! Reference counts of CIDs that are currently being worked on.

use std::collections::HashMap;
use std::sync::Mutex;

use quay_types::Cid;

/// Counts how many tasks are working on each CID.
///
/// A CID with a count of zero has no entry.
#[derive(Debug, Default)]
pub struct InflightCids {
    counts: Mutex<HashMap<Cid, u32>>,
}

impl InflightCids {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the count for `cid` and return the new count.
    pub fn mark(&self, cid: Cid) -> u32 {
        let mut counts = self.counts.lock().expect("inflight lock poisoned");
        let count = counts.entry(cid).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    /// Decrement the count for `cid` and return the new count.
    ///
    /// Saturates at zero; reaching zero removes the entry. Clearing a CID
    /// that is not marked is a no-op.
    pub fn clear(&self, cid: Cid) -> u32 {
        let mut counts = self.counts.lock().expect("inflight lock poisoned");
        let Some(count) = counts.get_mut(&cid) else {
            return 0;
        };
        *count = count.saturating_sub(1);
        let remaining = *count;
        if remaining == 0 {
            counts.remove(&cid);
        }
        remaining
    }

    /// Current count for `cid`.
    pub fn count(&self, cid: Cid) -> u32 {
        self.counts
            .lock()
            .expect("inflight lock poisoned")
            .get(&cid)
            .copied()
            .unwrap_or(0)
    }

    /// Whether anything is working on `cid`.
    pub fn is_inflight(&self, cid: Cid) -> bool {
        self.count(cid) > 0
    }

    /// Number of distinct CIDs in flight.
    pub fn len(&self) -> usize {
        self.counts.lock().expect("inflight lock poisoned").len()
    }

    /// Whether nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
