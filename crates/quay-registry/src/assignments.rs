//! Work handed to each shuttle.
//!
//! Pin requests and retrievals are recorded against the shuttle they were
//! sent to, so a shuttle that goes away releases exactly its own work and a
//! report from one shuttle never settles work handed to another.

use std::collections::HashMap;
use std::sync::Mutex;

use quay_types::{Cid, ContentId, ShuttleHandle};

/// Work taken back from a shuttle that went away.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleasedWork {
    /// Outstanding pin requests, one entry per request.
    pub pins: Vec<(ContentId, Cid)>,
    /// Retrievals the shuttle was running, in id order.
    pub retrievals: Vec<ContentId>,
}

impl ReleasedWork {
    /// Whether nothing was outstanding.
    pub fn is_empty(&self) -> bool {
        self.pins.is_empty() && self.retrievals.is_empty()
    }
}

#[derive(Default)]
struct Assignments {
    pins: HashMap<ShuttleHandle, Vec<(ContentId, Cid)>>,
    retrievals: HashMap<ContentId, ShuttleHandle>,
}

/// Which shuttle holds which pin requests and retrievals.
#[derive(Default)]
pub struct ShuttleAssignments {
    inner: Mutex<Assignments>,
}

impl ShuttleAssignments {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a pin request sent to `shuttle`.
    pub fn assign_pin(&self, shuttle: &ShuttleHandle, content_id: ContentId, cid: Cid) {
        let mut inner = self.inner.lock().expect("assignments lock poisoned");
        inner
            .pins
            .entry(shuttle.clone())
            .or_default()
            .push((content_id, cid));
    }

    /// Settle one pin request of `cid` held by `shuttle`.
    ///
    /// Returns `false` if the shuttle holds no such request.
    pub fn finish_pin(&self, shuttle: &ShuttleHandle, cid: Cid) -> bool {
        let mut inner = self.inner.lock().expect("assignments lock poisoned");
        let Some(pins) = inner.pins.get_mut(shuttle) else {
            return false;
        };
        let Some(pos) = pins.iter().position(|(_, c)| *c == cid) else {
            return false;
        };
        pins.swap_remove(pos);
        if pins.is_empty() {
            inner.pins.remove(shuttle);
        }
        true
    }

    /// Number of pin requests `shuttle` holds.
    pub fn pin_count(&self, shuttle: &ShuttleHandle) -> usize {
        self.inner
            .lock()
            .expect("assignments lock poisoned")
            .pins
            .get(shuttle)
            .map_or(0, Vec::len)
    }

    /// Record that `shuttle` runs the retrieval of `content_id`.
    pub fn assign_retrieval(&self, shuttle: &ShuttleHandle, content_id: ContentId) {
        self.inner
            .lock()
            .expect("assignments lock poisoned")
            .retrievals
            .insert(content_id, shuttle.clone());
    }

    /// Shuttle running the retrieval of `content_id`.
    pub fn retrieval_owner(&self, content_id: ContentId) -> Option<ShuttleHandle> {
        self.inner
            .lock()
            .expect("assignments lock poisoned")
            .retrievals
            .get(&content_id)
            .cloned()
    }

    /// Forget the retrieval of `content_id`, returning the shuttle that ran it.
    pub fn finish_retrieval(&self, content_id: ContentId) -> Option<ShuttleHandle> {
        self.inner
            .lock()
            .expect("assignments lock poisoned")
            .retrievals
            .remove(&content_id)
    }

    /// Take back everything `shuttle` holds.
    pub fn release(&self, shuttle: &ShuttleHandle) -> ReleasedWork {
        let mut inner = self.inner.lock().expect("assignments lock poisoned");
        let pins = inner.pins.remove(shuttle).unwrap_or_default();

        let mut retrievals: Vec<ContentId> = inner
            .retrievals
            .iter()
            .filter(|(_, owner)| *owner == shuttle)
            .map(|(id, _)| *id)
            .collect();
        for id in &retrievals {
            inner.retrievals.remove(id);
        }
        retrievals.sort();

        ReleasedWork { pins, retrievals }
    }
}

impl std::fmt::Debug for ShuttleAssignments {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("assignments lock poisoned");
        f.debug_struct("ShuttleAssignments")
            .field("shuttles_with_pins", &inner.pins.len())
            .field("retrievals", &inner.retrievals.len())
            .finish()
    }
}
