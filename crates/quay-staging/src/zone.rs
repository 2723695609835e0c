//! Staging zone data model.

use std::time::Duration;

use quay_types::{Cid, ContentId, GroupKey, ZoneId};
use tokio::time::Instant;

/// Lifecycle state of a staging zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ZoneState {
    /// Accepting new content.
    Open,
    /// Closed for appends, waiting to be sealed into a deal.
    Full,
    /// Handed to deal making. Terminal.
    Sealed,
}

/// Content to stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentItem {
    /// Content record id.
    pub content_id: ContentId,
    /// Root of the content's DAG.
    pub cid: Cid,
    /// Size in bytes.
    pub size: u64,
}

/// Content held by a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagedItem {
    /// Content record id.
    pub content_id: ContentId,
    /// Root of the content's DAG.
    pub cid: Cid,
    /// Size in bytes.
    pub size: u64,
    /// When the item was added.
    pub added_at: Instant,
}

/// A bucket of content destined for one deal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingZone {
    /// Process-unique id.
    pub id: ZoneId,
    /// Group the zone stages content for.
    pub group: GroupKey,
    /// Lifecycle state.
    pub state: ZoneState,
    /// Items in append order.
    pub items: Vec<StagedItem>,
    /// Sum of item sizes.
    pub total_size: u64,
    /// When the zone was created.
    pub created_at: Instant,
    /// When the zone was sealed.
    pub sealed_at: Option<Instant>,
}

impl StagingZone {
    pub(crate) fn new(id: ZoneId, group: GroupKey, created_at: Instant) -> Self {
        Self {
            id,
            group,
            state: ZoneState::Open,
            items: Vec::new(),
            total_size: 0,
            created_at,
            sealed_at: None,
        }
    }

    pub(crate) fn push(&mut self, item: ContentItem, now: Instant) {
        self.total_size += item.size;
        self.items.push(StagedItem {
            content_id: item.content_id,
            cid: item.cid,
            size: item.size,
            added_at: now,
        });
    }

    /// Number of staged items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the zone holds no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Age of the zone at `now`.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    /// Whether the zone has outlived `max_lifetime` at `now`.
    pub fn is_expired(&self, now: Instant, max_lifetime: Duration) -> bool {
        self.age(now) >= max_lifetime
    }
}
