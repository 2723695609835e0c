//! Staging zone manager.
//!
//! Content is bucketed per [`GroupKey`]. Each group has at most one `Open`
//! zone; when it cannot take another item it becomes `Full` and a new zone
//! is opened. `Full` zones are sealed into deals unless the
//! [`DealCircuitBreaker`] is set. A zone older than `max_lifetime` is
//! sealed regardless, so content never waits indefinitely.
//!
//! Sealing goes through [`ZoneSealer`](crate::ZoneSealer): a zone is
//! claimed, handed to the deal sink and only then marked `Sealed`. A claimed
//! zone is invisible to other sealing attempts until it is sealed or
//! released.
//!
//! Locking: the bucket map (group -> zones, zone id -> zone) sits behind one
//! mutex and each zone behind its own `RwLock`. The bucket map is always
//! taken first.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use quay_types::{GroupKey, StagingConfig, ZoneId};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::breaker::DealCircuitBreaker;
use crate::error::StagingError;
use crate::zone::{ContentItem, StagingZone, ZoneState};

type ZoneRef = Arc<RwLock<StagingZone>>;

#[derive(Default)]
struct Buckets {
    /// Zones per group in creation order, sealed history included.
    groups: HashMap<GroupKey, Vec<ZoneRef>>,
    /// Index of every known zone.
    zones: HashMap<ZoneId, ZoneRef>,
    /// Zones currently being handed to a deal sink.
    claimed: HashSet<ZoneId>,
}

/// Buckets content into staging zones and drives their lifecycle.
pub struct StagingZoneManager {
    config: StagingConfig,
    breaker: Arc<DealCircuitBreaker>,
    buckets: Mutex<Buckets>,
    next_id: AtomicU64,
}

impl StagingZoneManager {
    /// Create a manager gated by `breaker`.
    pub fn new(config: StagingConfig, breaker: Arc<DealCircuitBreaker>) -> Self {
        Self {
            config,
            breaker,
            buckets: Mutex::new(Buckets::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Return the staging configuration.
    pub fn config(&self) -> &StagingConfig {
        &self.config
    }

    /// Return the deal-making circuit breaker.
    pub fn breaker(&self) -> &Arc<DealCircuitBreaker> {
        &self.breaker
    }

    /// Stage content for `group` and return the zone it landed in.
    ///
    /// Never refused because deal making is disabled.
    pub fn add_content(&self, group: GroupKey, item: ContentItem) -> Result<ZoneId, StagingError> {
        if item.size == 0 {
            return Err(StagingError::EmptyItem(item.content_id));
        }

        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("staging lock poisoned");

        // Oversized content gets a zone of its own, ready for a deal.
        if item.size > self.config.max_size {
            let zone = self.create_zone(&mut buckets, group, item, now);
            let mut z = zone.write().expect("zone lock poisoned");
            z.state = ZoneState::Full;
            info!(zone = %z.id, %group, size = item.size, "oversized content staged alone");
            return Ok(z.id);
        }

        if let Some(open) = Self::open_zone_ref(&buckets, group) {
            let mut z = open.write().expect("zone lock poisoned");
            let fits = z.total_size + item.size <= self.config.max_size;
            if fits && !z.is_expired(now, self.config.max_lifetime) {
                z.push(item, now);
                self.update_fullness(&mut z);
                debug!(zone = %z.id, content = %item.content_id, total = z.total_size, "content staged");
                return Ok(z.id);
            }
            z.state = ZoneState::Full;
            debug!(zone = %z.id, %group, total = z.total_size, "zone closed for appends");
        }

        let zone = self.create_zone(&mut buckets, group, item, now);
        let mut z = zone.write().expect("zone lock poisoned");
        self.update_fullness(&mut z);
        debug!(zone = %z.id, content = %item.content_id, total = z.total_size, "content staged");
        Ok(z.id)
    }

    /// Snapshots of every zone of `group`, oldest first.
    pub fn list_zones(&self, group: GroupKey) -> Vec<StagingZone> {
        let buckets = self.buckets.lock().expect("staging lock poisoned");
        buckets
            .groups
            .get(&group)
            .map(|zones| {
                zones
                    .iter()
                    .map(|z| z.read().expect("zone lock poisoned").clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Snapshot of a single zone.
    pub fn zone(&self, zone_id: ZoneId) -> Option<StagingZone> {
        let zone = {
            let buckets = self.buckets.lock().expect("staging lock poisoned");
            buckets.zones.get(&zone_id).cloned()
        }?;
        let snapshot = zone.read().expect("zone lock poisoned").clone();
        Some(snapshot)
    }

    /// Id of the group's `Open` zone, if any.
    pub fn open_zone(&self, group: GroupKey) -> Option<ZoneId> {
        let buckets = self.buckets.lock().expect("staging lock poisoned");
        Self::open_zone_ref(&buckets, group).map(|z| z.read().expect("zone lock poisoned").id)
    }

    /// Close expired `Open` zones and return every zone ready for sealing.
    ///
    /// While deal making is enabled, every `Full` zone is ready. While it is
    /// disabled, only zones that outlived `max_lifetime` are.
    pub fn collect_ready(&self, now: Instant) -> Vec<StagingZone> {
        let disabled = self.breaker.is_disabled();
        let buckets = self.buckets.lock().expect("staging lock poisoned");

        let mut ready = Vec::new();
        for (id, zone) in &buckets.zones {
            if buckets.claimed.contains(id) {
                continue;
            }
            let mut z = zone.write().expect("zone lock poisoned");
            let expired = z.is_expired(now, self.config.max_lifetime);

            if z.state == ZoneState::Open && expired {
                z.state = ZoneState::Full;
                info!(zone = %z.id, group = %z.group, items = z.len(), "zone reached max lifetime");
            }

            if z.state == ZoneState::Full && (!disabled || expired) {
                ready.push(z.clone());
            }
        }

        ready.sort_by_key(|z| z.id);
        ready
    }

    /// Reserve a zone for sealing.
    ///
    /// A `Full` zone can be claimed while deal making is enabled. A zone past
    /// `max_lifetime` can be claimed in any state but `Sealed`, even while
    /// deal making is disabled; an expired `Open` zone is closed first. With
    /// `check_breaker` unset the breaker is not consulted, for zones that
    /// [`collect_ready`](Self::collect_ready) already let through.
    pub(crate) fn claim(
        &self,
        zone_id: ZoneId,
        now: Instant,
        check_breaker: bool,
    ) -> Result<StagingZone, StagingError> {
        let mut buckets = self.buckets.lock().expect("staging lock poisoned");
        let zone = buckets
            .zones
            .get(&zone_id)
            .cloned()
            .ok_or(StagingError::ZoneNotFound(zone_id))?;
        if buckets.claimed.contains(&zone_id) {
            return Err(StagingError::SealInProgress(zone_id));
        }

        let mut z = zone.write().expect("zone lock poisoned");
        let expired = z.is_expired(now, self.config.max_lifetime);
        match z.state {
            ZoneState::Sealed => return Err(StagingError::AlreadySealed(zone_id)),
            ZoneState::Open if !expired => return Err(StagingError::NotReady(zone_id)),
            _ if check_breaker && !expired && self.breaker.is_disabled() => {
                return Err(StagingError::DealMakingDisabled(zone_id));
            }
            _ => {}
        }

        if z.state == ZoneState::Open {
            z.state = ZoneState::Full;
            info!(zone = %zone_id, group = %z.group, items = z.len(), "zone reached max lifetime");
        }
        buckets.claimed.insert(zone_id);
        Ok(z.clone())
    }

    /// Give up a claim without sealing. The zone stays `Full`.
    pub(crate) fn release(&self, zone_id: ZoneId) {
        self.buckets
            .lock()
            .expect("staging lock poisoned")
            .claimed
            .remove(&zone_id);
    }

    /// Seal a claimed zone whose deal was accepted by a sink.
    pub(crate) fn seal_accepted(&self, zone_id: ZoneId) -> Result<StagingZone, StagingError> {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("staging lock poisoned");
        buckets.claimed.remove(&zone_id);
        let zone = buckets
            .zones
            .get(&zone_id)
            .cloned()
            .ok_or(StagingError::ZoneNotFound(zone_id))?;

        let snapshot = {
            let mut z = zone.write().expect("zone lock poisoned");
            if z.state == ZoneState::Sealed {
                return Err(StagingError::AlreadySealed(zone_id));
            }

            z.state = ZoneState::Sealed;
            z.sealed_at = Some(now);
            info!(
                zone = %zone_id,
                group = %z.group,
                items = z.len(),
                total = z.total_size,
                forced = z.is_expired(now, self.config.max_lifetime),
                "zone sealed"
            );
            z.clone()
        };

        self.trim_history(&mut buckets, snapshot.group);
        Ok(snapshot)
    }

    /// Total number of zones known, sealed history included.
    pub fn len(&self) -> usize {
        self.buckets
            .lock()
            .expect("staging lock poisoned")
            .zones
            .len()
    }

    /// Whether no zone exists.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    fn open_zone_ref(buckets: &Buckets, group: GroupKey) -> Option<ZoneRef> {
        buckets
            .groups
            .get(&group)?
            .iter()
            .rev()
            .find(|z| z.read().expect("zone lock poisoned").state == ZoneState::Open)
            .cloned()
    }

    fn create_zone(
        &self,
        buckets: &mut Buckets,
        group: GroupKey,
        item: ContentItem,
        now: Instant,
    ) -> ZoneRef {
        let id = ZoneId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut zone = StagingZone::new(id, group, now);
        zone.push(item, now);

        let zone = Arc::new(RwLock::new(zone));
        buckets.groups.entry(group).or_default().push(zone.clone());
        buckets.zones.insert(id, zone.clone());
        debug!(zone = %id, %group, "zone opened");
        zone
    }

    fn update_fullness(&self, zone: &mut StagingZone) {
        if zone.state == ZoneState::Open
            && (zone.total_size >= self.config.min_size || zone.len() >= self.config.max_items)
        {
            zone.state = ZoneState::Full;
            info!(zone = %zone.id, group = %zone.group, items = zone.len(), total = zone.total_size, "zone full");
        }
    }

    /// Forget the oldest sealed zones of `group` beyond `max_sealed_history`.
    fn trim_history(&self, buckets: &mut Buckets, group: GroupKey) {
        let Some(zones) = buckets.groups.get_mut(&group) else {
            return;
        };

        let sealed: Vec<ZoneId> = zones
            .iter()
            .filter_map(|z| {
                let z = z.read().expect("zone lock poisoned");
                (z.state == ZoneState::Sealed).then_some(z.id)
            })
            .collect();

        let excess = sealed.len().saturating_sub(self.config.max_sealed_history);
        if excess == 0 {
            return;
        }

        let dropped = &sealed[..excess];
        zones.retain(|z| !dropped.contains(&z.read().expect("zone lock poisoned").id));
        for id in dropped {
            buckets.zones.remove(id);
        }
        debug!(%group, trimmed = excess, "sealed zone history trimmed");
    }
}

impl std::fmt::Debug for StagingZoneManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagingZoneManager")
            .field("config", &self.config)
            .field("zones", &self.len())
            .finish_non_exhaustive()
    }
}
