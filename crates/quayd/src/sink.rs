//! Deal sink used by the daemon.
//!
//! Deal negotiation with storage providers lives outside the orchestrator.
//! The daemon's sink records each sealed zone in the log together with an
//! aggregate digest of its content, which is what a deal client picks up.

use async_trait::async_trait;
use quay_staging::{DealSink, StagingError, StagingZone};
use tracing::info;

/// Accepts every zone and logs it.
#[derive(Debug, Default)]
pub struct LoggingDealSink;

#[async_trait]
impl DealSink for LoggingDealSink {
    async fn submit(&self, zone: &StagingZone) -> Result<(), StagingError> {
        if zone.items.is_empty() {
            return Err(StagingError::Sink(format!("zone {} is empty", zone.id)));
        }
        info!(
            zone = %zone.id,
            group = %zone.group,
            items = zone.items.len(),
            bytes = zone.total_size,
            digest = %zone_digest(zone).to_hex(),
            "zone submitted for deal"
        );
        Ok(())
    }
}

/// BLAKE3 over the zone's content roots in append order.
pub fn zone_digest(zone: &StagingZone) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    for item in &zone.items {
        hasher.update(item.cid.as_bytes());
    }
    hasher.finalize()
}
