//! Background sealing of ready zones.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quay_types::ZoneId;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::error::StagingError;
use crate::manager::StagingZoneManager;
use crate::zone::StagingZone;

/// Accepts zones for deal making.
///
/// A zone is only marked `Sealed` after the sink accepted it. A sink that
/// returns an error leaves the zone `Full` and it is offered again on the
/// next pass.
#[async_trait]
pub trait DealSink: Send + Sync {
    /// Start making a deal for `zone`.
    async fn submit(&self, zone: &StagingZone) -> Result<(), StagingError>;
}

/// Outcome of one sealing pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SealPass {
    /// Zones accepted by the sink and sealed.
    pub sealed: usize,
    /// Zones the sink refused, or that could not be sealed afterwards.
    pub failed: usize,
}

/// Shortest interval between sealing passes.
const MIN_SEAL_INTERVAL: Duration = Duration::from_millis(100);

/// Periodically hands ready zones to a [`DealSink`] and seals them.
pub struct ZoneSealer {
    manager: Arc<StagingZoneManager>,
    sink: Arc<dyn DealSink>,
    interval: Duration,
}

impl ZoneSealer {
    /// Create a sealer running every `staging.seal_interval`.
    ///
    /// Intervals below 100 ms are raised to 100 ms.
    pub fn new(manager: Arc<StagingZoneManager>, sink: Arc<dyn DealSink>) -> Self {
        let configured = manager.config().seal_interval;
        let interval = configured.max(MIN_SEAL_INTERVAL);
        if interval != configured {
            warn!(
                configured_ms = configured.as_millis() as u64,
                interval_ms = interval.as_millis() as u64,
                "seal interval too short, raised"
            );
        }
        Self {
            manager,
            sink,
            interval,
        }
    }

    /// Run one sealing pass.
    ///
    /// Failures are logged per zone; they never abort the pass.
    pub async fn run_once(&self) -> SealPass {
        let now = Instant::now();
        let ready = self.manager.collect_ready(now);
        let mut pass = SealPass::default();

        for zone in ready {
            let zone = match self.manager.claim(zone.id, now, false) {
                Ok(zone) => zone,
                Err(e) => {
                    debug!(zone = %zone.id, error = %e, "zone no longer sealable");
                    continue;
                }
            };
            match self.submit_and_seal(&zone).await {
                Ok(_) => pass.sealed += 1,
                Err(e) => {
                    warn!(zone = %zone.id, error = %e, "zone not sealed, will retry");
                    pass.failed += 1;
                }
            }
        }

        if pass.sealed + pass.failed > 0 {
            debug!(sealed = pass.sealed, failed = pass.failed, "seal pass finished");
        }
        pass
    }

    /// Seal one zone now, through the deal sink.
    ///
    /// Fails with `ZoneNotFound`, `AlreadySealed`, `NotReady` (still open
    /// and younger than `max_lifetime`), `DealMakingDisabled` (breaker set
    /// and the zone not expired) or `SealInProgress`. A sink refusal is
    /// returned as is and leaves the zone `Full`.
    pub async fn seal_zone(&self, zone_id: ZoneId) -> Result<StagingZone, StagingError> {
        let zone = self.manager.claim(zone_id, Instant::now(), true)?;
        self.submit_and_seal(&zone).await
    }

    /// Hand a claimed zone to the sink and seal it once accepted.
    async fn submit_and_seal(&self, zone: &StagingZone) -> Result<StagingZone, StagingError> {
        if let Err(e) = self.sink.submit(zone).await {
            self.manager.release(zone.id);
            return Err(e);
        }
        self.manager.seal_accepted(zone.id)
    }

    /// Run the sealing loop until `shutdown` flips or its sender is dropped.
    ///
    /// Besides the periodic tick, a pass runs as soon as deal making is
    /// re-enabled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = self.interval.as_millis() as u64, "zone sealer started");

        let mut tick = interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut breaker = self.manager.breaker().subscribe();

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                Ok(()) = breaker.changed() => {
                    if *breaker.borrow_and_update() {
                        continue;
                    }
                }
                _ = shutdown.changed() => {
                    info!("zone sealer stopped");
                    return;
                }
            }

            self.run_once().await;
        }
    }
}

impl std::fmt::Debug for ZoneSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZoneSealer")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}
