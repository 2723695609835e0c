//! Bounded-parallel latency probing of candidate peers.
//!
//! [`PeerProber`] pings a set of peers and collects the round-trip time of
//! every peer that answered within the per-peer timeout. Failures are
//! dropped, not reported: a slow or broken peer only shrinks the result.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use quay_net::{AddressBook, Pinger};
use quay_types::{PeerId, ProbeConfig};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::ProbeError;
use crate::result::PingManyResult;

/// Pings peers and ranks them by latency.
pub struct PeerProber {
    pinger: Arc<dyn Pinger>,
    address_book: Arc<AddressBook>,
    config: ProbeConfig,
}

impl PeerProber {
    /// Create a prober on top of a probe primitive and the address book it
    /// resolves peers through.
    pub fn new(pinger: Arc<dyn Pinger>, address_book: Arc<AddressBook>, config: ProbeConfig) -> Self {
        Self {
            pinger,
            address_book,
            config,
        }
    }

    /// Return the probing configuration.
    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Ping a single peer, returning its RTT.
    ///
    /// The address is registered in the address book with a short TTL first
    /// so the probe can route to a peer that was never seen before.
    pub async fn ping_one(
        &self,
        addr: iroh::EndpointAddr,
        peer: PeerId,
    ) -> Result<Duration, ProbeError> {
        self.address_book
            .insert_temp(peer, addr, self.config.addr_ttl);
        ping_with_timeout(self.pinger.as_ref(), peer, self.config.per_peer_timeout).await
    }

    /// Ping every peer and return the RTT of each one that answered.
    ///
    /// Pings run concurrently, at most `concurrency` at a time, each bounded
    /// by the per-peer timeout. The whole round is bounded by
    /// `round_timeout`; peers still pending at that point are left out.
    ///
    /// Dropping the returned future aborts every in-flight ping.
    pub async fn ping_many(&self, peers: Vec<(iroh::EndpointAddr, PeerId)>) -> PingManyResult {
        self.ping_many_until(peers, Instant::now() + self.config.round_timeout)
            .await
    }

    /// [`ping_many`](Self::ping_many) with an explicit round deadline.
    pub async fn ping_many_until(
        &self,
        peers: Vec<(iroh::EndpointAddr, PeerId)>,
        deadline: Instant,
    ) -> PingManyResult {
        let mut result = PingManyResult::new();
        if peers.is_empty() {
            return result;
        }

        let permits = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let timeout = self.config.per_peer_timeout;
        let mut seen = HashSet::new();
        let mut tasks = JoinSet::new();

        for (addr, peer) in peers {
            if !seen.insert(peer) {
                continue;
            }
            self.address_book
                .insert_temp(peer, addr, self.config.addr_ttl);

            let pinger = self.pinger.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok()?;
                Some((peer, ping_with_timeout(pinger.as_ref(), peer, timeout).await))
            });
        }

        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok(Some((peer, Ok(rtt)))))) => {
                    result.insert(peer, rtt);
                }
                Ok(Some(Ok(Some((peer, Err(e)))))) => {
                    debug!(peer = %peer.fmt_short(), %e, "peer dropped from probe round");
                }
                Ok(Some(Ok(None))) => {}
                Ok(Some(Err(e))) => {
                    warn!(%e, "probe task failed");
                }
                Ok(None) => break,
                Err(_) => {
                    debug!(
                        answered = result.len(),
                        pending = tasks.len(),
                        "probe round deadline reached"
                    );
                    tasks.abort_all();
                    break;
                }
            }
        }

        debug!(answered = result.len(), probed = seen.len(), "probe round finished");
        result
    }
}

async fn ping_with_timeout(
    pinger: &dyn Pinger,
    peer: PeerId,
    timeout: Duration,
) -> Result<Duration, ProbeError> {
    match tokio::time::timeout(timeout, pinger.ping(peer)).await {
        Ok(rtt) => Ok(rtt?),
        Err(_) => Err(ProbeError::Timeout {
            peer,
            after: timeout,
        }),
    }
}

impl std::fmt::Debug for PeerProber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerProber")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
