//! [`Orchestrator`]: the content manager that ties all components together.
//!
//! New content is staged into zones and queued for a check. Shuttles report
//! back over the RPC ingress; [`Orchestrator::handle_rpc`] applies those
//! reports to the registries and schedules follow-up checks. When work has
//! to go to a shuttle, [`Orchestrator::rank_shuttles`] picks the closest
//! ones by latency.

use std::collections::HashMap;
use std::sync::Arc;

use quay_net::{AddressBook, Pinger};
use quay_probe::PeerProber;
use quay_queue::{CheckReceiver, Enqueued, QueueError, QueueManager};
use quay_registry::{
    DEFAULT_TRANSFER_CACHE_CAPACITY, InflightCids, ReleasedWork, RetrievalOutcome,
    RetrievalRegistry, RetrievalTicket, ShuttleAssignments, TransferStatusCache,
};
use quay_shuttle::{InboundMessage, IngressReceiver, RpcIngress, ShuttleRegistry};
use quay_staging::{ContentItem, DealCircuitBreaker, DealSink, StagingZoneManager, ZoneSealer};
use quay_types::{
    Cid, ContentId, GroupKey, PeerId, ProbeConfig, QueueConfig, ShuttleCommand, ShuttleConfig,
    ShuttleHandle, ShuttleMessage, StagingConfig, ZoneId,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::EngineError;

/// Configuration for creating an [`Orchestrator`].
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorConfig {
    /// Peer probing parameters.
    pub probe: ProbeConfig,
    /// Staging zone thresholds.
    pub staging: StagingConfig,
    /// Check queue parameters.
    pub queue: QueueConfig,
    /// Shuttle liveness and channel sizes.
    pub shuttle: ShuttleConfig,
    /// Number of transfer statuses cached.
    pub transfer_cache_capacity: usize,
    /// Start with deal making disabled.
    pub deal_making_disabled: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            probe: ProbeConfig::default(),
            staging: StagingConfig::default(),
            queue: QueueConfig::default(),
            shuttle: ShuttleConfig::default(),
            transfer_cache_capacity: DEFAULT_TRANSFER_CACHE_CAPACITY,
            deal_making_disabled: false,
        }
    }
}

/// The content manager.
pub struct Orchestrator {
    prober: PeerProber,
    address_book: Arc<AddressBook>,
    retrievals: RetrievalRegistry,
    inflight: InflightCids,
    transfers: TransferStatusCache,
    assignments: ShuttleAssignments,
    breaker: Arc<DealCircuitBreaker>,
    staging: Arc<StagingZoneManager>,
    queue: QueueManager,
    shuttles: Arc<ShuttleRegistry>,
    ingress: RpcIngress,
}

impl Orchestrator {
    /// Build every component.
    ///
    /// Returns the orchestrator together with the consumer ends of the check
    /// queue and the RPC ingress. Must be called from within a tokio
    /// runtime.
    pub fn new(
        config: OrchestratorConfig,
        pinger: Arc<dyn Pinger>,
        address_book: Arc<AddressBook>,
    ) -> (Self, CheckReceiver, IngressReceiver) {
        let breaker = Arc::new(DealCircuitBreaker::new(config.deal_making_disabled));
        let staging = Arc::new(StagingZoneManager::new(config.staging, breaker.clone()));
        let (queue, checks) = QueueManager::start(config.queue);
        let (ingress, inbound) = RpcIngress::new(config.shuttle.ingress_capacity);

        info!(
            deal_making_disabled = config.deal_making_disabled,
            "orchestrator created"
        );

        let orchestrator = Self {
            prober: PeerProber::new(pinger, address_book.clone(), config.probe),
            address_book,
            retrievals: RetrievalRegistry::new(),
            inflight: InflightCids::new(),
            transfers: TransferStatusCache::new(config.transfer_cache_capacity),
            assignments: ShuttleAssignments::new(),
            breaker,
            staging,
            queue,
            shuttles: Arc::new(ShuttleRegistry::new(config.shuttle)),
            ingress,
        };
        (orchestrator, checks, inbound)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Return the peer prober.
    pub fn prober(&self) -> &PeerProber {
        &self.prober
    }

    /// Return the address book.
    pub fn address_book(&self) -> &Arc<AddressBook> {
        &self.address_book
    }

    /// Return the retrieval registry.
    pub fn retrievals(&self) -> &RetrievalRegistry {
        &self.retrievals
    }

    /// Return the inflight CID counts.
    pub fn inflight(&self) -> &InflightCids {
        &self.inflight
    }

    /// Return the transfer status cache.
    pub fn transfers(&self) -> &TransferStatusCache {
        &self.transfers
    }

    /// Return the record of work handed to each shuttle.
    pub fn assignments(&self) -> &ShuttleAssignments {
        &self.assignments
    }

    /// Return the deal-making circuit breaker.
    pub fn breaker(&self) -> &Arc<DealCircuitBreaker> {
        &self.breaker
    }

    /// Return the staging zone manager.
    pub fn staging(&self) -> &Arc<StagingZoneManager> {
        &self.staging
    }

    /// Return the check queue.
    pub fn queue(&self) -> &QueueManager {
        &self.queue
    }

    /// Return the shuttle registry.
    pub fn shuttles(&self) -> &Arc<ShuttleRegistry> {
        &self.shuttles
    }

    /// Return the RPC ingress. Clone it into every shuttle connection.
    pub fn ingress(&self) -> &RpcIngress {
        &self.ingress
    }

    // ------------------------------------------------------------------
    // Content
    // ------------------------------------------------------------------

    /// Stage content and queue a check for it.
    ///
    /// A full check queue does not fail the call; the check is retried
    /// after `queue.retry_delay`.
    pub fn add_content(&self, group: GroupKey, item: ContentItem) -> Result<ZoneId, EngineError> {
        let zone = self.staging.add_content(group, item)?;
        self.schedule_check(item.content_id)?;
        Ok(zone)
    }

    /// Queue a check for `content_id`, degrading to a delayed check when
    /// the queue is full.
    pub fn schedule_check(&self, content_id: ContentId) -> Result<Enqueued, EngineError> {
        match self.queue.enqueue(content_id) {
            Ok(outcome) => Ok(outcome),
            Err(QueueError::Backpressure { .. }) => {
                let retry = self.queue.config().retry_delay;
                debug!(content = %content_id, retry_ms = retry.as_millis() as u64, "check deferred");
                Ok(self.queue.enqueue_after(content_id, retry))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Ask a shuttle to pin content, marking its CID inflight until the
    /// shuttle reports back or goes away.
    pub fn pin_on(
        &self,
        shuttle: &ShuttleHandle,
        content_id: ContentId,
        cid: Cid,
    ) -> Result<(), EngineError> {
        self.inflight.mark(cid);
        self.assignments.assign_pin(shuttle, content_id, cid);
        if let Err(e) = self
            .shuttles
            .send(shuttle, ShuttleCommand::AddPin { content_id, cid })
        {
            self.assignments.finish_pin(shuttle, cid);
            self.inflight.clear(cid);
            return Err(e.into());
        }
        info!(%shuttle, content = %content_id, cid = %cid.fmt_short(), "pin requested");
        Ok(())
    }

    /// Ask a shuttle to drop its pin of `content_id`.
    pub fn unpin_on(
        &self,
        shuttle: &ShuttleHandle,
        content_id: ContentId,
    ) -> Result<(), EngineError> {
        self.shuttles
            .send(shuttle, ShuttleCommand::Unpin { content_id })?;
        info!(%shuttle, content = %content_id, "unpin requested");
        Ok(())
    }

    /// Ask a shuttle to retrieve content from the storage network.
    ///
    /// Fails if a retrieval for `content_id` is already running. The
    /// retrieval ends when the shuttle reports
    /// [`ShuttleMessage::RetrievalFinished`] or goes away.
    pub fn start_retrieval(
        &self,
        shuttle: &ShuttleHandle,
        content_id: ContentId,
        cid: Cid,
    ) -> Result<RetrievalTicket, EngineError> {
        let ticket = self.retrievals.begin(content_id)?;
        self.assignments.assign_retrieval(shuttle, content_id);
        if let Err(e) = self
            .shuttles
            .send(shuttle, ShuttleCommand::RetrieveContent { content_id, cid })
        {
            self.finish_retrieval(content_id, RetrievalOutcome::Failed(e.to_string()));
            return Err(e.into());
        }
        info!(%shuttle, content = %content_id, "retrieval requested");
        Ok(ticket)
    }

    /// Cancel a running retrieval.
    ///
    /// The shuttle running it is told to stop and reports the cancellation
    /// back. If it cannot be reached, the retrieval ends here as cancelled.
    /// Returns `false` if no retrieval is running for `content_id`.
    pub fn cancel_retrieval(&self, content_id: ContentId) -> bool {
        if !self.retrievals.cancel(content_id) {
            return false;
        }

        let Some(shuttle) = self.assignments.retrieval_owner(content_id) else {
            self.finish_retrieval(content_id, RetrievalOutcome::Cancelled);
            return true;
        };
        if let Err(e) = self
            .shuttles
            .send(&shuttle, ShuttleCommand::CancelRetrieval { content_id })
        {
            warn!(%shuttle, content = %content_id, error = %e, "could not forward cancellation");
            self.finish_retrieval(content_id, RetrievalOutcome::Cancelled);
        }
        true
    }

    fn finish_retrieval(&self, content_id: ContentId, outcome: RetrievalOutcome) {
        self.assignments.finish_retrieval(content_id);
        self.retrievals.end(content_id, outcome);
    }

    // ------------------------------------------------------------------
    // Shuttle sessions
    // ------------------------------------------------------------------

    /// Remove the shuttle registered under `handle` with `outbound` and take
    /// back its work.
    ///
    /// Does nothing if a newer session took over the handle. Returns
    /// whether the shuttle was removed.
    pub fn disconnect_shuttle(
        &self,
        handle: &ShuttleHandle,
        outbound: &mpsc::Sender<ShuttleCommand>,
    ) -> bool {
        if !self.shuttles.disconnect_channel(handle, outbound) {
            return false;
        }
        self.release_shuttle(handle);
        true
    }

    /// Take back everything handed to `shuttle`.
    ///
    /// Outstanding pins lose their inflight mark and are re-checked so they
    /// can be placed elsewhere; running retrievals end as failed.
    pub fn release_shuttle(&self, shuttle: &ShuttleHandle) -> ReleasedWork {
        let work = self.assignments.release(shuttle);

        for &(content_id, cid) in &work.pins {
            self.inflight.clear(cid);
            if let Err(e) = self.schedule_check(content_id) {
                warn!(content = %content_id, error = %e, "failed to queue check");
            }
        }
        for &content_id in &work.retrievals {
            self.retrievals.end(
                content_id,
                RetrievalOutcome::Failed(format!("shuttle {shuttle} went away")),
            );
        }

        if !work.is_empty() {
            info!(
                %shuttle,
                pins = work.pins.len(),
                retrievals = work.retrievals.len(),
                "released work of departed shuttle"
            );
        }
        work
    }

    /// Enable or disable deal making.
    pub fn set_deal_making_enabled(&self, enabled: bool) {
        self.breaker.set_disabled(!enabled);
    }

    /// Build a sealer handing this orchestrator's ready zones to `sink`.
    pub fn zone_sealer(&self, sink: Arc<dyn DealSink>) -> ZoneSealer {
        ZoneSealer::new(self.staging.clone(), sink)
    }

    // ------------------------------------------------------------------
    // Shuttle RPC
    // ------------------------------------------------------------------

    /// Apply one shuttle message to the registries.
    pub fn handle_rpc(&self, inbound: InboundMessage) {
        let InboundMessage { from, message } = inbound;
        self.shuttles.touch(&from);

        match message {
            ShuttleMessage::Heartbeat(status) => {
                if let Err(e) = self.shuttles.heartbeat(&from, status) {
                    debug!(%from, error = %e, "heartbeat from unregistered shuttle");
                }
            }
            ShuttleMessage::TransferStatus {
                transfer_id,
                status,
            } => {
                if status.state.is_terminal() {
                    info!(%from, transfer = %transfer_id, state = ?status.state, sent = status.sent, "transfer finished");
                }
                self.transfers.put(transfer_id, status);
            }
            ShuttleMessage::RetrievalProgress { content_id, bytes } => {
                self.retrievals.record_progress(content_id, bytes);
            }
            ShuttleMessage::RetrievalFinished {
                content_id,
                outcome,
            } => match self.assignments.retrieval_owner(content_id) {
                Some(owner) if owner != from => {
                    warn!(%from, %owner, content = %content_id, "retrieval report from wrong shuttle");
                }
                _ => {
                    info!(%from, content = %content_id, ?outcome, "retrieval finished");
                    let succeeded = outcome == RetrievalOutcome::Succeeded;
                    self.finish_retrieval(content_id, outcome);
                    if succeeded && let Err(e) = self.schedule_check(content_id) {
                        warn!(content = %content_id, error = %e, "failed to queue check");
                    }
                }
            },
            ShuttleMessage::PinComplete {
                content_id,
                cid,
                size,
            } => {
                self.settle_pin(&from, cid);
                info!(%from, content = %content_id, size, "pin complete");
                if let Err(e) = self.schedule_check(content_id) {
                    warn!(content = %content_id, error = %e, "failed to queue check");
                }
            }
            ShuttleMessage::PinFailed {
                content_id,
                cid,
                reason,
            } => {
                self.settle_pin(&from, cid);
                warn!(%from, content = %content_id, %reason, "pin failed");
                self.queue
                    .enqueue_after(content_id, self.queue.config().retry_delay);
            }
        }
    }

    /// Clear the inflight mark of a pin request `from` held.
    fn settle_pin(&self, from: &ShuttleHandle, cid: Cid) {
        if self.assignments.finish_pin(from, cid) {
            self.inflight.clear(cid);
        } else {
            debug!(%from, cid = %cid.fmt_short(), "pin report without a matching request");
        }
    }

    /// Apply shuttle messages until the ingress closes.
    pub async fn run_ingress(&self, mut inbound: IngressReceiver) {
        info!("rpc ingress loop started");
        while let Some(message) = inbound.recv().await {
            self.handle_rpc(message);
        }
        info!("rpc ingress loop stopped");
    }

    // ------------------------------------------------------------------
    // Shuttle selection
    // ------------------------------------------------------------------

    /// Live shuttles ordered by ascending RTT, at most `n` of them.
    ///
    /// Only shuttles with a network identity and a known address are
    /// probed; shuttles that do not answer are left out.
    pub async fn rank_shuttles(&self, n: usize) -> Vec<ShuttleHandle> {
        let mut by_peer = HashMap::new();
        let mut candidates: Vec<(iroh::EndpointAddr, PeerId)> = Vec::new();

        for shuttle in self.shuttles.live_shuttles() {
            let Some(peer) = shuttle.peer_id else {
                continue;
            };
            let Some(addr) = self.address_book.get(&peer) else {
                debug!(handle = %shuttle.handle, "no address for shuttle, skipping probe");
                continue;
            };
            candidates.push((addr, peer));
            by_peer.insert(peer, shuttle.handle);
        }

        if candidates.is_empty() {
            return Vec::new();
        }

        let result = self.prober.ping_many(candidates).await;
        result
            .top_peers(n)
            .into_iter()
            .filter_map(|peer| by_peer.remove(&peer))
            .collect()
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("staging", &self.staging)
            .field("shuttles", &self.shuttles)
            .finish_non_exhaustive()
    }
}
