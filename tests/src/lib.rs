//! Shared test harness for Quay integration tests.
//!
//! Provides [`Harness`]: a full [`Orchestrator`] wired to a simulated
//! network ([`SimPinger`]) and a recording deal sink ([`RecordingSink`]),
//! with helpers to connect shuttles and drive the RPC ingress.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use iroh::{EndpointAddr, SecretKey};
use quay_engine::{Orchestrator, OrchestratorConfig};
use quay_net::{AddressBook, NetError, Pinger};
use quay_queue::CheckReceiver;
use quay_shuttle::IngressReceiver;
use quay_staging::{ContentItem, DealSink, StagingError, StagingZone, ZoneSealer};
use quay_types::{
    Cid, ContentId, PeerId, QueueConfig, ShuttleCommand, ShuttleConfig, ShuttleHandle,
    ShuttleHello, StagingConfig, ZoneId,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

// =========================================================================
// Simulated network
// =========================================================================

/// Pinger over a simulated network.
///
/// Peers with a configured RTT answer after that delay. Killed peers fail
/// immediately. Peers with no RTT never answer.
#[derive(Default)]
pub struct SimPinger {
    rtts: Mutex<HashMap<PeerId, Duration>>,
    down: Mutex<HashSet<PeerId>>,
    pings: AtomicUsize,
}

impl SimPinger {
    /// Create a network with no reachable peer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `peer` answer after `rtt`.
    pub fn set_rtt(&self, peer: PeerId, rtt: Duration) {
        self.rtts.lock().expect("sim lock poisoned").insert(peer, rtt);
    }

    /// Make `peer` refuse connections.
    pub fn kill(&self, peer: PeerId) {
        self.down.lock().expect("sim lock poisoned").insert(peer);
    }

    /// Undo [`kill`](Self::kill).
    pub fn revive(&self, peer: PeerId) {
        self.down.lock().expect("sim lock poisoned").remove(&peer);
    }

    /// Pings attempted so far.
    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Pinger for SimPinger {
    async fn ping(&self, peer: PeerId) -> Result<Duration, NetError> {
        self.pings.fetch_add(1, Ordering::Relaxed);
        if self.down.lock().expect("sim lock poisoned").contains(&peer) {
            return Err(NetError::Connect("peer is down".into()));
        }
        let rtt = self.rtts.lock().expect("sim lock poisoned").get(&peer).copied();
        match rtt {
            Some(rtt) => {
                tokio::time::sleep(rtt).await;
                Ok(rtt)
            }
            None => std::future::pending().await,
        }
    }
}

// =========================================================================
// Deal sink
// =========================================================================

/// Deal sink that records accepted zones and can be told to refuse.
#[derive(Default)]
pub struct RecordingSink {
    accepted: Mutex<Vec<ZoneId>>,
    refuse: AtomicBool,
}

impl RecordingSink {
    /// Refuse (or accept again) every submitted zone.
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::Relaxed);
    }

    /// Zones accepted so far, in submission order.
    pub fn accepted(&self) -> Vec<ZoneId> {
        self.accepted.lock().expect("sink lock poisoned").clone()
    }
}

#[async_trait]
impl DealSink for RecordingSink {
    async fn submit(&self, zone: &StagingZone) -> Result<(), StagingError> {
        if self.refuse.load(Ordering::Relaxed) {
            return Err(StagingError::Sink("provider unavailable".into()));
        }
        self.accepted.lock().expect("sink lock poisoned").push(zone.id);
        Ok(())
    }
}

// =========================================================================
// Harness
// =========================================================================

/// An orchestrator with a simulated network and deal sink.
pub struct Harness {
    /// The orchestrator under test.
    pub orchestrator: Arc<Orchestrator>,
    /// Consumer end of the check queue.
    pub checks: CheckReceiver,
    /// Consumer end of the RPC ingress, until [`spawn_ingress`](Self::spawn_ingress) takes it.
    pub inbound: Option<IngressReceiver>,
    /// Simulated network.
    pub network: Arc<SimPinger>,
    /// Deal sink used by [`sealer`](Self::sealer).
    pub sink: Arc<RecordingSink>,
}

impl Harness {
    /// Build a harness with small, test-friendly thresholds.
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    /// Build a harness with an explicit configuration.
    pub fn with_config(config: OrchestratorConfig) -> Self {
        let network = Arc::new(SimPinger::new());
        let (orchestrator, checks, inbound) =
            Orchestrator::new(config, network.clone(), Arc::new(AddressBook::new()));
        Self {
            orchestrator: Arc::new(orchestrator),
            checks,
            inbound: Some(inbound),
            network,
            sink: Arc::new(RecordingSink::default()),
        }
    }

    /// A sealer handing ready zones to [`Harness::sink`].
    pub fn sealer(&self) -> ZoneSealer {
        self.orchestrator.zone_sealer(self.sink.clone())
    }

    /// Run the orchestrator's ingress loop in the background.
    pub fn spawn_ingress(&mut self) -> JoinHandle<()> {
        let inbound = self
            .inbound
            .take()
            .expect("ingress loop already running");
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move { orchestrator.run_ingress(inbound).await })
    }

    /// Register shuttle `name` with network identity `peer(n)` and a known
    /// address. Returns the receiving end of its command channel.
    pub fn connect_shuttle(&self, name: &str, n: u8) -> mpsc::Receiver<ShuttleCommand> {
        self.connect_session(name, n).1
    }

    /// Like [`connect_shuttle`](Self::connect_shuttle), also returning the
    /// sender the session was registered with, for
    /// [`Orchestrator::disconnect_shuttle`].
    pub fn connect_session(
        &self,
        name: &str,
        n: u8,
    ) -> (mpsc::Sender<ShuttleCommand>, mpsc::Receiver<ShuttleCommand>) {
        let (tx, rx) = mpsc::channel(16);
        self.orchestrator
            .shuttles()
            .connect(hello(name), Some(peer(n)), tx.clone())
            .expect("shuttle should connect");
        self.orchestrator
            .address_book()
            .insert_permanent(peer(n), EndpointAddr::new(key(n).public()));
        (tx, rx)
    }

    /// Drain every check currently queued.
    pub fn drain_checks(&mut self) -> Vec<ContentId> {
        let mut drained = Vec::new();
        while let Some(id) = self.checks.try_recv() {
            drained.push(id);
        }
        drained
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// Small thresholds: zones fill at 100 bytes, cap at 1000, live 60 s.
pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        staging: StagingConfig {
            min_size: 100,
            max_size: 1_000,
            max_items: 50,
            max_lifetime: Duration::from_secs(60),
            max_sealed_history: 8,
            seal_interval: Duration::from_secs(3_600),
        },
        queue: QueueConfig {
            capacity: 64,
            retry_delay: Duration::from_millis(500),
        },
        shuttle: ShuttleConfig {
            liveness_timeout: Duration::from_secs(30),
            outbound_capacity: 16,
            ingress_capacity: 64,
        },
        ..OrchestratorConfig::default()
    }
}

// =========================================================================
// Fixtures
// =========================================================================

/// Deterministic iroh key number `n`.
pub fn key(n: u8) -> SecretKey {
    SecretKey::from([n; 32])
}

/// Network identity of [`key(n)`](key).
pub fn peer(n: u8) -> PeerId {
    PeerId::from(*key(n).public().as_bytes())
}

/// Content item `n` of `size` bytes.
pub fn item(n: u64, size: u64) -> ContentItem {
    ContentItem {
        content_id: ContentId(n),
        cid: Cid::from_data(&n.to_be_bytes()),
        size,
    }
}

/// Hello for shuttle `name`.
pub fn hello(name: &str) -> ShuttleHello {
    ShuttleHello {
        handle: ShuttleHandle::from(name),
        hostname: format!("{name}.shuttles.test"),
        private: false,
    }
}

/// Poll `cond` until it holds, yielding to other tasks in between.
///
/// Panics after `attempts` tries.
pub async fn eventually(attempts: usize, mut cond: impl FnMut() -> bool) {
    for _ in 0..attempts {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not met after {attempts} attempts");
}
