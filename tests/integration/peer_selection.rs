//! Integration test: latency-based peer selection.
//!
//! Peers and shuttles live on a simulated network with fixed RTTs; some
//! never answer, some refuse connections. Probing rounds must return only
//! the responders, ordered by RTT, within the configured time bounds.

use std::time::Duration;

use iroh::EndpointAddr;
use quay_integration_tests::{Harness, key, peer};
use quay_types::ShuttleHandle;
use tokio::time::Instant;

fn addr(n: u8) -> (EndpointAddr, quay_types::PeerId) {
    (EndpointAddr::new(key(n).public()), peer(n))
}

/// RTTs {A: 50 ms, B: silent, C: 120 ms} → {A, C}, ranked A then C.
#[tokio::test(start_paused = true)]
async fn test_silent_peer_left_out() {
    let h = Harness::new();
    h.network.set_rtt(peer(1), Duration::from_millis(50));
    h.network.set_rtt(peer(3), Duration::from_millis(120));

    let start = Instant::now();
    let result = h
        .orchestrator
        .prober()
        .ping_many(vec![addr(1), addr(2), addr(3)])
        .await;

    assert_eq!(result.len(), 2);
    assert!(!result.contains(&peer(2)));
    assert_eq!(result.top_peers(2), vec![peer(1), peer(3)]);
    assert_eq!(result.top_peers(10), vec![peer(1), peer(3)]);

    // The silent peer costs at most one per-peer timeout.
    let per_peer = h.orchestrator.prober().config().per_peer_timeout;
    assert!(start.elapsed() <= per_peer + Duration::from_millis(10));
}

/// Live shuttles are ranked by RTT; dead ones drop out and come back.
#[tokio::test(start_paused = true)]
async fn test_rank_shuttles_tracks_network() {
    let h = Harness::new();
    let _far = h.connect_shuttle("far", 1);
    let _near = h.connect_shuttle("near", 2);
    let _mid = h.connect_shuttle("mid", 3);
    h.network.set_rtt(peer(1), Duration::from_millis(200));
    h.network.set_rtt(peer(2), Duration::from_millis(20));
    h.network.set_rtt(peer(3), Duration::from_millis(80));

    let handles = |names: &[&str]| -> Vec<ShuttleHandle> {
        names.iter().map(|n| ShuttleHandle::from(*n)).collect()
    };

    assert_eq!(
        h.orchestrator.rank_shuttles(3).await,
        handles(&["near", "mid", "far"])
    );

    h.network.kill(peer(2));
    assert_eq!(
        h.orchestrator.rank_shuttles(3).await,
        handles(&["mid", "far"])
    );

    h.network.revive(peer(2));
    assert_eq!(
        h.orchestrator.rank_shuttles(1).await,
        handles(&["near"])
    );
}

/// Disconnected shuttles are never probed.
#[tokio::test(start_paused = true)]
async fn test_disconnected_shuttle_not_probed() {
    let h = Harness::new();
    let _a = h.connect_shuttle("a", 1);
    let b = h.connect_shuttle("b", 2);
    h.network.set_rtt(peer(1), Duration::from_millis(10));
    h.network.set_rtt(peer(2), Duration::from_millis(5));

    drop(b);
    let before = h.network.pings();
    assert_eq!(
        h.orchestrator.rank_shuttles(5).await,
        vec![ShuttleHandle::from("a")]
    );
    assert_eq!(h.network.pings() - before, 1);
}

/// Many peers, bounded concurrency: every responder is measured.
#[tokio::test(start_paused = true)]
async fn test_large_round_completes() {
    let h = Harness::new();
    let mut peers = Vec::new();
    for n in 1..=40u8 {
        h.network
            .set_rtt(peer(n), Duration::from_millis(5 * u64::from(n)));
        peers.push(addr(n));
    }
    // Duplicates are probed once.
    peers.push(addr(1));

    let result = h.orchestrator.prober().ping_many(peers).await;
    assert_eq!(result.len(), 40);
    assert_eq!(h.network.pings(), 40);
    assert_eq!(result.top_peers(3), vec![peer(1), peer(2), peer(3)]);
}

/// Probed addresses stay in the address book only for the TTL.
#[tokio::test(start_paused = true)]
async fn test_probe_addresses_expire() {
    let h = Harness::new();
    h.network.set_rtt(peer(9), Duration::from_millis(10));

    let rtt = h
        .orchestrator
        .prober()
        .ping_one(addr(9).0, peer(9))
        .await
        .unwrap();
    assert_eq!(rtt, Duration::from_millis(10));
    assert!(h.orchestrator.address_book().get(&peer(9)).is_some());

    let ttl = h.orchestrator.prober().config().addr_ttl;
    tokio::time::advance(ttl + Duration::from_secs(1)).await;
    assert!(h.orchestrator.address_book().get(&peer(9)).is_none());
}
