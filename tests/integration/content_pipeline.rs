//! Integration test: content staging through to sealed deals.
//!
//! Content is added through the orchestrator, fills per-group zones and is
//! handed to the deal sink by the sealer, with the circuit breaker and the
//! lifetime policy in play.

use std::time::Duration;

use quay_integration_tests::{Harness, eventually, item};
use quay_staging::ZoneState;
use quay_types::{ContentId, GroupKey};
use tokio::sync::watch;

/// Four 30-byte items fill a 100-byte zone; the sealer seals it and the
/// next item opens a fresh zone.
#[tokio::test]
async fn test_zone_fills_and_is_sealed() {
    let mut h = Harness::new();
    let group = GroupKey(1);

    let mut zone = None;
    for n in 1..=4 {
        zone = Some(h.orchestrator.add_content(group, item(n, 30)).unwrap());
    }
    let zone = zone.unwrap();
    assert_eq!(
        h.orchestrator.staging().zone(zone).unwrap().state,
        ZoneState::Full
    );
    assert_eq!(
        h.drain_checks(),
        (1..=4).map(ContentId).collect::<Vec<_>>()
    );

    let pass = h.sealer().run_once().await;
    assert_eq!(pass.sealed, 1);
    assert_eq!(h.sink.accepted(), vec![zone]);

    let sealed = h.orchestrator.staging().zone(zone).unwrap();
    assert_eq!(sealed.state, ZoneState::Sealed);
    assert_eq!(sealed.items.len(), 4);
    assert_eq!(sealed.total_size, 120);

    let next = h.orchestrator.add_content(group, item(5, 30)).unwrap();
    assert_ne!(next, zone);
    assert_eq!(h.orchestrator.staging().open_zone(group), Some(next));
}

/// Groups never share a zone.
#[tokio::test]
async fn test_groups_are_isolated() {
    let h = Harness::new();

    let a = h.orchestrator.add_content(GroupKey(1), item(1, 10)).unwrap();
    let b = h.orchestrator.add_content(GroupKey(2), item(2, 10)).unwrap();
    assert_ne!(a, b);

    assert_eq!(h.orchestrator.staging().list_zones(GroupKey(1)).len(), 1);
    assert_eq!(h.orchestrator.staging().list_zones(GroupKey(2)).len(), 1);
}

/// With deal making disabled, full zones wait; re-enabling releases them.
#[tokio::test]
async fn test_breaker_holds_deals_until_reenabled() {
    let h = Harness::new();
    h.orchestrator.set_deal_making_enabled(false);

    let zone = h.orchestrator.add_content(GroupKey(1), item(1, 150)).unwrap();
    let sealer = h.sealer();

    let pass = sealer.run_once().await;
    assert_eq!(pass.sealed, 0);
    assert!(h.sink.accepted().is_empty());
    assert_eq!(
        h.orchestrator.staging().zone(zone).unwrap().state,
        ZoneState::Full
    );

    h.orchestrator.set_deal_making_enabled(true);
    assert_eq!(sealer.run_once().await.sealed, 1);
    assert_eq!(h.sink.accepted(), vec![zone]);
}

/// A zone past its lifetime is sealed even while deal making is disabled.
#[tokio::test(start_paused = true)]
async fn test_lifetime_forces_seal_under_breaker() {
    let h = Harness::new();
    h.orchestrator.set_deal_making_enabled(false);

    let zone = h.orchestrator.add_content(GroupKey(1), item(1, 10)).unwrap();
    let sealer = h.sealer();
    assert_eq!(sealer.run_once().await.sealed, 0);
    assert_eq!(
        h.orchestrator.staging().zone(zone).unwrap().state,
        ZoneState::Open
    );

    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(sealer.run_once().await.sealed, 1);
    assert_eq!(
        h.orchestrator.staging().zone(zone).unwrap().state,
        ZoneState::Sealed
    );
}

/// A refused zone stays full and is offered again on the next pass.
#[tokio::test]
async fn test_refused_zone_is_retried() {
    let h = Harness::new();
    let zone = h.orchestrator.add_content(GroupKey(1), item(1, 200)).unwrap();
    let sealer = h.sealer();

    h.sink.set_refuse(true);
    let pass = sealer.run_once().await;
    assert_eq!((pass.sealed, pass.failed), (0, 1));
    assert_eq!(
        h.orchestrator.staging().zone(zone).unwrap().state,
        ZoneState::Full
    );

    h.sink.set_refuse(false);
    assert_eq!(sealer.run_once().await.sealed, 1);
    // Sealed zones are not offered twice.
    assert_eq!(sealer.run_once().await.sealed, 0);
    assert_eq!(h.sink.accepted(), vec![zone]);
}

/// The sealer loop runs a pass as soon as deal making is re-enabled,
/// without waiting for its (hour-long) tick.
#[tokio::test(start_paused = true)]
async fn test_sealer_loop_wakes_on_reenable() {
    let h = Harness::new();
    h.orchestrator.set_deal_making_enabled(false);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sealer = h.sealer();
    let task = tokio::spawn(async move { sealer.run(shutdown_rx).await });

    // Let the loop subscribe and burn its immediate first tick.
    tokio::time::sleep(Duration::from_millis(5)).await;

    let zone = h.orchestrator.add_content(GroupKey(1), item(1, 150)).unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(h.sink.accepted().is_empty());

    h.orchestrator.set_deal_making_enabled(true);
    let sink = h.sink.clone();
    eventually(100, || sink.accepted() == vec![zone]).await;

    shutdown_tx.send(true).unwrap();
    task.await.unwrap();
}

/// Oversized content is staged alone and is immediately ready.
#[tokio::test]
async fn test_oversized_content_staged_alone() {
    let h = Harness::new();
    let group = GroupKey(9);

    let small = h.orchestrator.add_content(group, item(1, 10)).unwrap();
    let huge = h.orchestrator.add_content(group, item(2, 5_000)).unwrap();
    assert_ne!(small, huge);

    let zone = h.orchestrator.staging().zone(huge).unwrap();
    assert_eq!(zone.state, ZoneState::Full);
    assert_eq!(zone.items.len(), 1);
    // The small item's zone is still open for appends.
    assert_eq!(h.orchestrator.staging().open_zone(group), Some(small));
}
