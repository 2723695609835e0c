//! Chaos test: shuttles connecting and disconnecting under load.
//!
//! Shuttles churn while commands are sent and the orchestrator ranks them
//! by latency. The registry must never hold two live sessions for one
//! handle and must end up empty once everyone has left.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use iroh::EndpointAddr;
use quay_integration_tests::{Harness, hello, key, peer};
use quay_shuttle::ShuttleError;
use quay_types::{ContentId, ShuttleCommand, ShuttleHandle};
use tokio::sync::mpsc;

/// Every task fights for the same handle; at most one holds it at a time.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_handle_contention() {
    let h = Harness::new();
    let holders = Arc::new(AtomicUsize::new(0));
    let wins = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let orch = h.orchestrator.clone();
        let holders = holders.clone();
        let wins = wins.clone();
        tasks.push(tokio::spawn(async move {
            let handle = ShuttleHandle::from("contended");
            for _ in 0..100 {
                let (tx, mut rx) = mpsc::channel(4);
                match orch.shuttles().connect(hello("contended"), None, tx.clone()) {
                    Ok(()) => {
                        let prev = holders.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(prev, 0, "two live sessions for one handle");
                        wins.fetch_add(1, Ordering::Relaxed);

                        let cmd = ShuttleCommand::Unpin {
                            content_id: ContentId(1),
                        };
                        orch.shuttles().send(&handle, cmd.clone()).unwrap();
                        assert_eq!(rx.recv().await, Some(cmd));

                        holders.fetch_sub(1, Ordering::SeqCst);
                        assert!(orch.shuttles().disconnect_channel(&handle, &tx));
                    }
                    Err(ShuttleError::DuplicateShuttle(_)) => tokio::task::yield_now().await,
                    Err(e) => panic!("unexpected connect error: {e}"),
                }
            }
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }

    assert!(wins.load(Ordering::Relaxed) > 0);
    assert!(h.orchestrator.shuttles().is_empty());
}

/// Distinct shuttles churn while the orchestrator keeps ranking them.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_churn_while_ranking() {
    let h = Harness::new();
    for n in 1..=8u8 {
        h.network.set_rtt(peer(n), Duration::from_millis(u64::from(n)));
    }

    let stop = Arc::new(AtomicBool::new(false));
    let ranker = {
        let orch = h.orchestrator.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut rounds = 0usize;
            while !stop.load(Ordering::Relaxed) {
                let ranked = orch.rank_shuttles(8).await;
                assert!(ranked.len() <= 8);
                // Handles are distinct.
                let mut sorted = ranked.clone();
                sorted.sort();
                sorted.dedup();
                assert_eq!(sorted.len(), ranked.len());
                rounds += 1;
                tokio::task::yield_now().await;
            }
            rounds
        })
    };

    let mut tasks = Vec::new();
    for n in 1..=8u8 {
        let orch = h.orchestrator.clone();
        tasks.push(tokio::spawn(async move {
            let name = format!("shuttle-{n}");
            let handle = ShuttleHandle::new(name.clone());
            orch.address_book()
                .insert_permanent(peer(n), EndpointAddr::new(key(n).public()));
            for _ in 0..50 {
                let (tx, rx) = mpsc::channel(4);
                orch.shuttles()
                    .connect(hello(&name), Some(peer(n)), tx.clone())
                    .unwrap();
                tokio::time::sleep(Duration::from_millis(1)).await;
                drop(rx);
                assert!(orch.shuttles().disconnect_channel(&handle, &tx));
            }
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }

    stop.store(true, Ordering::Relaxed);
    let rounds = ranker.await.unwrap();
    assert!(rounds > 0);
    assert!(h.orchestrator.shuttles().is_empty());
}
