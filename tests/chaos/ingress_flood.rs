//! Chaos test: RPC ingress flood.
//!
//! Many shuttles report concurrently into a small ingress. Delivery never
//! blocks; every message is either applied or counted as dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use quay_engine::OrchestratorConfig;
use quay_integration_tests::{Harness, test_config};
use quay_shuttle::ShuttleError;
use quay_types::{
    ContentId, ShuttleConfig, ShuttleHandle, ShuttleMessage, TransferId, TransferState,
    TransferStatus,
};

const PRODUCERS: u64 = 8;
const PER_PRODUCER: u64 = 500;

fn small_ingress() -> OrchestratorConfig {
    let base = test_config();
    OrchestratorConfig {
        shuttle: ShuttleConfig {
            ingress_capacity: 32,
            ..base.shuttle
        },
        ..base
    }
}

/// Accepted plus dropped equals sent, and the consumer sees every accepted
/// message exactly once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_flood_accounts_for_every_message() {
    let mut h = Harness::with_config(small_ingress());
    let mut inbound = h.inbound.take().unwrap();
    let ingress = h.orchestrator.ingress().clone();

    let received = Arc::new(AtomicU64::new(0));
    let consumer = {
        let received = received.clone();
        tokio::spawn(async move {
            while inbound.recv().await.is_some() {
                received.fetch_add(1, Ordering::Relaxed);
                // Slow consumer so the channel fills up.
                if received.load(Ordering::Relaxed) % 64 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        })
    };

    let accepted = Arc::new(AtomicU64::new(0));
    let mut producers = Vec::new();
    for p in 0..PRODUCERS {
        let ingress = ingress.clone();
        let accepted = accepted.clone();
        producers.push(tokio::spawn(async move {
            let from = ShuttleHandle::new(format!("shuttle-{p}"));
            for i in 0..PER_PRODUCER {
                let msg = ShuttleMessage::RetrievalProgress {
                    content_id: ContentId(p * PER_PRODUCER + i),
                    bytes: i,
                };
                match ingress.deliver(from.clone(), msg) {
                    Ok(()) => {
                        accepted.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(ShuttleError::IngressFull { .. }) => {}
                    Err(e) => panic!("unexpected delivery error: {e}"),
                }
            }
        }));
    }
    for p in producers {
        p.await.unwrap();
    }

    let accepted = accepted.load(Ordering::Relaxed);
    assert_eq!(accepted + ingress.dropped(), PRODUCERS * PER_PRODUCER);

    tokio::time::timeout(Duration::from_secs(10), async {
        while received.load(Ordering::Relaxed) < accepted {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("consumer should drain every accepted message");
    assert_eq!(received.load(Ordering::Relaxed), accepted);

    consumer.abort();
}

/// Under a flood the orchestrator still applies every accepted report.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_flood_applied_by_orchestrator() {
    let mut h = Harness::with_config(small_ingress());
    let _ingress_loop = h.spawn_ingress();
    let ingress = h.orchestrator.ingress().clone();

    let accepted = Arc::new(AtomicU64::new(0));
    let mut producers = Vec::new();
    for p in 0..PRODUCERS {
        let ingress = ingress.clone();
        let accepted = accepted.clone();
        producers.push(tokio::spawn(async move {
            let from = ShuttleHandle::new(format!("shuttle-{p}"));
            for i in 0..PER_PRODUCER {
                let msg = ShuttleMessage::TransferStatus {
                    transfer_id: TransferId::new(format!("{p}-{i}")),
                    status: TransferStatus {
                        state: TransferState::Completed,
                        sent: i,
                        message: String::new(),
                    },
                };
                if ingress.deliver(from.clone(), msg).is_ok() {
                    accepted.fetch_add(1, Ordering::Relaxed);
                }
                if i % 50 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }));
    }
    for p in producers {
        p.await.unwrap();
    }

    let accepted = accepted.load(Ordering::Relaxed) as usize;
    assert!(accepted > 0);

    let orch = h.orchestrator.clone();
    tokio::time::timeout(Duration::from_secs(10), async move {
        while orch.transfers().len() < accepted {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("every accepted report should be applied");
    assert_eq!(h.orchestrator.transfers().len(), accepted);
}
