//! Integration test: shuttle RPC round trips.
//!
//! Shuttles are registered with the orchestrator, receive commands on
//! their outbound channel and report back through the RPC ingress, which
//! the orchestrator's ingress loop applies to the registries.

use std::time::Duration;

use quay_engine::EngineError;
use quay_integration_tests::{Harness, eventually, hello, item};
use quay_registry::RetrievalOutcome;
use quay_shuttle::ShuttleError;
use quay_types::{
    ContentId, GroupKey, ShuttleCommand, ShuttleHandle, ShuttleMessage, ShuttleStatus,
    TransferId, TransferState, TransferStatus,
};
use tokio::sync::mpsc;

/// Pin request goes out, completion comes back through the ingress, the
/// inflight mark is cleared and the content is queued for a re-check.
#[tokio::test]
async fn test_pin_roundtrip_through_ingress() {
    let mut h = Harness::new();
    let _ingress = h.spawn_ingress();
    let mut commands = h.connect_shuttle("shuttle-1", 1);
    let handle = ShuttleHandle::from("shuttle-1");

    let it = item(7, 40);
    h.orchestrator.add_content(GroupKey(1), it).unwrap();
    assert_eq!(h.checks.recv().await, Some(it.content_id));

    h.orchestrator.pin_on(&handle, it.content_id, it.cid).unwrap();
    assert!(h.orchestrator.inflight().is_inflight(it.cid));
    assert_eq!(
        commands.recv().await,
        Some(ShuttleCommand::AddPin {
            content_id: it.content_id,
            cid: it.cid,
        })
    );

    h.orchestrator
        .ingress()
        .deliver(
            handle,
            ShuttleMessage::PinComplete {
                content_id: it.content_id,
                cid: it.cid,
                size: it.size,
            },
        )
        .unwrap();

    assert_eq!(h.checks.recv().await, Some(it.content_id));
    assert!(!h.orchestrator.inflight().is_inflight(it.cid));
}

/// Two concurrent fetches of the same CID keep it inflight until both end.
#[tokio::test]
async fn test_inflight_refcount_across_shuttles() {
    let mut h = Harness::new();
    let _ingress = h.spawn_ingress();
    let _c1 = h.connect_shuttle("a", 1);
    let _c2 = h.connect_shuttle("b", 2);

    let it = item(3, 10);
    h.orchestrator
        .pin_on(&ShuttleHandle::from("a"), it.content_id, it.cid)
        .unwrap();
    h.orchestrator
        .pin_on(&ShuttleHandle::from("b"), it.content_id, it.cid)
        .unwrap();
    assert_eq!(h.orchestrator.inflight().count(it.cid), 2);

    let done = ShuttleMessage::PinComplete {
        content_id: it.content_id,
        cid: it.cid,
        size: it.size,
    };
    h.orchestrator
        .ingress()
        .deliver(ShuttleHandle::from("a"), done.clone())
        .unwrap();
    assert_eq!(h.checks.recv().await, Some(it.content_id));
    assert_eq!(h.orchestrator.inflight().count(it.cid), 1);

    h.orchestrator
        .ingress()
        .deliver(ShuttleHandle::from("b"), done)
        .unwrap();
    let orch = h.orchestrator.clone();
    eventually(100, || orch.inflight().is_empty()).await;
}

/// Heartbeats and transfer reports land in the registry and the cache.
#[tokio::test]
async fn test_status_reports_applied() {
    let mut h = Harness::new();
    let _ingress = h.spawn_ingress();
    let _commands = h.connect_shuttle("s", 1);
    let handle = ShuttleHandle::from("s");

    let status = ShuttleStatus {
        blockstore_free: 4 << 30,
        pin_count: 120,
        pin_queue_len: 4,
        space_low: false,
    };
    let transfer = TransferId::from("chan-42");
    let report = TransferStatus {
        state: TransferState::Failed,
        sent: 9_000,
        message: "provider rejected".into(),
    };

    let ingress = h.orchestrator.ingress();
    ingress
        .deliver(handle.clone(), ShuttleMessage::Heartbeat(status.clone()))
        .unwrap();
    ingress
        .deliver(
            handle.clone(),
            ShuttleMessage::TransferStatus {
                transfer_id: transfer.clone(),
                status: report.clone(),
            },
        )
        .unwrap();

    let orch = h.orchestrator.clone();
    eventually(100, || orch.transfers().get(&transfer).is_some()).await;
    assert_eq!(h.orchestrator.transfers().get(&transfer), Some(report));
    assert_eq!(h.orchestrator.shuttles().get(&handle).unwrap().status, status);
}

/// A failed pin is re-checked after the retry delay.
#[tokio::test(start_paused = true)]
async fn test_pin_failure_rechecked_later() {
    let mut h = Harness::new();
    let _ingress = h.spawn_ingress();
    let _commands = h.connect_shuttle("s", 1);
    let handle = ShuttleHandle::from("s");

    let it = item(11, 10);
    h.orchestrator.pin_on(&handle, it.content_id, it.cid).unwrap();
    h.orchestrator
        .ingress()
        .deliver(
            handle,
            ShuttleMessage::PinFailed {
                content_id: it.content_id,
                cid: it.cid,
                reason: "blockstore full".into(),
            },
        )
        .unwrap();

    let start = tokio::time::Instant::now();
    assert_eq!(h.checks.recv().await, Some(it.content_id));
    assert!(start.elapsed() >= Duration::from_millis(500));
    assert!(h.orchestrator.inflight().is_empty());
}

/// Retrievals are exclusive per content id, report progress and end when
/// the shuttle confirms a cancellation.
#[tokio::test]
async fn test_retrieval_lifecycle() {
    let mut h = Harness::new();
    let _ingress = h.spawn_ingress();
    let mut commands = h.connect_shuttle("s", 1);
    let handle = ShuttleHandle::from("s");
    let it = item(21, 10);

    let ticket = h
        .orchestrator
        .start_retrieval(&handle, it.content_id, it.cid)
        .unwrap();
    assert!(matches!(
        commands.recv().await,
        Some(ShuttleCommand::RetrieveContent { .. })
    ));
    assert!(matches!(
        h.orchestrator.start_retrieval(&handle, it.content_id, it.cid),
        Err(EngineError::Registry(_))
    ));

    h.orchestrator
        .ingress()
        .deliver(
            handle.clone(),
            ShuttleMessage::RetrievalProgress {
                content_id: it.content_id,
                bytes: 2_048,
            },
        )
        .unwrap();
    let orch = h.orchestrator.clone();
    eventually(100, || {
        orch.retrievals()
            .progress(it.content_id)
            .is_some_and(|p| p.bytes == 2_048)
    })
    .await;

    let mut outcome = h.orchestrator.retrievals().wait(it.content_id).unwrap();
    assert!(h.orchestrator.cancel_retrieval(it.content_id));
    assert!(ticket.is_cancelled());

    // The shuttle stops and reports back over the ingress.
    assert_eq!(
        commands.recv().await,
        Some(ShuttleCommand::CancelRetrieval {
            content_id: it.content_id,
        })
    );
    h.orchestrator
        .ingress()
        .deliver(
            handle.clone(),
            ShuttleMessage::RetrievalFinished {
                content_id: it.content_id,
                outcome: RetrievalOutcome::Cancelled,
            },
        )
        .unwrap();
    outcome.wait_for(Option::is_some).await.unwrap();
    assert_eq!(*outcome.borrow(), Some(RetrievalOutcome::Cancelled));
    assert!(!h.orchestrator.retrievals().contains(it.content_id));

    // The id is free again.
    assert!(
        h.orchestrator
            .start_retrieval(&handle, it.content_id, it.cid)
            .is_ok()
    );
}

/// A retrieval reported as done frees its id and queues a check.
#[tokio::test]
async fn test_retrieval_completion_frees_id() {
    let mut h = Harness::new();
    let _ingress = h.spawn_ingress();
    let _commands = h.connect_shuttle("s", 1);
    let handle = ShuttleHandle::from("s");
    let it = item(22, 10);

    h.orchestrator
        .start_retrieval(&handle, it.content_id, it.cid)
        .unwrap();
    h.orchestrator
        .ingress()
        .deliver(
            handle.clone(),
            ShuttleMessage::RetrievalFinished {
                content_id: it.content_id,
                outcome: RetrievalOutcome::Succeeded,
            },
        )
        .unwrap();

    assert_eq!(h.checks.recv().await, Some(it.content_id));
    assert!(h.orchestrator.retrievals().is_empty());
    assert!(
        h.orchestrator
            .start_retrieval(&handle, it.content_id, it.cid)
            .is_ok()
    );
}

/// A shuttle that goes away gives back its pins and retrievals; another
/// shuttle can pick the work up.
#[tokio::test]
async fn test_disconnect_releases_work() {
    let mut h = Harness::new();
    let _ingress = h.spawn_ingress();
    let (tx, _commands) = h.connect_session("leaving", 1);
    let _other = h.connect_shuttle("staying", 2);
    let leaving = ShuttleHandle::from("leaving");
    let staying = ShuttleHandle::from("staying");

    let pinned = item(31, 10);
    let fetched = item(32, 10);
    h.orchestrator
        .pin_on(&leaving, pinned.content_id, pinned.cid)
        .unwrap();
    h.orchestrator
        .start_retrieval(&leaving, fetched.content_id, fetched.cid)
        .unwrap();
    let mut outcome = h
        .orchestrator
        .retrievals()
        .wait(fetched.content_id)
        .unwrap();

    assert!(h.orchestrator.disconnect_shuttle(&leaving, &tx));

    outcome.wait_for(Option::is_some).await.unwrap();
    assert!(matches!(
        *outcome.borrow(),
        Some(RetrievalOutcome::Failed(_))
    ));
    assert!(h.orchestrator.inflight().is_empty());
    assert_eq!(h.checks.recv().await, Some(pinned.content_id));

    // A late report from the departed shuttle changes nothing.
    h.orchestrator
        .ingress()
        .deliver(
            leaving,
            ShuttleMessage::PinComplete {
                content_id: pinned.content_id,
                cid: pinned.cid,
                size: pinned.size,
            },
        )
        .unwrap();

    h.orchestrator
        .pin_on(&staying, pinned.content_id, pinned.cid)
        .unwrap();
    h.orchestrator
        .start_retrieval(&staying, fetched.content_id, fetched.cid)
        .unwrap();
    assert_eq!(h.orchestrator.assignments().pin_count(&staying), 1);
}

/// A live handle cannot be taken over; a dead channel can.
#[tokio::test]
async fn test_shuttle_reconnect() {
    let h = Harness::new();
    let shuttles = h.orchestrator.shuttles();
    let handle = ShuttleHandle::from("s");

    let (tx1, rx1) = mpsc::channel(4);
    shuttles.connect(hello("s"), None, tx1.clone()).unwrap();

    let (tx2, mut rx2) = mpsc::channel(4);
    assert_eq!(
        shuttles.connect(hello("s"), None, tx2.clone()).unwrap_err(),
        ShuttleError::DuplicateShuttle(handle.clone())
    );

    drop(rx1);
    shuttles.connect(hello("s"), None, tx2).unwrap();
    // The old connection's cleanup must not evict the new one.
    assert!(!shuttles.disconnect_channel(&handle, &tx1));

    let cmd = ShuttleCommand::Unpin {
        content_id: ContentId(1),
    };
    h.orchestrator.shuttles().send(&handle, cmd.clone()).unwrap();
    assert_eq!(rx2.recv().await, Some(cmd));
}

/// Commands to a vanished shuttle fail without leaving inflight marks.
#[tokio::test]
async fn test_pin_on_disconnected_shuttle() {
    let h = Harness::new();
    let commands = h.connect_shuttle("s", 1);
    drop(commands);

    let it = item(1, 10);
    let err = h
        .orchestrator
        .pin_on(&ShuttleHandle::from("s"), it.content_id, it.cid)
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Shuttle(ShuttleError::ShuttleDisconnected(_))
    ));
    assert!(h.orchestrator.inflight().is_empty());
}
