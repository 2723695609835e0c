//! Registry of in-progress retrievals.
//!
//! A retrieval fetches a content record's DAG from the storage network.
//! Only one retrieval per [`ContentId`] may run at a time; a second
//! requester either fails with [`RegistryError::AlreadyInProgress`] or
//! subscribes to the running one through [`RetrievalRegistry::wait`].

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use quay_types::{ContentId, RetrievalOutcome};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::error::RegistryError;

/// Snapshot of a running retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrievalProgress {
    /// Content being retrieved.
    pub content_id: ContentId,
    /// Bytes received so far.
    pub bytes: u64,
    /// Time since the retrieval began.
    pub elapsed: Duration,
}

/// Handle given to the task that performs a retrieval.
///
/// The holder must watch [`cancelled`](Self::cancelled) and finish with
/// [`RetrievalRegistry::end`] once it stops, whatever the reason.
#[derive(Debug)]
pub struct RetrievalTicket {
    content_id: ContentId,
    cancel: watch::Receiver<bool>,
}

impl RetrievalTicket {
    /// Content this ticket was issued for.
    pub fn content_id(&self) -> ContentId {
        self.content_id
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolve once cancellation is requested.
    ///
    /// Also resolves if the record was removed from the registry, since
    /// nobody can cancel it any more and the retriever should stop waiting.
    pub async fn cancelled(&mut self) {
        let _ = self.cancel.wait_for(|cancelled| *cancelled).await;
    }
}

struct RetrievalRecord {
    started_at: Instant,
    bytes: u64,
    cancel: watch::Sender<bool>,
    done: watch::Sender<Option<RetrievalOutcome>>,
}

/// At-most-one retrieval per content record.
#[derive(Default)]
pub struct RetrievalRegistry {
    records: Mutex<HashMap<ContentId, RetrievalRecord>>,
}

impl RetrievalRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new retrieval.
    ///
    /// Fails with [`RegistryError::AlreadyInProgress`] if one is already
    /// running for `content_id`.
    pub fn begin(&self, content_id: ContentId) -> Result<RetrievalTicket, RegistryError> {
        let mut records = self.records.lock().expect("retrieval lock poisoned");
        if records.contains_key(&content_id) {
            return Err(RegistryError::AlreadyInProgress(content_id));
        }

        let (cancel, cancel_rx) = watch::channel(false);
        let (done, _) = watch::channel(None);
        records.insert(
            content_id,
            RetrievalRecord {
                started_at: Instant::now(),
                bytes: 0,
                cancel,
                done,
            },
        );
        debug!(%content_id, "retrieval started");

        Ok(RetrievalTicket {
            content_id,
            cancel: cancel_rx,
        })
    }

    /// Update the byte counter of a running retrieval.
    pub fn record_progress(&self, content_id: ContentId, bytes: u64) {
        let mut records = self.records.lock().expect("retrieval lock poisoned");
        if let Some(record) = records.get_mut(&content_id) {
            record.bytes = bytes;
        }
    }

    /// Remove a retrieval and publish its outcome to waiters.
    ///
    /// Ending a retrieval that is not registered is a no-op.
    pub fn end(&self, content_id: ContentId, outcome: RetrievalOutcome) {
        let record = self
            .records
            .lock()
            .expect("retrieval lock poisoned")
            .remove(&content_id);

        if let Some(record) = record {
            debug!(
                %content_id,
                ?outcome,
                bytes = record.bytes,
                elapsed_ms = record.started_at.elapsed().as_millis() as u64,
                "retrieval ended"
            );
            record.done.send_replace(Some(outcome));
        }
    }

    /// Ask a running retrieval to stop.
    ///
    /// Returns `false` if nothing is registered for `content_id`.
    pub fn cancel(&self, content_id: ContentId) -> bool {
        let records = self.records.lock().expect("retrieval lock poisoned");
        match records.get(&content_id) {
            Some(record) => {
                record.cancel.send_replace(true);
                debug!(%content_id, "retrieval cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Subscribe to the outcome of a running retrieval.
    ///
    /// The receiver holds `None` until [`end`](Self::end) is called.
    pub fn wait(&self, content_id: ContentId) -> Option<watch::Receiver<Option<RetrievalOutcome>>> {
        let records = self.records.lock().expect("retrieval lock poisoned");
        records.get(&content_id).map(|r| r.done.subscribe())
    }

    /// Wait for a running retrieval to finish and return its outcome.
    ///
    /// Returns `None` immediately if no retrieval is registered.
    pub async fn join(&self, content_id: ContentId) -> Option<RetrievalOutcome> {
        let mut rx = self.wait(content_id)?;
        let outcome = rx.wait_for(Option::is_some).await.ok()?;
        outcome.clone()
    }

    /// Snapshot of a running retrieval.
    pub fn progress(&self, content_id: ContentId) -> Option<RetrievalProgress> {
        let records = self.records.lock().expect("retrieval lock poisoned");
        records.get(&content_id).map(|r| RetrievalProgress {
            content_id,
            bytes: r.bytes,
            elapsed: r.started_at.elapsed(),
        })
    }

    /// Whether a retrieval is registered for `content_id`.
    pub fn contains(&self, content_id: ContentId) -> bool {
        self.records
            .lock()
            .expect("retrieval lock poisoned")
            .contains_key(&content_id)
    }

    /// Number of running retrievals.
    pub fn len(&self) -> usize {
        self.records.lock().expect("retrieval lock poisoned").len()
    }

    /// Whether no retrieval is running.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for RetrievalRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrievalRegistry")
            .field("len", &self.len())
            .finish()
    }
}
