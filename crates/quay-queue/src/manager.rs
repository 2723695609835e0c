//! Queue manager and its delayed-check timer.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use quay_types::{ContentId, QueueConfig};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::error::QueueError;

/// What happened to an enqueued id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// The id was queued (or scheduled).
    Queued,
    /// The id was already waiting; nothing new was queued.
    Coalesced,
}

#[derive(Default)]
struct QueueState {
    /// Ids sitting in the channel, not yet received.
    pending: HashSet<ContentId>,
    /// Delayed checks: id -> when it is due.
    scheduled: HashMap<ContentId, Instant>,
    /// Due times in order. Entries that no longer match `scheduled` are stale
    /// and skipped.
    timers: BinaryHeap<Reverse<(Instant, ContentId)>>,
}

impl QueueState {
    /// Schedule `id` at `at` unless it is already due no later than that.
    fn schedule(&mut self, id: ContentId, at: Instant) -> Enqueued {
        match self.scheduled.get(&id) {
            Some(&existing) if existing <= at => Enqueued::Coalesced,
            _ => {
                self.scheduled.insert(id, at);
                self.timers.push(Reverse((at, id)));
                Enqueued::Queued
            }
        }
    }

    /// Earliest live due time, dropping stale heap entries.
    fn next_due(&mut self) -> Option<Instant> {
        while let Some(Reverse((at, id))) = self.timers.peek().copied() {
            if self.scheduled.get(&id) == Some(&at) {
                return Some(at);
            }
            self.timers.pop();
        }
        None
    }

    /// Remove and return every id due at `now`.
    fn take_due(&mut self, now: Instant) -> Vec<ContentId> {
        let mut due = Vec::new();
        while let Some(at) = self.next_due() {
            if at > now {
                break;
            }
            if let Some(Reverse((_, id))) = self.timers.pop() {
                self.scheduled.remove(&id);
                due.push(id);
            }
        }
        due
    }
}

#[derive(Clone)]
struct Shared {
    tx: mpsc::Sender<ContentId>,
    state: Arc<Mutex<QueueState>>,
    wake: Arc<Notify>,
    config: QueueConfig,
}

impl Shared {
    fn enqueue(&self, id: ContentId) -> Result<Enqueued, QueueError> {
        let mut state = self.state.lock().expect("queue lock poisoned");
        if state.pending.contains(&id) {
            trace!(content = %id, "check coalesced");
            return Ok(Enqueued::Coalesced);
        }

        match self.tx.try_send(id) {
            Ok(()) => {
                state.pending.insert(id);
                state.scheduled.remove(&id);
                Ok(Enqueued::Queued)
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(QueueError::Backpressure {
                capacity: self.config.capacity,
            }),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(QueueError::Closed),
        }
    }

    fn enqueue_after(&self, id: ContentId, delay: Duration) -> Enqueued {
        let at = Instant::now() + delay;
        let outcome = {
            let mut state = self.state.lock().expect("queue lock poisoned");
            if state.pending.contains(&id) {
                return Enqueued::Coalesced;
            }
            state.schedule(id, at)
        };

        if outcome == Enqueued::Queued {
            self.wake.notify_one();
        }
        outcome
    }

    /// Timer loop: pushes scheduled checks into the channel when they are due.
    async fn run_timer(self) {
        loop {
            let next = self
                .state
                .lock()
                .expect("queue lock poisoned")
                .next_due();

            match next {
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => {}
                        _ = self.wake.notified() => continue,
                    }
                }
                None => {
                    self.wake.notified().await;
                    continue;
                }
            }

            let now = Instant::now();
            let due = self
                .state
                .lock()
                .expect("queue lock poisoned")
                .take_due(now);

            for id in due {
                match self.enqueue(id) {
                    Ok(_) => {}
                    Err(QueueError::Backpressure { capacity }) => {
                        debug!(content = %id, capacity, "check queue full, retrying later");
                        self.state
                            .lock()
                            .expect("queue lock poisoned")
                            .schedule(id, now + self.config.retry_delay);
                    }
                    Err(QueueError::Closed) => {
                        info!("check receiver dropped, stopping timer");
                        return;
                    }
                }
            }
        }
    }
}

/// Producer side of the check queue.
///
/// Dropping the manager stops the delayed-check timer. The receiver then
/// drains what is left in the channel and sees `None`.
pub struct QueueManager {
    shared: Shared,
    timer: JoinHandle<()>,
}

impl QueueManager {
    /// Create the queue and spawn its timer task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: QueueConfig) -> (Self, CheckReceiver) {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let state = Arc::new(Mutex::new(QueueState::default()));

        let shared = Shared {
            tx,
            state: state.clone(),
            wake: Arc::new(Notify::new()),
            config,
        };
        let timer = tokio::spawn(shared.clone().run_timer());

        info!(capacity = config.capacity, "check queue started");
        (Self { shared, timer }, CheckReceiver { rx, state })
    }

    /// Queue a check for `id` without blocking.
    ///
    /// Returns [`Enqueued::Coalesced`] if `id` is already waiting in the
    /// channel.
    pub fn enqueue(&self, id: ContentId) -> Result<Enqueued, QueueError> {
        let result = self.shared.enqueue(id);
        if let Err(QueueError::Backpressure { capacity }) = &result {
            warn!(content = %id, capacity, "check queue full");
        }
        result
    }

    /// Schedule a check for `id` after `delay`.
    ///
    /// Coalesces with a check already waiting in the channel or scheduled
    /// earlier. A check scheduled later is pulled forward. A due check that
    /// finds the channel full is retried after `retry_delay`.
    pub fn enqueue_after(&self, id: ContentId, delay: Duration) -> Enqueued {
        self.shared.enqueue_after(id, delay)
    }

    /// Whether `id` is waiting in the channel.
    pub fn is_pending(&self, id: ContentId) -> bool {
        self.shared
            .state
            .lock()
            .expect("queue lock poisoned")
            .pending
            .contains(&id)
    }

    /// Number of ids waiting in the channel.
    pub fn pending_len(&self) -> usize {
        self.shared
            .state
            .lock()
            .expect("queue lock poisoned")
            .pending
            .len()
    }

    /// Number of delayed checks not yet due.
    pub fn scheduled_len(&self) -> usize {
        self.shared
            .state
            .lock()
            .expect("queue lock poisoned")
            .scheduled
            .len()
    }

    /// Return the queue configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }
}

impl Drop for QueueManager {
    fn drop(&mut self) {
        self.timer.abort();
    }
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

/// Consumer side of the check queue.
pub struct CheckReceiver {
    rx: mpsc::Receiver<ContentId>,
    state: Arc<Mutex<QueueState>>,
}

impl CheckReceiver {
    /// Wait for the next check.
    ///
    /// Returns `None` once the manager is dropped and the channel drained.
    /// The returned id can be enqueued again immediately.
    pub async fn recv(&mut self) -> Option<ContentId> {
        let id = self.rx.recv().await?;
        self.clear_pending(id);
        Some(id)
    }

    /// Take the next check if one is waiting.
    pub fn try_recv(&mut self) -> Option<ContentId> {
        let id = self.rx.try_recv().ok()?;
        self.clear_pending(id);
        Some(id)
    }

    fn clear_pending(&self, id: ContentId) {
        self.state
            .lock()
            .expect("queue lock poisoned")
            .pending
            .remove(&id);
    }
}

impl std::fmt::Debug for CheckReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckReceiver").finish_non_exhaustive()
    }
}
