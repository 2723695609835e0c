//! Inbound shuttle RPC channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use quay_types::{ShuttleHandle, ShuttleMessage};
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::ShuttleError;

/// A message received from a shuttle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Shuttle that sent the message.
    pub from: ShuttleHandle,
    /// The message itself.
    pub message: ShuttleMessage,
}

/// Sending side of the bounded channel that carries shuttle messages to
/// the orchestrator.
///
/// Delivery never blocks the connection that received the message. When
/// the channel is full the newest message is dropped, the drop counter is
/// incremented and [`ShuttleError::IngressFull`] is returned. Message loss
/// is an accepted failure mode here: shuttles report state repeatedly
/// (heartbeats, transfer status), so a dropped message is superseded by a
/// later one.
#[derive(Clone)]
pub struct RpcIngress {
    tx: mpsc::Sender<InboundMessage>,
    dropped: Arc<AtomicU64>,
    capacity: usize,
}

impl RpcIngress {
    /// Create the channel with room for `capacity` messages.
    pub fn new(capacity: usize) -> (Self, IngressReceiver) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let ingress = Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
            capacity,
        };
        (ingress, IngressReceiver { rx })
    }

    /// Hand a shuttle message to the orchestrator without blocking.
    pub fn deliver(&self, from: ShuttleHandle, message: ShuttleMessage) -> Result<(), ShuttleError> {
        match self.tx.try_send(InboundMessage { from, message }) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(msg)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(from = %msg.from, dropped, "rpc ingress full, dropping message");
                Err(ShuttleError::IngressFull { dropped })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ShuttleError::IngressClosed),
        }
    }

    /// Messages dropped because the channel was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Channel capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl std::fmt::Debug for RpcIngress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcIngress")
            .field("capacity", &self.capacity)
            .field("dropped", &self.dropped())
            .finish()
    }
}

/// Receiving side of the RPC ingress.
#[derive(Debug)]
pub struct IngressReceiver {
    rx: mpsc::Receiver<InboundMessage>,
}

impl IngressReceiver {
    /// Wait for the next message. `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<InboundMessage> {
        self.rx.recv().await
    }

    /// Take the next message if one is waiting.
    pub fn try_recv(&mut self) -> Option<InboundMessage> {
        self.rx.try_recv().ok()
    }
}
