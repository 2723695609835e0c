//! Incoming protocol handler for the Quay daemon.
//!
//! Implements iroh's [`ProtocolHandler`] trait for connections dispatched
//! by the iroh [`Router`]. A connection is either a latency probe (a `Ping`
//! on a bi-stream) or a shuttle session: the shuttle registers with a
//! `Hello` request, then streams [`ShuttleMessage`]s on uni streams while a
//! forwarder task pushes orchestrator commands back to it.
//!
//! [`ProtocolHandler`]: iroh::protocol::ProtocolHandler
//! [`Router`]: iroh::protocol::Router

use std::fmt;
use std::sync::{Arc, Mutex};

use iroh::endpoint::Connection;
use iroh::protocol::AcceptError;
use quay_engine::Orchestrator;
use quay_net::{QuayMessage, QuayTransport};
use quay_types::{PeerId, ShuttleCommand, ShuttleHandle, ShuttleHello, ShuttleMessage};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Handles incoming Quay protocol connections.
#[derive(Clone)]
pub struct ShuttleProtocol {
    orchestrator: Arc<Orchestrator>,
}

impl fmt::Debug for ShuttleProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShuttleProtocol").finish_non_exhaustive()
    }
}

impl ShuttleProtocol {
    /// Create a new protocol handler.
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

impl iroh::protocol::ProtocolHandler for ShuttleProtocol {
    async fn accept(&self, conn: Connection) -> Result<(), AcceptError> {
        let remote_id = conn.remote_id();
        debug!(remote = %remote_id.fmt_short(), "incoming connection");

        let session = Arc::new(Session::new(self.orchestrator.clone(), remote_id));

        let uni = {
            let conn = conn.clone();
            let session = session.clone();
            async move {
                QuayTransport::handle_connection(conn, move |msg| {
                    let session = session.clone();
                    async move { session.on_uni(msg) }
                })
                .await;
            }
        };

        let bi = {
            let conn = conn.clone();
            let session = session.clone();
            async move {
                QuayTransport::handle_bi_streams(conn.clone(), move |msg| {
                    let session = session.clone();
                    let conn = conn.clone();
                    async move {
                        match msg {
                            QuayMessage::Ping { timestamp } => Some(QuayMessage::Pong { timestamp }),
                            QuayMessage::Hello(hello) => {
                                let (ack, commands) = session.hello(hello);
                                if let Some(commands) = commands {
                                    tokio::spawn(forward_commands(conn, commands));
                                }
                                Some(ack)
                            }
                            other => {
                                debug!("unhandled bi-stream message: {other:?}");
                                None
                            }
                        }
                    }
                })
                .await;
            }
        };

        tokio::spawn(async move {
            tokio::join!(uni, bi);
            session.close();
        });

        Ok(())
    }
}

/// Push orchestrator commands to a shuttle until either side goes away.
async fn forward_commands(conn: Connection, mut commands: mpsc::Receiver<ShuttleCommand>) {
    while let Some(command) = commands.recv().await {
        if let Err(e) = QuayTransport::send_message(&conn, &QuayMessage::Command(command)).await {
            warn!(error = %e, "failed to forward command to shuttle");
            break;
        }
    }
    debug!("command forwarder stopped");
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// State of one connection: which shuttle, if any, registered on it.
///
/// The session mutex only guards [`SessionState`] transitions; the shuttle
/// registry and the address book are called with it released.
pub(crate) struct Session {
    orchestrator: Arc<Orchestrator>,
    remote_id: iroh::EndpointId,
    peer: PeerId,
    state: Mutex<SessionState>,
}

enum SessionState {
    /// No hello yet.
    Fresh,
    /// A hello is being registered.
    Registering,
    Registered(Registration),
    Closed,
}

#[derive(Clone)]
struct Registration {
    handle: ShuttleHandle,
    outbound: mpsc::Sender<ShuttleCommand>,
}

impl Session {
    pub(crate) fn new(orchestrator: Arc<Orchestrator>, remote_id: iroh::EndpointId) -> Self {
        Self {
            orchestrator,
            remote_id,
            peer: PeerId::from(*remote_id.as_bytes()),
            state: Mutex::new(SessionState::Fresh),
        }
    }

    /// Register the shuttle announced by `hello`.
    ///
    /// Returns the `HelloAck` to send back and, when accepted, the receiver
    /// the command forwarder drains.
    pub(crate) fn hello(
        &self,
        hello: ShuttleHello,
    ) -> (QuayMessage, Option<mpsc::Receiver<ShuttleCommand>>) {
        {
            let mut state = self.state.lock().expect("session lock poisoned");
            match &*state {
                SessionState::Fresh => *state = SessionState::Registering,
                SessionState::Registered(existing) => {
                    warn!(handle = %existing.handle, "repeated hello on one connection");
                    return (
                        rejected(format!("already registered as {}", existing.handle)),
                        None,
                    );
                }
                SessionState::Registering => {
                    return (rejected("hello already in progress".into()), None);
                }
                SessionState::Closed => return (rejected("connection closed".into()), None),
            }
        }

        let shuttles = self.orchestrator.shuttles();
        let (tx, rx) = mpsc::channel(shuttles.config().outbound_capacity.max(1));
        let handle = hello.handle.clone();

        if let Err(e) = shuttles.connect(hello, Some(self.peer), tx.clone()) {
            let mut state = self.state.lock().expect("session lock poisoned");
            if matches!(*state, SessionState::Registering) {
                *state = SessionState::Fresh;
            }
            return (rejected(e.to_string()), None);
        }
        self.orchestrator
            .address_book()
            .insert_permanent(self.peer, iroh::EndpointAddr::new(self.remote_id));

        let registration = Registration {
            handle: handle.clone(),
            outbound: tx,
        };
        let closed = {
            let mut state = self.state.lock().expect("session lock poisoned");
            if matches!(*state, SessionState::Closed) {
                true
            } else {
                *state = SessionState::Registered(registration.clone());
                false
            }
        };
        if closed {
            // The connection went away while registering.
            self.unregister(registration);
            return (rejected("connection closed".into()), None);
        }

        info!(%handle, peer = %self.peer.fmt_short(), "shuttle session opened");
        (
            QuayMessage::HelloAck {
                accepted: true,
                reason: None,
            },
            Some(rx),
        )
    }

    /// Handle a message that arrived on a uni stream.
    pub(crate) fn on_uni(&self, msg: QuayMessage) {
        match msg {
            QuayMessage::Shuttle(message) => self.deliver(message),
            other => debug!("unhandled uni-stream message: {other:?}"),
        }
    }

    fn deliver(&self, message: ShuttleMessage) {
        let handle = match &*self.state.lock().expect("session lock poisoned") {
            SessionState::Registered(r) => Some(r.handle.clone()),
            _ => None,
        };

        let Some(handle) = handle else {
            warn!(peer = %self.peer.fmt_short(), "shuttle message before hello, dropping");
            return;
        };
        if let Err(e) = self.orchestrator.ingress().deliver(handle, message) {
            debug!(error = %e, "shuttle message not delivered");
        }
    }

    /// Drop the registration made on this connection, if it is still the
    /// current one for its handle, and hand its work back.
    pub(crate) fn close(&self) {
        let previous = std::mem::replace(
            &mut *self.state.lock().expect("session lock poisoned"),
            SessionState::Closed,
        );
        if let SessionState::Registered(registration) = previous {
            self.unregister(registration);
        }
    }

    fn unregister(&self, Registration { handle, outbound }: Registration) {
        if self.orchestrator.disconnect_shuttle(&handle, &outbound) {
            self.orchestrator.address_book().remove(&self.peer);
        }
        info!(%handle, "shuttle session closed");
    }
}

fn rejected(reason: String) -> QuayMessage {
    QuayMessage::HelloAck {
        accepted: false,
        reason: Some(reason),
    }
}
