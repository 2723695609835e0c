//! Network transport built on iroh QUIC.
//!
//! [`QuayTransport`] wraps an iroh [`Endpoint`] and provides:
//! - Connection pooling (reuse connections to the same peer).
//! - Message send/receive with length-prefixed postcard encoding.
//! - Request/response over bi-streams, and latency probes built on it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use iroh::endpoint::{Connection, RecvStream, SendStream};
use iroh::{Endpoint, EndpointAddr, SecretKey};
use quay_types::PeerId;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::QUAY_ALPN;
use crate::address_book::AddressBook;
use crate::error::NetError;
use crate::message::QuayMessage;

/// Maximum message size: 16 MB. Control messages are tiny; the bound only
/// protects against a corrupt length prefix.
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Network transport for orchestrator ⇄ shuttle and probe traffic.
///
/// Manages an iroh QUIC endpoint, a connection pool to peers, and the
/// address book used to resolve a [`PeerId`] into a dialable address.
pub struct QuayTransport {
    endpoint: Endpoint,
    /// Cached connections to remote peers, keyed by their iroh endpoint ID.
    ///
    /// Never held across a dial: one unreachable peer must not stall
    /// connections to every other peer.
    connections: Arc<Mutex<HashMap<iroh::EndpointId, Connection>>>,
    address_book: Arc<AddressBook>,
    /// ALPN used for outgoing connections.
    alpn: Vec<u8>,
}

impl QuayTransport {
    /// Bind a new endpoint with the default ALPN (`quay/0`).
    ///
    /// Use [`iroh::RelayMode::Disabled`] for tests that don't need relay servers.
    pub async fn bind(
        secret_key: SecretKey,
        relay_mode: iroh::RelayMode,
        address_book: Arc<AddressBook>,
    ) -> Result<Self, NetError> {
        let alpn = QUAY_ALPN.to_vec();
        let endpoint = Endpoint::builder()
            .secret_key(secret_key)
            .alpns(vec![alpn.clone()])
            .relay_mode(relay_mode)
            .bind()
            .await
            .map_err(|e| NetError::Endpoint(e.to_string()))?;

        Ok(Self::from_endpoint_with_alpn(endpoint, alpn, address_book))
    }

    /// Wrap an existing endpoint with a custom ALPN.
    ///
    /// Use this when the endpoint is shared with an iroh [`Router`] and the
    /// transport is only used for *outgoing* connections.
    ///
    /// [`Router`]: iroh::protocol::Router
    pub fn from_endpoint_with_alpn(
        endpoint: Endpoint,
        alpn: Vec<u8>,
        address_book: Arc<AddressBook>,
    ) -> Self {
        Self {
            endpoint,
            connections: Arc::new(Mutex::new(HashMap::new())),
            address_book,
            alpn,
        }
    }

    /// Return a reference to the underlying iroh endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Return the shared address book.
    pub fn address_book(&self) -> &Arc<AddressBook> {
        &self.address_book
    }

    /// Return this endpoint's identity as a [`PeerId`].
    pub fn peer_id(&self) -> PeerId {
        PeerId::from(*self.endpoint.id().as_bytes())
    }

    // -------------------------------------------------------------------
    // Connection management
    // -------------------------------------------------------------------

    /// Get or establish a QUIC connection to a remote peer.
    ///
    /// Dials without holding the cache lock. If two callers dial the same
    /// peer at once, the first live connection cached wins and the other is
    /// closed.
    async fn get_connection(&self, addr: EndpointAddr) -> Result<Connection, NetError> {
        let remote_id = addr.id;
        if let Some(conn) = self.cached(&remote_id).await {
            return Ok(conn);
        }

        debug!(remote = %remote_id.fmt_short(), "connecting to peer");
        let conn = self
            .endpoint
            .connect(addr, &self.alpn)
            .await
            .map_err(|e| NetError::Connect(e.to_string()))?;

        let mut cache = self.connections.lock().await;
        if let Some(existing) = cache.get(&remote_id)
            && existing.close_reason().is_none()
        {
            conn.close(0u32.into(), b"duplicate");
            return Ok(existing.clone());
        }
        cache.insert(remote_id, conn.clone());
        Ok(conn)
    }

    /// A cached connection to `remote_id` that is still open.
    async fn cached(&self, remote_id: &iroh::EndpointId) -> Option<Connection> {
        self.connections
            .lock()
            .await
            .get(remote_id)
            .filter(|conn| conn.close_reason().is_none())
            .cloned()
    }

    /// Resolve a peer through the address book and connect to it.
    async fn connect_peer(&self, peer: PeerId) -> Result<Connection, NetError> {
        let addr = self
            .address_book
            .get(&peer)
            .ok_or(NetError::UnknownPeer(peer))?;
        self.get_connection(addr).await
    }

    /// Remove a cached connection (e.g. after detecting it's dead).
    pub async fn remove_connection(&self, id: &iroh::EndpointId) {
        self.connections.lock().await.remove(id);
    }

    // -------------------------------------------------------------------
    // High-level operations
    // -------------------------------------------------------------------

    /// Measure the round-trip time of a `Ping`/`Pong` exchange with `peer`.
    ///
    /// Connection setup is excluded from the measurement; only the stream
    /// round trip is timed.
    pub async fn ping(&self, peer: PeerId) -> Result<Duration, NetError> {
        let conn = self.connect_peer(peer).await?;
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        let start = Instant::now();
        let response = match Self::request_on(&conn, &QuayMessage::Ping { timestamp }).await {
            Ok(response) => response,
            Err(e) => {
                // Next ping dials afresh.
                self.remove_connection(&conn.remote_id()).await;
                return Err(e);
            }
        };
        let rtt = start.elapsed();

        match response {
            QuayMessage::Pong { timestamp: echoed } if echoed == timestamp => Ok(rtt),
            other => Err(NetError::UnexpectedResponse(format!(
                "expected Pong({timestamp}), got: {other:?}"
            ))),
        }
    }

    // -------------------------------------------------------------------
    // Low-level message send/receive
    // -------------------------------------------------------------------

    /// Send a request on a new bi-stream of `conn` and read one response.
    pub async fn request_on(
        conn: &Connection,
        request: &QuayMessage,
    ) -> Result<QuayMessage, NetError> {
        let (mut send, mut recv) = conn
            .open_bi()
            .await
            .map_err(|e| NetError::StreamOpen(e.to_string()))?;

        Self::send_on_stream(&mut send, request).await?;
        Self::recv_message(&mut recv).await
    }

    /// Send a message over a new uni-directional stream on the given connection.
    ///
    /// The message is length-prefixed (4-byte big-endian) then postcard-encoded.
    pub async fn send_message(conn: &Connection, message: &QuayMessage) -> Result<(), NetError> {
        let mut send = conn
            .open_uni()
            .await
            .map_err(|e| NetError::StreamOpen(e.to_string()))?;

        Self::send_on_stream(&mut send, message).await
    }

    /// Send a message on an already-open send stream and finish it.
    pub async fn send_on_stream(
        send: &mut SendStream,
        message: &QuayMessage,
    ) -> Result<(), NetError> {
        let payload = encode_frame(message)?;
        send.write_all(&payload).await?;
        send.finish()?;
        Ok(())
    }

    /// Receive a message from a receive stream.
    ///
    /// Reads a 4-byte big-endian length prefix, then reads that many bytes
    /// and deserializes with postcard.
    pub async fn recv_message(recv: &mut RecvStream) -> Result<QuayMessage, NetError> {
        let mut len_buf = [0u8; 4];
        recv.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;

        if len > MAX_MESSAGE_SIZE {
            return Err(NetError::Serialization(format!(
                "message too large: {len} bytes (max {MAX_MESSAGE_SIZE})"
            )));
        }

        let payload = recv.read_to_end(len).await?;
        postcard::from_bytes(&payload).map_err(|e| NetError::Serialization(e.to_string()))
    }

    // -------------------------------------------------------------------
    // Incoming message handling
    // -------------------------------------------------------------------

    /// Accept incoming uni-directional streams on a connection and dispatch
    /// messages to `handler`. Runs until the connection is closed.
    pub async fn handle_connection<F, Fut>(conn: Connection, handler: F)
    where
        F: Fn(QuayMessage) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        loop {
            match conn.accept_uni().await {
                Ok(mut recv) => match Self::recv_message(&mut recv).await {
                    Ok(msg) => handler(msg).await,
                    Err(e) => {
                        warn!("failed to decode message: {e}");
                    }
                },
                Err(e) => {
                    debug!("connection closed: {e}");
                    break;
                }
            }
        }
    }

    /// Handle incoming bidirectional streams (request/response).
    ///
    /// For each incoming bi stream, reads a request and calls the handler,
    /// which may produce a response sent back on the same stream.
    pub async fn handle_bi_streams<F, Fut>(conn: Connection, handler: F)
    where
        F: Fn(QuayMessage) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Option<QuayMessage>> + Send,
    {
        loop {
            match conn.accept_bi().await {
                Ok((mut send, mut recv)) => match Self::recv_message(&mut recv).await {
                    Ok(request) => {
                        if let Some(response) = handler(request).await
                            && let Err(e) = Self::send_on_stream(&mut send, &response).await
                        {
                            warn!("failed to send response: {e}");
                        }
                    }
                    Err(e) => {
                        warn!("failed to decode bi-stream request: {e}");
                    }
                },
                Err(e) => {
                    debug!("connection closed (bi): {e}");
                    break;
                }
            }
        }
    }

    /// Gracefully close the transport.
    pub async fn close(&self) {
        self.endpoint.close().await;
    }
}

/// Encode a message as a length-prefixed postcard frame.
pub fn encode_frame(message: &QuayMessage) -> Result<Vec<u8>, NetError> {
    let payload =
        postcard::to_allocvec(message).map_err(|e| NetError::Serialization(e.to_string()))?;
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(NetError::Serialization(format!(
            "message too large: {} bytes (max {MAX_MESSAGE_SIZE})",
            payload.len()
        )));
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode a frame produced by [`encode_frame`].
pub fn decode_frame(frame: &[u8]) -> Result<QuayMessage, NetError> {
    let Some((len_bytes, payload)) = frame.split_first_chunk::<4>() else {
        return Err(NetError::Serialization("frame shorter than prefix".into()));
    };
    let len = u32::from_be_bytes(*len_bytes) as usize;
    if len != payload.len() {
        return Err(NetError::Serialization(format!(
            "length prefix {len} does not match payload {}",
            payload.len()
        )));
    }
    postcard::from_bytes(payload).map_err(|e| NetError::Serialization(e.to_string()))
}

#[async_trait::async_trait]
impl crate::Pinger for QuayTransport {
    async fn ping(&self, peer: PeerId) -> Result<Duration, NetError> {
        self.ping(peer).await
    }
}
