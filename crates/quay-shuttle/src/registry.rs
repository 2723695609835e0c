//! Registry of connected shuttles.
//!
//! A shuttle is live while its outbound command channel is open and its
//! last message is younger than `liveness_timeout`. A handle can only be
//! registered once while live; a stale registration is replaced.

use std::collections::HashMap;
use std::sync::Mutex;

use quay_types::{
    PeerId, ShuttleCommand, ShuttleConfig, ShuttleHandle, ShuttleHello, ShuttleStatus,
};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::ShuttleError;

/// Snapshot of a registered shuttle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShuttleInfo {
    /// Registered handle.
    pub handle: ShuttleHandle,
    /// Hostname the shuttle serves content from.
    pub hostname: String,
    /// Whether the shuttle only takes work for its own users.
    pub private: bool,
    /// Network identity, if the shuttle connected over the network.
    pub peer_id: Option<PeerId>,
    /// When the shuttle connected.
    pub connected_at: Instant,
    /// When the shuttle was last heard from.
    pub last_seen: Instant,
    /// Latest reported status.
    pub status: ShuttleStatus,
}

struct ShuttleConnection {
    hello: ShuttleHello,
    peer_id: Option<PeerId>,
    outbound: mpsc::Sender<ShuttleCommand>,
    connected_at: Instant,
    last_seen: Instant,
    status: ShuttleStatus,
}

impl ShuttleConnection {
    fn is_live(&self, now: Instant, config: &ShuttleConfig) -> bool {
        !self.outbound.is_closed()
            && now.saturating_duration_since(self.last_seen) < config.liveness_timeout
    }

    fn info(&self) -> ShuttleInfo {
        ShuttleInfo {
            handle: self.hello.handle.clone(),
            hostname: self.hello.hostname.clone(),
            private: self.hello.private,
            peer_id: self.peer_id,
            connected_at: self.connected_at,
            last_seen: self.last_seen,
            status: self.status.clone(),
        }
    }
}

/// Connected shuttles keyed by handle.
pub struct ShuttleRegistry {
    config: ShuttleConfig,
    shuttles: Mutex<HashMap<ShuttleHandle, ShuttleConnection>>,
}

impl ShuttleRegistry {
    /// Create an empty registry.
    pub fn new(config: ShuttleConfig) -> Self {
        Self {
            config,
            shuttles: Mutex::new(HashMap::new()),
        }
    }

    /// Return the shuttle configuration.
    pub fn config(&self) -> &ShuttleConfig {
        &self.config
    }

    /// Register a shuttle.
    ///
    /// Fails with [`ShuttleError::DuplicateShuttle`] if a live shuttle holds
    /// the handle. A stale registration under the same handle is replaced.
    pub fn connect(
        &self,
        hello: ShuttleHello,
        peer_id: Option<PeerId>,
        outbound: mpsc::Sender<ShuttleCommand>,
    ) -> Result<(), ShuttleError> {
        let now = Instant::now();
        let mut shuttles = self.shuttles.lock().expect("shuttle lock poisoned");

        if let Some(existing) = shuttles.get(&hello.handle) {
            if existing.is_live(now, &self.config) {
                warn!(handle = %hello.handle, "rejecting duplicate shuttle connection");
                return Err(ShuttleError::DuplicateShuttle(hello.handle));
            }
            info!(handle = %hello.handle, "replacing stale shuttle registration");
        }

        info!(
            handle = %hello.handle,
            hostname = %hello.hostname,
            private = hello.private,
            "shuttle connected"
        );
        shuttles.insert(
            hello.handle.clone(),
            ShuttleConnection {
                hello,
                peer_id,
                outbound,
                connected_at: now,
                last_seen: now,
                status: ShuttleStatus::default(),
            },
        );
        Ok(())
    }

    /// Remove a shuttle. Returns `false` if it was not registered.
    ///
    /// Work addressed to the shuttle is not reassigned here.
    pub fn disconnect(&self, handle: &ShuttleHandle) -> bool {
        let removed = self
            .shuttles
            .lock()
            .expect("shuttle lock poisoned")
            .remove(handle)
            .is_some();
        if removed {
            info!(%handle, "shuttle disconnected");
        }
        removed
    }

    /// Remove a shuttle only if it is still registered with `outbound`.
    ///
    /// Lets a closing connection clean up after itself without removing a
    /// newer connection that took over the handle.
    pub fn disconnect_channel(
        &self,
        handle: &ShuttleHandle,
        outbound: &mpsc::Sender<ShuttleCommand>,
    ) -> bool {
        let mut shuttles = self.shuttles.lock().expect("shuttle lock poisoned");
        let matches = shuttles
            .get(handle)
            .is_some_and(|c| c.outbound.same_channel(outbound));
        if matches {
            shuttles.remove(handle);
            info!(%handle, "shuttle disconnected");
        }
        matches
    }

    /// Record a status report and refresh liveness.
    pub fn heartbeat(
        &self,
        handle: &ShuttleHandle,
        status: ShuttleStatus,
    ) -> Result<(), ShuttleError> {
        let mut shuttles = self.shuttles.lock().expect("shuttle lock poisoned");
        let conn = shuttles
            .get_mut(handle)
            .ok_or_else(|| ShuttleError::ShuttleNotFound(handle.clone()))?;

        if status.space_low && !conn.status.space_low {
            warn!(%handle, free = status.blockstore_free, "shuttle reports low disk space");
        }
        conn.status = status;
        conn.last_seen = Instant::now();
        Ok(())
    }

    /// Refresh liveness without changing the status.
    pub fn touch(&self, handle: &ShuttleHandle) -> bool {
        let mut shuttles = self.shuttles.lock().expect("shuttle lock poisoned");
        match shuttles.get_mut(handle) {
            Some(conn) => {
                conn.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Queue a command for a shuttle without blocking.
    pub fn send(&self, handle: &ShuttleHandle, command: ShuttleCommand) -> Result<(), ShuttleError> {
        let shuttles = self.shuttles.lock().expect("shuttle lock poisoned");
        let conn = shuttles
            .get(handle)
            .ok_or_else(|| ShuttleError::ShuttleNotFound(handle.clone()))?;

        match conn.outbound.try_send(command) {
            Ok(()) => {
                debug!(%handle, "command queued for shuttle");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(ShuttleError::Backpressure(handle.clone()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(ShuttleError::ShuttleDisconnected(handle.clone()))
            }
        }
    }

    /// Whether a live shuttle is registered under `handle`.
    pub fn is_live(&self, handle: &ShuttleHandle) -> bool {
        let now = Instant::now();
        self.shuttles
            .lock()
            .expect("shuttle lock poisoned")
            .get(handle)
            .is_some_and(|c| c.is_live(now, &self.config))
    }

    /// Snapshots of every live shuttle, ordered by handle.
    pub fn live_shuttles(&self) -> Vec<ShuttleInfo> {
        let now = Instant::now();
        let shuttles = self.shuttles.lock().expect("shuttle lock poisoned");
        let mut live: Vec<ShuttleInfo> = shuttles
            .values()
            .filter(|c| c.is_live(now, &self.config))
            .map(ShuttleConnection::info)
            .collect();
        live.sort_by(|a, b| a.handle.cmp(&b.handle));
        live
    }

    /// Snapshot of a registered shuttle, live or not.
    pub fn get(&self, handle: &ShuttleHandle) -> Option<ShuttleInfo> {
        self.shuttles
            .lock()
            .expect("shuttle lock poisoned")
            .get(handle)
            .map(ShuttleConnection::info)
    }

    /// Number of registered shuttles, live or not.
    pub fn len(&self) -> usize {
        self.shuttles.lock().expect("shuttle lock poisoned").len()
    }

    /// Whether no shuttle is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ShuttleRegistry {
    fn default() -> Self {
        Self::new(ShuttleConfig::default())
    }
}

impl std::fmt::Debug for ShuttleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShuttleRegistry")
            .field("config", &self.config)
            .field("shuttles", &self.len())
            .finish()
    }
}
