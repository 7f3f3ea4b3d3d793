//! Live connection tracking and heartbeat liveness.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use agent_relay_core::SessionId;
use tokio::time::Instant;
use uuid::Uuid;

/// Heartbeat timing. Tunables, not invariants.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    /// How often the server sends a liveness probe.
    pub interval: Duration,
    /// Silence window after which a connection is considered dead.
    /// Must cover at least one missed probe interval.
    pub grace: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            grace: Duration::from_secs(35),
        }
    }
}

/// One live duplex channel attached to a session.
///
/// Ephemeral: holds the last delivered sequence and a liveness timestamp,
/// never persisted.
pub struct ConnectionHandle {
    id: Uuid,
    session_id: SessionId,
    last_seen: Mutex<Instant>,
    last_delivered: AtomicU64,
}

impl ConnectionHandle {
    fn new(session_id: SessionId) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            last_seen: Mutex::new(Instant::now()),
            last_delivered: AtomicU64::new(0),
        }
    }

    /// Connection identifier.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// The session this connection observes.
    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Record client liveness (heartbeat ack or any client message).
    pub fn touch(&self) {
        *self.last_seen.lock().unwrap() = Instant::now();
    }

    /// Whether the client has been silent past the grace window.
    #[must_use]
    pub fn is_expired(&self, grace: Duration) -> bool {
        self.last_seen.lock().unwrap().elapsed() > grace
    }

    /// Record the highest sequence delivered on this channel.
    pub fn record_delivered(&self, seq: u64) {
        self.last_delivered.fetch_max(seq, Ordering::Relaxed);
    }

    /// Highest sequence delivered on this channel.
    #[must_use]
    pub fn last_delivered(&self) -> u64 {
        self.last_delivered.load(Ordering::Relaxed)
    }
}

/// Tracks live connections across all sessions.
///
/// The heartbeat loop in the WebSocket handler consults `is_expired`; the
/// manager itself only owns registration so abandoned entries cannot leak
/// past their handler's lifetime.
pub struct ConnectionManager {
    connections: RwLock<HashMap<Uuid, Arc<ConnectionHandle>>>,
}

impl ConnectionManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new live connection for a session.
    #[must_use]
    pub fn register(&self, session_id: SessionId) -> Arc<ConnectionHandle> {
        let handle = Arc::new(ConnectionHandle::new(session_id));
        self.connections
            .write()
            .unwrap()
            .insert(handle.id, Arc::clone(&handle));
        handle
    }

    /// Remove a connection; returns the handle if it was present.
    pub fn remove(&self, id: Uuid) -> Option<Arc<ConnectionHandle>> {
        self.connections.write().unwrap().remove(&id)
    }

    /// Number of live connections across all sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.read().unwrap().len()
    }

    /// Whether any connection is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live connections observing one session.
    #[must_use]
    pub fn session_count(&self, session_id: SessionId) -> usize {
        self.connections
            .read()
            .unwrap()
            .values()
            .filter(|c| c.session_id == session_id)
            .count()
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}
