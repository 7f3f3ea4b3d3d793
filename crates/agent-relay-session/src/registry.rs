//! Session registry: lifecycle ownership and run serialization.

use std::{collections::HashMap, sync::Arc};

use agent_relay_core::{
    ChatMessage, EventLog, ExecutorBridge, Session, SessionFilter, SessionId, SessionStatus,
    StoreError, event::chat_messages,
};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::relay::{Attachment, RelayConfig, RunGate, SessionRelay};

/// Session registry error.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error("Session already running")]
    AlreadyRunning,
    #[error("Session already finished")]
    Finished,
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Owns session lifecycle and shards one relay per session id.
///
/// The relay map is the only cross-session shared state; everything else is
/// per-session and accessed through the session's own relay.
pub struct SessionRegistry<S, B> {
    store: Arc<S>,
    bridge: Arc<B>,
    config: RelayConfig,
    relays: RwLock<HashMap<SessionId, Arc<SessionRelay<S>>>>,
}

impl<S, B> SessionRegistry<S, B>
where
    S: EventLog + 'static,
    B: ExecutorBridge + 'static,
{
    /// Create a registry with default relay tunables.
    #[must_use]
    pub fn new(store: S, bridge: B) -> Self {
        Self::with_config(store, bridge, RelayConfig::default())
    }

    /// Create a registry with explicit relay tunables.
    #[must_use]
    pub fn with_config(store: S, bridge: B, config: RelayConfig) -> Self {
        Self {
            store: Arc::new(store),
            bridge: Arc::new(bridge),
            config,
            relays: RwLock::new(HashMap::new()),
        }
    }

    /// Allocate a fresh idle session.
    ///
    /// # Errors
    /// Returns error only if the store rejects the write.
    pub async fn create_session(
        &self,
        metadata: HashMap<String, Value>,
    ) -> Result<SessionId, RegistryError> {
        let session = Session::new(metadata);
        self.store.create_session(&session).await?;
        tracing::info!(session_id = %session.id, "session created");
        Ok(session.id)
    }

    /// Get a session snapshot.
    ///
    /// # Errors
    /// Returns `NotFound` for unknown ids.
    pub async fn get_session(&self, id: SessionId) -> Result<Session, RegistryError> {
        self.store
            .get_session(id)
            .await?
            .ok_or(RegistryError::NotFound(id))
    }

    /// List sessions, most recently updated first.
    ///
    /// # Errors
    /// Returns error if the store read fails.
    pub async fn list_sessions(&self, filter: SessionFilter) -> Result<Vec<Session>, RegistryError> {
        Ok(self.store.list(filter).await?)
    }

    /// Replace a session's metadata map. Allowed in any state.
    ///
    /// # Errors
    /// Returns `NotFound` for unknown ids.
    pub async fn set_metadata(
        &self,
        id: SessionId,
        metadata: HashMap<String, Value>,
    ) -> Result<(), RegistryError> {
        match self.store.update_metadata(id, metadata).await {
            Ok(()) => Ok(()),
            Err(StoreError::NotFound(id)) => Err(RegistryError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Reconstruct the chat turns from a session's event log.
    ///
    /// # Errors
    /// Returns `NotFound` for unknown ids.
    pub async fn chat_history(&self, id: SessionId) -> Result<Vec<ChatMessage>, RegistryError> {
        match self.store.read_from(id, 0).await {
            Ok(events) => Ok(chat_messages(&events)),
            Err(StoreError::NotFound(id)) => Err(RegistryError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Submit a prompt to a session.
    ///
    /// Transitions the session to `Running`, registers its relay as the
    /// active producer, starts the executor bridge, and returns immediately.
    /// At most one run is ever in flight per session.
    ///
    /// # Errors
    /// `AlreadyRunning` while a run is in flight, `Finished` after the
    /// terminal event, `NotFound` for unknown ids.
    pub async fn submit(&self, id: SessionId, prompt: &str) -> Result<(), RegistryError> {
        let relay = self.relay(id).await?;

        match relay.begin_run().await {
            RunGate::Started => {}
            RunGate::AlreadyRunning => return Err(RegistryError::AlreadyRunning),
            RunGate::Finished => return Err(RegistryError::Finished),
        }

        if let Err(e) = self
            .store
            .update_status(id, SessionStatus::Running, None)
            .await
        {
            relay.abort_run().await;
            return Err(e.into());
        }

        // The relay is already registered and marked running, so a client
        // attaching between here and the first produced event always finds a
        // pending run and lands in the broadcast set.
        let bridge = Arc::clone(&self.bridge);
        let prompt = prompt.to_string();
        tokio::spawn(async move {
            match bridge.run(relay.session_id(), &prompt).await {
                Ok(stream) => relay.drive(stream).await,
                Err(e) => relay.fail(e.to_string()).await,
            }
        });

        tracing::info!(session_id = %id, "run submitted");
        Ok(())
    }

    /// Catch-up replay past `after_seq`, then a live subscription.
    ///
    /// # Errors
    /// Returns `NotFound` for unknown ids, or the store's read error.
    pub async fn attach(&self, id: SessionId, after_seq: u64) -> Result<Attachment, RegistryError> {
        let relay = self.relay(id).await?;
        Ok(relay.attach(after_seq).await?)
    }

    /// Drop a live subscription from a session's broadcast set.
    pub async fn detach(&self, id: SessionId, subscriber_id: uuid::Uuid) {
        if let Some(relay) = self.relays.read().await.get(&id) {
            relay.detach(subscriber_id).await;
        }
    }

    /// Get or lazily load the relay for a session.
    async fn relay(&self, id: SessionId) -> Result<Arc<SessionRelay<S>>, RegistryError> {
        if let Some(relay) = self.relays.read().await.get(&id) {
            return Ok(Arc::clone(relay));
        }

        let session = self.get_session(id).await?;

        let mut relays = self.relays.write().await;
        if let Some(relay) = relays.get(&id) {
            return Ok(Arc::clone(relay));
        }

        let relay = Arc::new(
            SessionRelay::load(id, Arc::clone(&self.store), self.config.clone(), session.status)
                .await?,
        );
        relays.insert(id, Arc::clone(&relay));
        drop(relays);

        if session.status == SessionStatus::Running {
            // A running session with no live producer can only come from a
            // previous process; record the lost run as a terminal error so
            // attachers are not left staring at a hang.
            relay
                .fail("run interrupted before completion".to_string())
                .await;
        }

        Ok(relay)
    }
}
