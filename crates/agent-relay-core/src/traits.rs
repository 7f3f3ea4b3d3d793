//! Collaborator traits: durable event storage and the executor bridge.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    event::{Event, EventKind},
    session::{Session, SessionFilter, SessionStatus},
};

/// Session identifier.
pub type SessionId = Uuid;

/// Event log store error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Store error: {0}")]
    Internal(String),
}

/// Trait for durable, ordered, append-only event storage.
///
/// Implementations must provide sequential consistency within one session and
/// support concurrent appends across distinct sessions. The relay owns
/// sequence assignment; `append` must reject out-of-order sequence numbers.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Persist a freshly created session.
    async fn create_session(&self, session: &Session) -> Result<(), StoreError>;

    /// Get a session by ID.
    async fn get_session(&self, id: SessionId) -> Result<Option<Session>, StoreError>;

    /// Update session status and terminal error description.
    async fn update_status(
        &self,
        id: SessionId,
        status: SessionStatus,
        error: Option<String>,
    ) -> Result<(), StoreError>;

    /// Replace session metadata.
    async fn update_metadata(
        &self,
        id: SessionId,
        metadata: HashMap<String, Value>,
    ) -> Result<(), StoreError>;

    /// List sessions with optional filter, newest first.
    async fn list(&self, filter: SessionFilter) -> Result<Vec<Session>, StoreError>;

    /// Append an event to its session's log.
    async fn append(&self, event: &Event) -> Result<(), StoreError>;

    /// Read all persisted events with sequence > `after_seq`, in order.
    async fn read_from(
        &self,
        session_id: SessionId,
        after_seq: u64,
    ) -> Result<Vec<Event>, StoreError>;

    /// Highest persisted sequence number for a session (0 if none).
    async fn last_seq(&self, session_id: SessionId) -> Result<u64, StoreError>;
}

/// Executor bridge error.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Executor failed to start: {0}")]
    StartFailed(String),
    #[error("Executor failed: {0}")]
    Failed(String),
}

/// Lazy, ordered sequence of progress events produced by one run.
///
/// The stream must end with exactly one terminal item (`Complete` or `Error`)
/// or yield an `Err`; either way the relay guarantees a terminal event is
/// recorded.
pub type EventStream = BoxStream<'static, Result<EventKind, BridgeError>>;

/// Trait for the external executor that plans and invokes tools.
///
/// The relay treats the returned stream as an opaque, inherently ordered
/// producer; it is consumed by a single task per session.
#[async_trait]
pub trait ExecutorBridge: Send + Sync {
    /// Start an asynchronous run for a session.
    async fn run(&self, session_id: SessionId, prompt: &str) -> Result<EventStream, BridgeError>;
}
