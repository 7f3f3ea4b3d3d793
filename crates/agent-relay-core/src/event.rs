//! Typed progress events produced during a session run.

use serde::{Deserialize, Serialize};

use crate::traits::SessionId;

/// Author of a chat turn carried by a `Message` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One unit of progress information produced during a run.
///
/// `Complete` and `Error` are terminal: exactly one of them ends a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    /// Coarse status update ("planning", "executing", ...).
    Status { message: String },
    /// A reasoning step, optionally naming the tool being invoked.
    Thinking { step: String, tool: Option<String> },
    /// A chat turn, used to reconstruct conversation history.
    Message { role: Role, content: String },
    /// Successful terminal event carrying the run result.
    Complete { result: String },
    /// Failed terminal event carrying the failure description.
    Error { message: String },
}

impl EventKind {
    /// Whether this event ends the run.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }
}

/// A sequenced event belonging to exactly one session.
///
/// The sequence number is assigned by the relay atomically with the durable
/// append; it is strictly increasing per session and never produced by the
/// executor or the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub session_id: SessionId,
    pub seq: u64,
    #[serde(flatten)]
    pub kind: EventKind,
    /// Unix epoch seconds.
    pub timestamp: i64,
}

impl Event {
    /// Create an event stamped with the current time.
    #[must_use]
    pub fn new(session_id: SessionId, seq: u64, kind: EventKind) -> Self {
        Self {
            session_id,
            seq,
            kind,
            timestamp: crate::session::unix_now(),
        }
    }

    /// Whether this event ends the run.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

/// A user/assistant turn reconstructed from the event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub seq: u64,
    pub role: Role,
    pub content: String,
    pub timestamp: i64,
}

/// Extract the chat turns from an ordered event slice.
#[must_use]
pub fn chat_messages(events: &[Event]) -> Vec<ChatMessage> {
    events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::Message { role, content } => Some(ChatMessage {
                seq: e.seq,
                role: *role,
                content: content.clone(),
                timestamp: e.timestamp,
            }),
            _ => None,
        })
        .collect()
}
