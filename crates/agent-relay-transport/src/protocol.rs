//! Wire protocol for client-server communication.

use agent_relay_core::{Event, EventKind, Role, Session};
use serde::{Deserialize, Serialize};

/// Message from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Submit a prompt on the attached session.
    Submit { prompt: String },
    /// Answer to a server heartbeat probe.
    HeartbeatAck,
    /// Client-initiated keepalive.
    Ping,
}

/// Message from server to client.
///
/// Every delivered event carries its sequence number so the client can keep
/// a catch-up cursor across reconnects.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Session snapshot, sent once on attach.
    Session { session: Session },
    /// Coarse status update.
    Status { seq: u64, message: String },
    /// Reasoning step, optionally naming a tool.
    Thinking {
        seq: u64,
        step: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool: Option<String>,
    },
    /// Chat turn.
    Message { seq: u64, role: Role, content: String },
    /// Successful terminal event.
    Complete { seq: u64, result: String },
    /// Error event; protocol-level errors carry no sequence number.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
        message: String,
    },
    /// Liveness probe; the client answers with `heartbeat_ack`.
    HeartbeatProbe,
    /// Answer to a client `ping`.
    Pong,
    /// Prompt accepted, run started.
    Submitted,
    /// Prompt rejected (already running, finished, unknown session).
    Rejected { reason: String },
}

impl ServerMessage {
    /// Wrap a relayed event for the wire.
    #[must_use]
    pub fn from_event(event: Event) -> Self {
        let seq = event.seq;
        match event.kind {
            EventKind::Status { message } => Self::Status { seq, message },
            EventKind::Thinking { step, tool } => Self::Thinking { seq, step, tool },
            EventKind::Message { role, content } => Self::Message { seq, role, content },
            EventKind::Complete { result } => Self::Complete { seq, result },
            EventKind::Error { message } => Self::Error {
                seq: Some(seq),
                message,
            },
        }
    }
}
