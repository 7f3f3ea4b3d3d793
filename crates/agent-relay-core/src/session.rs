//! Session state and lifecycle.

use std::{
    collections::HashMap,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::traits::SessionId;

/// Session status.
///
/// Lifecycle: `Idle` on creation, `Running` once a prompt is accepted, then
/// exactly one of `Complete` or `Error` set by the run's terminal event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Running,
    Complete,
    Error,
}

impl SessionStatus {
    /// Whether the session has reached a terminal state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

/// A single task-execution context with its own event timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub status: SessionStatus,
    /// Creation timestamp (Unix epoch seconds).
    pub created_at: i64,
    /// Last update timestamp.
    pub updated_at: i64,
    /// Arbitrary metadata for app-specific needs.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// Terminal error description, if the run failed.
    #[serde(default)]
    pub error: Option<String>,
}

impl Session {
    /// Create a fresh idle session.
    #[must_use]
    pub fn new(metadata: HashMap<String, Value>) -> Self {
        let timestamp = unix_now();
        Self {
            id: uuid::Uuid::new_v4(),
            status: SessionStatus::Idle,
            created_at: timestamp,
            updated_at: timestamp,
            metadata,
            error: None,
        }
    }
}

/// Session filter for list queries.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionFilter {
    /// Filter by status.
    pub status: Option<SessionStatus>,
    /// Limit results.
    pub limit: Option<usize>,
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_is_idle() {
        let session = Session::new(HashMap::new());
        assert_eq!(session.status, SessionStatus::Idle);
        assert!(session.error.is_none());
        assert_eq!(session.created_at, session.updated_at);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(SessionStatus::Complete.is_terminal());
        assert!(SessionStatus::Error.is_terminal());
        assert!(!SessionStatus::Idle.is_terminal());
        assert!(!SessionStatus::Running.is_terminal());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&SessionStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
    }
}
