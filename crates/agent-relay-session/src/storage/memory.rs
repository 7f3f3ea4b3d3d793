//! In-memory event log.

use std::{
    collections::HashMap,
    sync::RwLock,
    time::{SystemTime, UNIX_EPOCH},
};

use agent_relay_core::{
    Event, EventLog, Session, SessionFilter, SessionId, SessionStatus, StoreError,
};
use async_trait::async_trait;
use serde_json::Value;

struct Record {
    session: Session,
    events: Vec<Event>,
}

/// In-memory event log implementation.
///
/// Useful for development, tests, and single-process deployments.
/// Data is lost on restart.
pub struct MemoryEventLog {
    inner: RwLock<HashMap<SessionId, Record>>,
}

impl MemoryEventLog {
    /// Create a new in-memory event log.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        if inner.contains_key(&session.id) {
            return Err(StoreError::Internal(format!(
                "session {} already exists",
                session.id
            )));
        }

        inner.insert(
            session.id,
            Record {
                session: session.clone(),
                events: Vec::new(),
            },
        );
        Ok(())
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<Session>, StoreError> {
        Ok(self
            .inner
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .get(&id)
            .map(|r| r.session.clone()))
    }

    async fn update_status(
        &self,
        id: SessionId,
        status: SessionStatus,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        let record = inner.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        record.session.status = status;
        record.session.error = error;
        record.session.updated_at = now();
        Ok(())
    }

    async fn update_metadata(
        &self,
        id: SessionId,
        metadata: HashMap<String, Value>,
    ) -> Result<(), StoreError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        let record = inner.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        record.session.metadata = metadata;
        record.session.updated_at = now();
        Ok(())
    }

    async fn list(&self, filter: SessionFilter) -> Result<Vec<Session>, StoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        let mut result: Vec<Session> = inner
            .values()
            .map(|r| &r.session)
            .filter(|s| filter.status.is_none_or(|status| s.status == status))
            .cloned()
            .collect();

        // Most recently updated first.
        result.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }

        Ok(result)
    }

    async fn append(&self, event: &Event) -> Result<(), StoreError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        let record = inner
            .get_mut(&event.session_id)
            .ok_or(StoreError::NotFound(event.session_id))?;

        let expected = record.events.last().map_or(1, |e| e.seq + 1);
        if event.seq != expected {
            return Err(StoreError::Internal(format!(
                "out-of-order append for session {}: got seq {}, expected {expected}",
                event.session_id, event.seq
            )));
        }

        record.events.push(event.clone());
        record.session.updated_at = now();
        Ok(())
    }

    async fn read_from(
        &self,
        session_id: SessionId,
        after_seq: u64,
    ) -> Result<Vec<Event>, StoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        let record = inner
            .get(&session_id)
            .ok_or(StoreError::NotFound(session_id))?;

        Ok(record
            .events
            .iter()
            .filter(|e| e.seq > after_seq)
            .cloned()
            .collect())
    }

    async fn last_seq(&self, session_id: SessionId) -> Result<u64, StoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        let record = inner
            .get(&session_id)
            .ok_or(StoreError::NotFound(session_id))?;

        Ok(record.events.last().map_or(0, |e| e.seq))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_relay_core::EventKind;

    fn event(session_id: SessionId, seq: u64) -> Event {
        Event::new(
            session_id,
            seq,
            EventKind::Status {
                message: format!("step {seq}"),
            },
        )
    }

    #[tokio::test]
    async fn test_create_and_get_session() {
        let store = MemoryEventLog::new();
        let session = Session::new(HashMap::new());
        store.create_session(&session).await.unwrap();

        let loaded = store.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, session.id);
        assert_eq!(loaded.status, SessionStatus::Idle);

        assert!(store.create_session(&session).await.is_err());
    }

    #[tokio::test]
    async fn test_append_and_read_from() {
        let store = MemoryEventLog::new();
        let session = Session::new(HashMap::new());
        store.create_session(&session).await.unwrap();

        for seq in 1..=5 {
            store.append(&event(session.id, seq)).await.unwrap();
        }

        let all = store.read_from(session.id, 0).await.unwrap();
        assert_eq!(all.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);

        let tail = store.read_from(session.id, 3).await.unwrap();
        assert_eq!(tail.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![4, 5]);

        assert_eq!(store.last_seq(session.id).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_out_of_order_append_rejected() {
        let store = MemoryEventLog::new();
        let session = Session::new(HashMap::new());
        store.create_session(&session).await.unwrap();

        store.append(&event(session.id, 1)).await.unwrap();
        assert!(store.append(&event(session.id, 3)).await.is_err());
        assert!(store.append(&event(session.id, 1)).await.is_err());
        assert_eq!(store.last_seq(session.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_update_status_and_error() {
        let store = MemoryEventLog::new();
        let session = Session::new(HashMap::new());
        store.create_session(&session).await.unwrap();

        store
            .update_status(session.id, SessionStatus::Error, Some("boom".into()))
            .await
            .unwrap();

        let loaded = store.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Error);
        assert_eq!(loaded.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_list_filters_by_status_and_limit() {
        let store = MemoryEventLog::new();
        for _ in 0..3 {
            store
                .create_session(&Session::new(HashMap::new()))
                .await
                .unwrap();
        }
        let running = Session::new(HashMap::new());
        store.create_session(&running).await.unwrap();
        store
            .update_status(running.id, SessionStatus::Running, None)
            .await
            .unwrap();

        let all = store.list(SessionFilter::default()).await.unwrap();
        assert_eq!(all.len(), 4);

        let only_running = store
            .list(SessionFilter {
                status: Some(SessionStatus::Running),
                limit: None,
            })
            .await
            .unwrap();
        assert_eq!(only_running.len(), 1);
        assert_eq!(only_running[0].id, running.id);

        let limited = store
            .list(SessionFilter {
                status: None,
                limit: Some(2),
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let store = MemoryEventLog::new();
        let id = uuid::Uuid::new_v4();

        assert!(store.get_session(id).await.unwrap().is_none());
        assert!(matches!(
            store.read_from(id, 0).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.append(&event(id, 1)).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
