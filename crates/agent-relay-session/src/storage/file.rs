//! File-backed event log.
//!
//! One directory holds all sessions: `<id>.json` with session metadata and
//! `<id>.events.jsonl` with one event per line. The full state is loaded on
//! open and kept in memory; writes go through to disk before returning.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use agent_relay_core::{
    Event, EventLog, Session, SessionFilter, SessionId, SessionStatus, StoreError,
};
use async_trait::async_trait;
use serde_json::Value;
use tokio::{fs, io::AsyncWriteExt, sync::RwLock};
use uuid::Uuid;

struct Record {
    session: Session,
    events: Vec<Event>,
}

/// File-backed event log implementation.
pub struct FileEventLog {
    root: PathBuf,
    inner: RwLock<HashMap<SessionId, Record>>,
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn io_err(e: std::io::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

impl FileEventLog {
    /// Open (or initialize) an event log rooted at `root`.
    ///
    /// Existing session files are loaded; files that fail to parse are
    /// skipped with a warning rather than poisoning the whole store.
    ///
    /// # Errors
    /// Returns error if the directory cannot be created or read.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await.map_err(io_err)?;

        let mut sessions = HashMap::new();
        let mut entries = fs::read_dir(&root).await.map_err(io_err)?;
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(".json") {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            else {
                continue;
            };

            match Self::load_record(&root, id).await {
                Ok(record) => {
                    sessions.insert(id, record);
                }
                Err(e) => {
                    tracing::warn!(session_id = %id, "skipping unreadable session file: {e}");
                }
            }
        }

        tracing::info!(root = %root.display(), count = sessions.len(), "event log loaded");

        Ok(Self {
            root,
            inner: RwLock::new(sessions),
        })
    }

    async fn load_record(root: &Path, id: SessionId) -> Result<Record, StoreError> {
        let meta = fs::read(root.join(format!("{id}.json")))
            .await
            .map_err(io_err)?;
        let session: Session =
            serde_json::from_slice(&meta).map_err(|e| StoreError::Internal(e.to_string()))?;

        let events_path = root.join(format!("{id}.events.jsonl"));
        let mut events = Vec::new();
        if fs::try_exists(&events_path).await.map_err(io_err)? {
            let raw = fs::read_to_string(&events_path).await.map_err(io_err)?;
            let lines: Vec<&str> = raw.lines().filter(|l| !l.trim().is_empty()).collect();
            for (i, line) in lines.iter().enumerate() {
                match serde_json::from_str::<Event>(line) {
                    Ok(event) => events.push(event),
                    // A crash mid-append can leave a torn final line. Keep
                    // the intact prefix and rewrite the file so the next
                    // append starts on a clean boundary.
                    Err(e) if i + 1 == lines.len() => {
                        tracing::warn!(
                            session_id = %id,
                            "dropping torn trailing event line: {e}"
                        );
                        let mut buf = Vec::new();
                        for event in &events {
                            let json = serde_json::to_vec(event)
                                .map_err(|e| StoreError::Internal(e.to_string()))?;
                            buf.extend(json);
                            buf.push(b'\n');
                        }
                        fs::write(&events_path, buf).await.map_err(io_err)?;
                    }
                    Err(e) => return Err(StoreError::Internal(e.to_string())),
                }
            }
        }

        Ok(Record { session, events })
    }

    fn meta_path(&self, id: SessionId) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    fn events_path(&self, id: SessionId) -> PathBuf {
        self.root.join(format!("{id}.events.jsonl"))
    }

    async fn write_meta(&self, session: &Session) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(session)
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        fs::write(self.meta_path(session.id), json)
            .await
            .map_err(io_err)
    }
}

#[async_trait]
impl EventLog for FileEventLog {
    async fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.contains_key(&session.id) {
            return Err(StoreError::Internal(format!(
                "session {} already exists",
                session.id
            )));
        }

        self.write_meta(session).await?;
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
        Ok(self.inner.read().await.get(&id).map(|r| r.session.clone()))
    }

    async fn update_status(
        &self,
        id: SessionId,
        status: SessionStatus,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let record = inner.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        record.session.status = status;
        record.session.error = error;
        record.session.updated_at = now();

        let session = record.session.clone();
        drop(inner);
        self.write_meta(&session).await
    }

    async fn update_metadata(
        &self,
        id: SessionId,
        metadata: HashMap<String, Value>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let record = inner.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        record.session.metadata = metadata;
        record.session.updated_at = now();

        let session = record.session.clone();
        drop(inner);
        self.write_meta(&session).await
    }

    async fn list(&self, filter: SessionFilter) -> Result<Vec<Session>, StoreError> {
        let inner = self.inner.read().await;

        let mut result: Vec<Session> = inner
            .values()
            .map(|r| &r.session)
            .filter(|s| filter.status.is_none_or(|status| s.status == status))
            .cloned()
            .collect();

        result.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }

        Ok(result)
    }

    async fn append(&self, event: &Event) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
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

        let mut line =
            serde_json::to_vec(event).map_err(|e| StoreError::Internal(e.to_string()))?;
        line.push(b'\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.events_path(event.session_id))
            .await
            .map_err(io_err)?;
        file.write_all(&line).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;

        record.events.push(event.clone());
        record.session.updated_at = now();
        Ok(())
    }

    async fn read_from(
        &self,
        session_id: SessionId,
        after_seq: u64,
    ) -> Result<Vec<Event>, StoreError> {
        let inner = self.inner.read().await;
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
        let inner = self.inner.read().await;
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
            EventKind::Thinking {
                step: format!("step {seq}"),
                tool: None,
            },
        )
    }

    #[tokio::test]
    async fn test_roundtrip_across_reopen() {
        let dir = tempfile::tempdir().unwrap();

        let session = Session::new(HashMap::new());
        {
            let store = FileEventLog::open(dir.path()).await.unwrap();
            store.create_session(&session).await.unwrap();
            store.append(&event(session.id, 1)).await.unwrap();
            store.append(&event(session.id, 2)).await.unwrap();
            store
                .update_status(session.id, SessionStatus::Complete, None)
                .await
                .unwrap();
        }

        let store = FileEventLog::open(dir.path()).await.unwrap();
        let loaded = store.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Complete);

        let events = store.read_from(session.id, 0).await.unwrap();
        assert_eq!(events.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(store.last_seq(session.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_out_of_order_append_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileEventLog::open(dir.path()).await.unwrap();

        let session = Session::new(HashMap::new());
        store.create_session(&session).await.unwrap();
        store.append(&event(session.id, 1)).await.unwrap();
        assert!(store.append(&event(session.id, 5)).await.is_err());
    }

    #[tokio::test]
    async fn test_torn_trailing_event_line_keeps_durable_prefix() {
        let dir = tempfile::tempdir().unwrap();

        let session = Session::new(HashMap::new());
        {
            let store = FileEventLog::open(dir.path()).await.unwrap();
            store.create_session(&session).await.unwrap();
            store.append(&event(session.id, 1)).await.unwrap();
            store.append(&event(session.id, 2)).await.unwrap();
        }

        // A crash mid-append leaves a partial line without a newline.
        let events_path = dir.path().join(format!("{}.events.jsonl", session.id));
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&events_path)
            .unwrap();
        std::io::Write::write_all(&mut file, br#"{"session_id":"trunc"#).unwrap();
        drop(file);

        let store = FileEventLog::open(dir.path()).await.unwrap();
        let events = store.read_from(session.id, 0).await.unwrap();
        assert_eq!(events.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(store.last_seq(session.id).await.unwrap(), 2);

        // Appends continue on a clean boundary and survive another reopen.
        store.append(&event(session.id, 3)).await.unwrap();
        drop(store);

        let store = FileEventLog::open(dir.path()).await.unwrap();
        let events = store.read_from(session.id, 0).await.unwrap();
        assert_eq!(
            events.iter().map(|e| e.seq).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[tokio::test]
    async fn test_unparseable_session_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileEventLog::open(dir.path()).await.unwrap();
            store
                .create_session(&Session::new(HashMap::new()))
                .await
                .unwrap();
        }
        let bogus = dir.path().join(format!("{}.json", Uuid::new_v4()));
        std::fs::write(&bogus, b"not json").unwrap();

        let store = FileEventLog::open(dir.path()).await.unwrap();
        let sessions = store.list(SessionFilter::default()).await.unwrap();
        assert_eq!(sessions.len(), 1);
    }
}
