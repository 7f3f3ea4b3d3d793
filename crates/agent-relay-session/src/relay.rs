//! Per-session relay: the ordering, durability, and broadcast authority.

use std::{sync::Arc, time::Duration};

use agent_relay_core::{
    Event, EventKind, EventLog, EventStream, SessionId, SessionStatus, StoreError,
};
use futures::StreamExt;
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

/// Relay tunables.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Capacity of the bounded outbound queue per attached connection.
    pub subscriber_queue: usize,
    /// Durable append attempts before the session is marked failed.
    pub append_attempts: u32,
    /// Initial delay between append attempts; doubles on each retry.
    pub append_backoff: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            subscriber_queue: 256,
            append_attempts: 3,
            append_backoff: Duration::from_millis(50),
        }
    }
}

/// Live feed handle produced by [`SessionRelay::attach`].
pub struct Subscription {
    /// Identifies this subscriber in the broadcast set.
    pub id: Uuid,
    /// Bounded live event feed; ends after the terminal event.
    pub rx: mpsc::Receiver<Event>,
}

/// Result of attaching to a session at a given cursor.
pub struct Attachment {
    /// Persisted events with sequence > the requested cursor, in order.
    pub replay: Vec<Event>,
    /// Live feed, `None` when the session already reached a terminal event.
    pub subscription: Option<Subscription>,
}

/// Outcome of trying to start a run.
pub(crate) enum RunGate {
    Started,
    AlreadyRunning,
    Finished,
}

struct Subscriber {
    id: Uuid,
    tx: mpsc::Sender<Event>,
}

struct RelayState {
    last_seq: u64,
    running: bool,
    closed: bool,
    subscribers: Vec<Subscriber>,
}

/// Ordering, durability, and broadcast authority for one session's events.
///
/// All per-session mutable state sits behind one async mutex so that sequence
/// assignment, the durable append, and the subscriber snapshot for broadcast
/// happen as a single indivisible step. An attach therefore lands exactly at
/// "last replayed sequence": it either observes an event in its replay or
/// receives it live, never both and never neither.
pub struct SessionRelay<S> {
    session_id: SessionId,
    store: Arc<S>,
    config: RelayConfig,
    state: Mutex<RelayState>,
}

impl<S: EventLog> SessionRelay<S> {
    /// Load relay state for a session from the store.
    pub(crate) async fn load(
        session_id: SessionId,
        store: Arc<S>,
        config: RelayConfig,
        status: SessionStatus,
    ) -> Result<Self, StoreError> {
        let last_seq = store.last_seq(session_id).await?;
        Ok(Self {
            session_id,
            store,
            config,
            state: Mutex::new(RelayState {
                last_seq,
                running: false,
                closed: status.is_terminal(),
                subscribers: Vec::new(),
            }),
        })
    }

    /// The session this relay serves.
    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Replay persisted events past `after_seq`, then splice into the live
    /// broadcast set.
    ///
    /// The splice happens under the state lock, atomically with respect to
    /// the next published event: no duplicate, no gap. For a terminal session
    /// only the replay is returned; its last event signals the terminal state.
    ///
    /// # Errors
    /// Returns error if the catch-up read fails.
    pub async fn attach(&self, after_seq: u64) -> Result<Attachment, StoreError> {
        let mut state = self.state.lock().await;
        let replay = self.store.read_from(self.session_id, after_seq).await?;

        if state.closed {
            return Ok(Attachment {
                replay,
                subscription: None,
            });
        }

        let (tx, rx) = mpsc::channel(self.config.subscriber_queue);
        let id = Uuid::new_v4();
        state.subscribers.push(Subscriber { id, tx });

        Ok(Attachment {
            replay,
            subscription: Some(Subscription { id, rx }),
        })
    }

    /// Remove a subscriber from the broadcast set.
    pub async fn detach(&self, subscriber_id: Uuid) {
        self.state
            .lock()
            .await
            .subscribers
            .retain(|s| s.id != subscriber_id);
    }

    /// Claim the single run slot for this session.
    pub(crate) async fn begin_run(&self) -> RunGate {
        let mut state = self.state.lock().await;
        if state.closed {
            return RunGate::Finished;
        }
        if state.running {
            return RunGate::AlreadyRunning;
        }
        state.running = true;
        RunGate::Started
    }

    /// Release the run slot without producing anything (start failed).
    pub(crate) async fn abort_run(&self) {
        self.state.lock().await.running = false;
    }

    /// Consume the bridge's event stream until its terminal event.
    ///
    /// Every failure path ends in a terminal event (or, if the store itself
    /// is down, a best-effort error status): a stalled session with no
    /// terminal event is indistinguishable from a hang to the client.
    pub(crate) async fn drive(&self, mut stream: EventStream) {
        while let Some(item) = stream.next().await {
            match item {
                Ok(kind) => {
                    let is_terminal = kind.is_terminal();
                    match self.publish(kind).await {
                        Ok(Some(_)) => {
                            if is_terminal {
                                return;
                            }
                        }
                        Ok(None) => {
                            tracing::warn!(
                                session_id = %self.session_id,
                                "executor produced an event after the terminal event, ignoring"
                            );
                            return;
                        }
                        Err(e) => {
                            self.mark_error_locally(format!("event log store failed: {e}"))
                                .await;
                            return;
                        }
                    }
                }
                Err(e) => {
                    self.fail(e.to_string()).await;
                    return;
                }
            }
        }
        self.fail("executor stream ended without a terminal event".to_string())
            .await;
    }

    /// Record an executor failure as a terminal error event.
    pub(crate) async fn fail(&self, message: String) {
        match self
            .publish(EventKind::Error {
                message: message.clone(),
            })
            .await
        {
            Ok(_) => {}
            Err(e) => {
                tracing::error!(
                    session_id = %self.session_id,
                    "failed to record terminal error event: {e}"
                );
                self.mark_error_locally(format!("{message}; store append failed: {e}"))
                    .await;
            }
        }
    }

    /// Assign the next sequence number, append durably, then broadcast.
    ///
    /// Append-then-broadcast order is mandatory: a client must never observe
    /// an event that is not yet durable. Returns `Ok(None)` once the relay is
    /// closed by a terminal event.
    pub(crate) async fn publish(&self, kind: EventKind) -> Result<Option<Event>, StoreError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(None);
        }

        let seq = state.last_seq + 1;
        let event = Event::new(self.session_id, seq, kind);
        self.append_with_retry(&event).await?;
        state.last_seq = seq;

        state.subscribers.retain(|sub| {
            match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Backpressure-reject: a slow consumer is dropped rather
                    // than buffered without bound; it replays on reconnect.
                    tracing::warn!(
                        session_id = %event.session_id,
                        subscriber = %sub.id,
                        "outbound queue full, dropping subscriber"
                    );
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });

        if event.is_terminal() {
            state.closed = true;
            state.running = false;
            // Dropping the senders ends every live feed after the terminal
            // event; late attaches get the full log replayed instead.
            state.subscribers.clear();

            let (status, error) = match &event.kind {
                EventKind::Error { message } => (SessionStatus::Error, Some(message.clone())),
                _ => (SessionStatus::Complete, None),
            };
            if let Err(e) = self
                .store
                .update_status(self.session_id, status, error)
                .await
            {
                tracing::error!(
                    session_id = %self.session_id,
                    "failed to persist terminal status: {e}"
                );
            }
        }

        Ok(Some(event))
    }

    async fn append_with_retry(&self, event: &Event) -> Result<(), StoreError> {
        let mut delay = self.config.append_backoff;
        let mut attempt = 1;
        loop {
            match self.store.append(event).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.config.append_attempts => {
                    tracing::warn!(
                        session_id = %event.session_id,
                        seq = event.seq,
                        attempt,
                        "append failed, retrying: {e}"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Close the relay and mark the session failed when no terminal event
    /// can be appended (the store itself is unavailable).
    async fn mark_error_locally(&self, description: String) {
        let mut state = self.state.lock().await;
        state.closed = true;
        state.running = false;
        state.subscribers.clear();
        drop(state);

        if let Err(e) = self
            .store
            .update_status(self.session_id, SessionStatus::Error, Some(description))
            .await
        {
            tracing::error!(
                session_id = %self.session_id,
                "failed to persist error status: {e}"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryEventLog;
    use agent_relay_core::Session;
    use std::collections::HashMap;

    async fn relay_for_new_session(config: RelayConfig) -> SessionRelay<MemoryEventLog> {
        let store = Arc::new(MemoryEventLog::new());
        let session = Session::new(HashMap::new());
        store.create_session(&session).await.unwrap();
        SessionRelay::load(session.id, store, config, session.status)
            .await
            .unwrap()
    }

    fn status(message: &str) -> EventKind {
        EventKind::Status {
            message: message.into(),
        }
    }

    #[tokio::test]
    async fn test_publish_assigns_contiguous_sequences() {
        let relay = relay_for_new_session(RelayConfig::default()).await;

        let first = relay.publish(status("a")).await.unwrap().unwrap();
        let second = relay.publish(status("b")).await.unwrap().unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);

        let persisted = relay.store.read_from(relay.session_id(), 0).await.unwrap();
        assert_eq!(
            persisted.iter().map(|e| e.seq).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[tokio::test]
    async fn test_attach_splices_between_replay_and_live() {
        let relay = relay_for_new_session(RelayConfig::default()).await;

        relay.publish(status("one")).await.unwrap();
        relay.publish(status("two")).await.unwrap();

        let mut attachment = relay.attach(0).await.unwrap();
        assert_eq!(
            attachment.replay.iter().map(|e| e.seq).collect::<Vec<_>>(),
            vec![1, 2]
        );

        relay.publish(status("three")).await.unwrap();
        let mut sub = attachment.subscription.take().unwrap();
        let live = sub.rx.recv().await.unwrap();
        assert_eq!(live.seq, 3);
    }

    #[tokio::test]
    async fn test_attach_from_cursor_skips_seen_events() {
        let relay = relay_for_new_session(RelayConfig::default()).await;
        for i in 0..4 {
            relay.publish(status(&format!("{i}"))).await.unwrap();
        }

        let attachment = relay.attach(2).await.unwrap();
        assert_eq!(
            attachment.replay.iter().map(|e| e.seq).collect::<Vec<_>>(),
            vec![3, 4]
        );
    }

    #[tokio::test]
    async fn test_terminal_event_closes_relay_and_ends_feeds() {
        let relay = relay_for_new_session(RelayConfig::default()).await;
        let mut attachment = relay.attach(0).await.unwrap();
        let mut sub = attachment.subscription.take().unwrap();

        relay
            .publish(EventKind::Complete {
                result: "done".into(),
            })
            .await
            .unwrap();

        let last = sub.rx.recv().await.unwrap();
        assert!(last.is_terminal());
        assert!(sub.rx.recv().await.is_none(), "feed ends after terminal");

        // Further producer events are ignored, not sequenced.
        assert!(relay.publish(status("late")).await.unwrap().is_none());
        let persisted = relay.store.read_from(relay.session_id(), 0).await.unwrap();
        assert_eq!(persisted.len(), 1);

        // Late attaches replay the full log with no live feed.
        let late = relay.attach(0).await.unwrap();
        assert_eq!(late.replay.len(), 1);
        assert!(late.subscription.is_none());
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_rejected_not_buffered() {
        let relay = relay_for_new_session(RelayConfig {
            subscriber_queue: 1,
            ..RelayConfig::default()
        })
        .await;

        let mut attachment = relay.attach(0).await.unwrap();
        let sub = attachment.subscription.take().unwrap();

        // Queue holds one event; the second overflows and drops the
        // subscriber instead of blocking the producer.
        relay.publish(status("one")).await.unwrap();
        relay.publish(status("two")).await.unwrap();
        assert_eq!(relay.state.lock().await.subscribers.len(), 0);

        // Both events are still durable for the eventual reconnect.
        drop(sub);
        let persisted = relay.store.read_from(relay.session_id(), 0).await.unwrap();
        assert_eq!(persisted.len(), 2);
    }

    #[tokio::test]
    async fn test_detach_removes_subscriber() {
        let relay = relay_for_new_session(RelayConfig::default()).await;
        let attachment = relay.attach(0).await.unwrap();
        let sub = attachment.subscription.unwrap();

        relay.detach(sub.id).await;
        assert_eq!(relay.state.lock().await.subscribers.len(), 0);
    }

    #[tokio::test]
    async fn test_run_gate_serializes_runs() {
        let relay = relay_for_new_session(RelayConfig::default()).await;

        assert!(matches!(relay.begin_run().await, RunGate::Started));
        assert!(matches!(relay.begin_run().await, RunGate::AlreadyRunning));

        relay
            .publish(EventKind::Complete {
                result: "done".into(),
            })
            .await
            .unwrap();
        assert!(matches!(relay.begin_run().await, RunGate::Finished));
    }
}
