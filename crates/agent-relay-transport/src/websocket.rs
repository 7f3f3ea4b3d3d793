//! WebSocket transport: catch-up replay, live delivery, heartbeat.

use std::sync::Arc;

use agent_relay_core::{Event, EventLog, ExecutorBridge, Session, SessionId};
use agent_relay_session::{RegistryError, SessionRegistry};
use axum::{
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket},
    },
    response::IntoResponse,
};
use futures::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::{
    connection::{ConnectionHandle, ConnectionManager, HeartbeatConfig},
    protocol::{ClientMessage, ServerMessage},
};

/// Close code for "session not found", mirrored by the browser client.
const CLOSE_NOT_FOUND: u16 = 4004;
/// Close code for internal failures during attach.
const CLOSE_INTERNAL: u16 = 1011;
/// Close code for a connection dropped from the broadcast set before the
/// terminal event; the client reconnects and replays from its cursor.
const CLOSE_LAGGED: u16 = 4008;

/// Shared state for the WebSocket routes.
pub struct WsState<S, B> {
    pub registry: Arc<SessionRegistry<S, B>>,
    pub connections: Arc<ConnectionManager>,
    pub heartbeat: HeartbeatConfig,
}

impl<S, B> Clone for WsState<S, B> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            connections: Arc::clone(&self.connections),
            heartbeat: self.heartbeat,
        }
    }
}

impl<S, B> WsState<S, B> {
    /// Create WebSocket state with default heartbeat timing.
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry<S, B>>) -> Self {
        Self {
            registry,
            connections: Arc::new(ConnectionManager::new()),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

/// Client-declared catch-up cursor, from the connection URL.
#[derive(Debug, Deserialize)]
pub struct AttachParams {
    /// Last sequence number the client has already seen (0 if none).
    #[serde(default)]
    pub from_seq: u64,
}

/// WebSocket upgrade handler.
pub async fn ws_handler<S, B>(
    ws: WebSocketUpgrade,
    Path(session_id): Path<SessionId>,
    Query(params): Query<AttachParams>,
    State(state): State<WsState<S, B>>,
) -> impl IntoResponse
where
    S: EventLog + 'static,
    B: ExecutorBridge + 'static,
{
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id, params.from_seq))
}

async fn handle_socket<S, B>(
    mut socket: WebSocket,
    state: WsState<S, B>,
    session_id: SessionId,
    from_seq: u64,
) where
    S: EventLog + 'static,
    B: ExecutorBridge + 'static,
{
    let session = match state.registry.get_session(session_id).await {
        Ok(session) => session,
        Err(RegistryError::NotFound(_)) => {
            close_with(&mut socket, CLOSE_NOT_FOUND, "session not found").await;
            return;
        }
        Err(e) => {
            tracing::error!(%session_id, "failed to load session: {e}");
            close_with(&mut socket, CLOSE_INTERNAL, "session load failed").await;
            return;
        }
    };

    let attachment = match state.registry.attach(session_id, from_seq).await {
        Ok(attachment) => attachment,
        Err(e) => {
            tracing::error!(%session_id, "attach failed: {e}");
            close_with(&mut socket, CLOSE_INTERNAL, "attach failed").await;
            return;
        }
    };
    let subscriber_id = attachment.subscription.as_ref().map(|s| s.id);

    let conn = state.connections.register(session_id);
    tracing::info!(connection = %conn.id(), %session_id, from_seq, "websocket attached");

    let (mut sender, mut receiver) = socket.split();

    // Replies produced by the inbound loop (pong, submitted, rejected).
    let (tx, rx) = mpsc::channel::<ServerMessage>(64);

    let conn_out = Arc::clone(&conn);
    let heartbeat = state.heartbeat;
    let live = attachment.subscription.map(|s| s.rx);
    let mut send_task = tokio::spawn(async move {
        send_loop(
            &mut sender,
            rx,
            live,
            conn_out,
            heartbeat,
            session,
            attachment.replay,
        )
        .await;
    });

    loop {
        tokio::select! {
            // The send task exits on heartbeat expiry or a dead socket.
            _ = &mut send_task => break,
            incoming = receiver.next() => {
                let Some(incoming) = incoming else { break };
                let text = match incoming {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                        Ok(s) => s.into(),
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::debug!(connection = %conn.id(), "websocket error: {e}");
                        break;
                    }
                };

                let client_msg: ClientMessage = match serde_json::from_str(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        tracing::warn!(connection = %conn.id(), "invalid client message: {e}");
                        let _ = tx
                            .send(ServerMessage::Error {
                                seq: None,
                                message: format!("invalid message: {e}"),
                            })
                            .await;
                        continue;
                    }
                };

                match client_msg {
                    ClientMessage::HeartbeatAck => conn.touch(),
                    ClientMessage::Ping => {
                        conn.touch();
                        let _ = tx.send(ServerMessage::Pong).await;
                    }
                    ClientMessage::Submit { prompt } => {
                        conn.touch();
                        let reply = match state.registry.submit(session_id, &prompt).await {
                            Ok(()) => ServerMessage::Submitted,
                            Err(e) => ServerMessage::Rejected {
                                reason: e.to_string(),
                            },
                        };
                        let _ = tx.send(reply).await;
                    }
                }
            }
        }
    }

    send_task.abort();
    if let Some(subscriber_id) = subscriber_id {
        state.registry.detach(session_id, subscriber_id).await;
    }
    state.connections.remove(conn.id());
    tracing::info!(connection = %conn.id(), %session_id, "websocket disconnected");
}

/// Outbound half of one connection: session snapshot, catch-up replay, then
/// live events interleaved with control replies and heartbeat probes.
///
/// Returns when the socket dies, the heartbeat grace window elapses, or the
/// live feed ends before this connection saw a terminal event. The last case
/// means the relay dropped us as a slow consumer; the socket is closed with
/// `CLOSE_LAGGED` so the client reconnects and replays from its cursor
/// instead of sitting on a healthy-looking connection that delivers nothing.
async fn send_loop<W>(
    sender: &mut W,
    mut control: mpsc::Receiver<ServerMessage>,
    mut live: Option<mpsc::Receiver<Event>>,
    conn: Arc<ConnectionHandle>,
    heartbeat: HeartbeatConfig,
    session: Session,
    replay: Vec<Event>,
) where
    W: Sink<Message> + Unpin,
{
    if send_msg(sender, &ServerMessage::Session { session })
        .await
        .is_err()
    {
        return;
    }

    let mut delivered_terminal = false;
    for event in replay {
        let seq = event.seq;
        let terminal = event.is_terminal();
        if send_msg(sender, &ServerMessage::from_event(event))
            .await
            .is_err()
        {
            return;
        }
        conn.record_delivered(seq);
        delivered_terminal |= terminal;
    }

    let mut probe = tokio::time::interval(heartbeat.interval);
    probe.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            reply = control.recv() => {
                let Some(reply) = reply else { return };
                if send_msg(sender, &reply).await.is_err() {
                    return;
                }
            }
            event = recv_live(&mut live), if live.is_some() => {
                match event {
                    Some(event) => {
                        let seq = event.seq;
                        let terminal = event.is_terminal();
                        if send_msg(sender, &ServerMessage::from_event(event))
                            .await
                            .is_err()
                        {
                            return;
                        }
                        conn.record_delivered(seq);
                        delivered_terminal |= terminal;
                    }
                    None if delivered_terminal => live = None,
                    None => {
                        tracing::info!(
                            connection = %conn.id(),
                            "live feed ended before the terminal event, closing for replay"
                        );
                        let _ = sender
                            .send(Message::Close(Some(CloseFrame {
                                code: CLOSE_LAGGED,
                                reason: "event delivery lagged, reconnect to resume".into(),
                            })))
                            .await;
                        return;
                    }
                }
            }
            _ = probe.tick() => {
                if conn.is_expired(heartbeat.grace) {
                    tracing::info!(
                        connection = %conn.id(),
                        "heartbeat grace elapsed, closing connection"
                    );
                    return;
                }
                if send_msg(sender, &ServerMessage::HeartbeatProbe).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn recv_live(live: &mut Option<mpsc::Receiver<Event>>) -> Option<Event> {
    match live {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn send_msg<W>(sender: &mut W, msg: &ServerMessage) -> Result<(), W::Error>
where
    W: Sink<Message> + Unpin,
{
    let json = match serde_json::to_string(msg) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!("failed to serialize message: {e}");
            return Ok(());
        }
    };
    sender.send(Message::Text(json.into())).await
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

/// Create the WebSocket router.
///
/// # Example
/// ```ignore
/// let app = Router::new()
///     .merge(ws_router(state.clone()));
/// ```
#[must_use]
pub fn ws_router<S, B>(state: WsState<S, B>) -> axum::Router
where
    S: EventLog + 'static,
    B: ExecutorBridge + 'static,
{
    axum::Router::new()
        .route("/ws/{session_id}", axum::routing::get(ws_handler::<S, B>))
        .with_state(state)
}
