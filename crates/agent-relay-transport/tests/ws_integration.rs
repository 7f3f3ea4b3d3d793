//! End-to-end WebSocket tests against a live server.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use agent_relay_core::{
    BridgeError, EventKind, EventStream, ExecutorBridge, SessionId, SessionStatus,
};
use agent_relay_session::{SessionRegistry, storage::MemoryEventLog};
use agent_relay_transport::{HeartbeatConfig, WsState, ws_router};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::{net::TcpStream, sync::mpsc, time::timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Bridge whose event production is driven by the test through a channel.
struct HandDrivenBridge {
    feed: StdMutex<Option<mpsc::Receiver<EventKind>>>,
}

impl HandDrivenBridge {
    fn new() -> (Self, mpsc::Sender<EventKind>) {
        let (tx, rx) = mpsc::channel(8);
        (
            Self {
                feed: StdMutex::new(Some(rx)),
            },
            tx,
        )
    }
}

#[async_trait]
impl ExecutorBridge for HandDrivenBridge {
    async fn run(&self, _id: SessionId, _prompt: &str) -> Result<EventStream, BridgeError> {
        let rx = self
            .feed
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| BridgeError::StartFailed("no run scripted".into()))?;
        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|kind| (Ok(kind), rx))
        })
        .boxed())
    }
}

async fn serve(state: WsState<MemoryEventLog, HandDrivenBridge>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, ws_router(state)).await.unwrap();
    });
    addr.to_string()
}

async fn next_json(ws: &mut WsClient) -> Option<serde_json::Value> {
    while let Some(msg) = ws.next().await {
        if let Ok(Message::Text(text)) = msg {
            return Some(serde_json::from_str(&text).unwrap());
        }
    }
    None
}

#[tokio::test]
async fn test_silent_connection_is_torn_down_and_resources_released() {
    let (bridge, producer) = HandDrivenBridge::new();
    let registry = Arc::new(SessionRegistry::new(MemoryEventLog::new(), bridge));
    let id = registry.create_session(HashMap::new()).await.unwrap();
    registry.submit(id, "demo").await.unwrap();

    let mut state = WsState::new(Arc::clone(&registry));
    state.heartbeat = HeartbeatConfig {
        interval: Duration::from_millis(100),
        grace: Duration::from_millis(400),
    };
    let connections = Arc::clone(&state.connections);
    let addr = serve(state).await;

    let (mut ws, _) = connect_async(format!("ws://{addr}/ws/{id}?from_seq=0"))
        .await
        .unwrap();

    // Snapshot first, then live delivery while the connection is healthy.
    let snapshot = next_json(&mut ws).await.unwrap();
    assert_eq!(snapshot["type"], "session");

    producer
        .send(EventKind::Status {
            message: "planning".into(),
        })
        .await
        .unwrap();
    let event = timeout(Duration::from_secs(5), async {
        loop {
            let msg = next_json(&mut ws).await.unwrap();
            if msg["type"] != "heartbeat_probe" {
                return msg;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(event["type"], "status");
    assert_eq!(event["seq"], 1);

    // Never answer a probe: the server must tear the connection down on its
    // own within the grace window.
    let closed = timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "server never closed the silent connection");

    // Handler cleanup releases the connection entry.
    timeout(Duration::from_secs(5), async {
        while !connections.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // The dead subscriber is detached from the relay: the run keeps producing
    // and completes undisturbed.
    producer
        .send(EventKind::Complete {
            result: "done".into(),
        })
        .await
        .unwrap();
    timeout(Duration::from_secs(5), async {
        loop {
            let session = registry.get_session(id).await.unwrap();
            if session.status == SessionStatus::Complete {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let replay = registry.attach(id, 0).await.unwrap().replay;
    assert_eq!(
        replay.iter().map(|e| e.seq).collect::<Vec<_>>(),
        vec![1, 2]
    );
}

#[tokio::test]
async fn test_acking_client_stays_connected_through_the_run() {
    let (bridge, producer) = HandDrivenBridge::new();
    let registry = Arc::new(SessionRegistry::new(MemoryEventLog::new(), bridge));
    let id = registry.create_session(HashMap::new()).await.unwrap();
    registry.submit(id, "demo").await.unwrap();

    let mut state = WsState::new(Arc::clone(&registry));
    state.heartbeat = HeartbeatConfig {
        interval: Duration::from_millis(50),
        grace: Duration::from_millis(150),
    };
    let addr = serve(state).await;

    let (mut ws, _) = connect_async(format!("ws://{addr}/ws/{id}?from_seq=0"))
        .await
        .unwrap();

    // The run outlasts the grace window by several probe intervals, so the
    // client only sees the terminal event if its acks keep it alive.
    tokio::spawn(async move {
        producer
            .send(EventKind::Status {
                message: "planning".into(),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        producer
            .send(EventKind::Complete {
                result: "done".into(),
            })
            .await
            .unwrap();
    });

    let mut seqs = Vec::new();
    timeout(Duration::from_secs(5), async {
        loop {
            let msg = next_json(&mut ws).await.unwrap();
            match msg["type"].as_str().unwrap() {
                "heartbeat_probe" => {
                    ws.send(Message::Text(r#"{"type":"heartbeat_ack"}"#.into()))
                        .await
                        .unwrap();
                }
                "session" => {}
                "complete" => {
                    seqs.push(msg["seq"].as_u64().unwrap());
                    return;
                }
                _ => seqs.push(msg["seq"].as_u64().unwrap()),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(seqs, vec![1, 2]);
}
