//! Demo relay server with a scripted executor bridge.
//!
//! Run with: cargo run -p web-server-demo
//!
//! Then open http://localhost:3000 in your browser: create a session, submit
//! a prompt, and watch the event timeline stream in. Reload mid-run to see
//! the catch-up replay.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use agent_relay_core::{
    BridgeError, EventKind, EventStream, ExecutorBridge, Role, Session, SessionFilter, SessionId,
};
use agent_relay_session::{RegistryError, SessionRegistry, storage::FileEventLog};
use agent_relay_transport::{WsState, ws_router};
use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type AppState = WsState<FileEventLog, ScriptedBridge>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let data_dir =
        std::env::var("RELAY_DATA_DIR").unwrap_or_else(|_| "./relay-data".to_string());
    let store = FileEventLog::open(&data_dir).await?;
    let registry = Arc::new(SessionRegistry::new(store, ScriptedBridge));
    let state = AppState::new(registry);

    let app = Router::new()
        .route("/", get(index_handler))
        .route("/api/sessions", post(create_session).get(list_sessions))
        .route("/api/sessions/{id}", get(get_session))
        .route("/api/sessions/{id}/submit", post(submit))
        .route("/api/sessions/{id}/history", get(history))
        .with_state(state.clone())
        .merge(ws_router(state))
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([127, 0, 0, 1], 3000));
    tracing::info!("Server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Stand-in executor: emits a plausible run so the relay has something to
/// relay. A real deployment implements `ExecutorBridge` over an agent.
struct ScriptedBridge;

#[async_trait]
impl ExecutorBridge for ScriptedBridge {
    async fn run(&self, session_id: SessionId, prompt: &str) -> Result<EventStream, BridgeError> {
        let (tx, rx) = mpsc::channel(16);
        let prompt = prompt.to_string();

        tokio::spawn(async move {
            tracing::info!(%session_id, "scripted run started");
            let _ = tx
                .send(Ok(EventKind::Message {
                    role: Role::User,
                    content: prompt.clone(),
                }))
                .await;
            let _ = tx
                .send(Ok(EventKind::Status {
                    message: "planning".into(),
                }))
                .await;

            let steps = [
                ("searching the web", Some("web_search")),
                ("reading results", None),
                ("drafting an answer", None),
            ];
            for (step, tool) in steps {
                tokio::time::sleep(Duration::from_millis(600)).await;
                let _ = tx
                    .send(Ok(EventKind::Thinking {
                        step: step.into(),
                        tool: tool.map(Into::into),
                    }))
                    .await;
            }

            tokio::time::sleep(Duration::from_millis(600)).await;
            let answer = format!("Here is what I found about: {prompt}");
            let _ = tx
                .send(Ok(EventKind::Message {
                    role: Role::Assistant,
                    content: answer.clone(),
                }))
                .await;
            let _ = tx.send(Ok(EventKind::Complete { result: answer })).await;
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}

/// Maps registry errors onto HTTP statuses for the REST entry points.
struct ApiError(RegistryError);

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::AlreadyRunning | RegistryError::Finished => StatusCode::CONFLICT,
            RegistryError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize, Default)]
struct CreateSessionBody {
    #[serde(default)]
    metadata: HashMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct SubmitBody {
    prompt: String,
}

async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionBody>,
) -> Result<Json<Session>, ApiError> {
    let id = state.registry.create_session(body.metadata).await?;
    Ok(Json(state.registry.get_session(id).await?))
}

async fn list_sessions(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let sessions = state
        .registry
        .list_sessions(SessionFilter::default())
        .await?;
    Ok(Json(sessions))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<Json<Session>, ApiError> {
    Ok(Json(state.registry.get_session(id).await?))
}

async fn submit(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
    Json(body): Json<SubmitBody>,
) -> Result<impl IntoResponse, ApiError> {
    state.registry.submit(id, &body.prompt).await?;
    Ok(Json(serde_json::json!({ "status": "running" })))
}

async fn history(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.registry.chat_history(id).await?))
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Agent Relay</title>
    <style>
        body { margin: 0; padding: 20px; background: #1e1e1e; color: #d4d4d4;
               font-family: system-ui, sans-serif; }
        h1 { margin-bottom: 10px; }
        #log { background: #111; padding: 12px; min-height: 300px;
               font-family: Menlo, Monaco, monospace; font-size: 13px;
               white-space: pre-wrap; }
        .status { color: #888; font-size: 14px; margin-bottom: 10px; }
        .connected { color: #4a4; }
        .disconnected { color: #a44; }
        input { width: 60%; padding: 6px; }
    </style>
</head>
<body>
    <h1>Agent Relay</h1>
    <div class="status" id="status">No session</div>
    <input id="prompt" placeholder="Describe a task..." />
    <button onclick="submitPrompt()">Submit</button>
    <div id="log"></div>

    <script>
        let sessionId = null;
        let lastSeq = 0;
        let ws = null;

        const status = document.getElementById('status');
        const log = document.getElementById('log');

        function append(line) { log.textContent += line + '\n'; }

        function connect() {
            const protocol = window.location.protocol === 'https:' ? 'wss:' : 'ws:';
            ws = new WebSocket(
                `${protocol}//${window.location.host}/ws/${sessionId}?from_seq=${lastSeq}`);

            ws.onopen = () => {
                status.textContent = `Connected (session ${sessionId}, from ${lastSeq})`;
                status.className = 'status connected';
            };

            // Reconnect with backoff; the server replays from our cursor.
            ws.onclose = () => {
                status.textContent = 'Disconnected - reconnecting...';
                status.className = 'status disconnected';
                if (sessionId) setTimeout(connect, 2000);
            };

            ws.onmessage = (event) => {
                const msg = JSON.parse(event.data);
                if (msg.seq) lastSeq = Math.max(lastSeq, msg.seq);
                switch (msg.type) {
                    case 'heartbeat_probe':
                        ws.send(JSON.stringify({ type: 'heartbeat_ack' }));
                        break;
                    case 'session':
                        append(`[session] status=${msg.session.status}`);
                        break;
                    case 'status': append(`[status] ${msg.message}`); break;
                    case 'thinking':
                        append(`[thinking] ${msg.step}` + (msg.tool ? ` (${msg.tool})` : ''));
                        break;
                    case 'message': append(`[${msg.role}] ${msg.content}`); break;
                    case 'complete': append(`[complete] ${msg.result}`); break;
                    case 'error': append(`[error] ${msg.message}`); break;
                    case 'rejected': append(`[rejected] ${msg.reason}`); break;
                }
            };
        }

        async function submitPrompt() {
            const prompt = document.getElementById('prompt').value;
            if (!sessionId) {
                const res = await fetch('/api/sessions', {
                    method: 'POST',
                    headers: { 'Content-Type': 'application/json' },
                    body: JSON.stringify({}),
                });
                sessionId = (await res.json()).id;
                lastSeq = 0;
                connect();
            }
            ws && ws.readyState === WebSocket.OPEN
                ? ws.send(JSON.stringify({ type: 'submit', prompt }))
                : await fetch(`/api/sessions/${sessionId}/submit`, {
                      method: 'POST',
                      headers: { 'Content-Type': 'application/json' },
                      body: JSON.stringify({ prompt }),
                  });
        }
    </script>
</body>
</html>
"#;
