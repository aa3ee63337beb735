use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, header};
use axum::response::IntoResponse;
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::auth::{IdentityResolver, SessionDirectory};
use crate::config::GameContent;
use crate::persist::OutcomeSink;
use crate::protocol::{ClientEnvelope, Role, ServerEnvelope, ServerMsg, close};
use crate::room::{Connection, Outbound, Registry, RoomCommand};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub identity: Arc<dyn IdentityResolver>,
    pub directory: Arc<dyn SessionDirectory>,
    pub sink: Arc<dyn OutcomeSink>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params, headers))
}

/// A hard policy rejection: the socket is closed with the code and no
/// attach happens.
struct Rejection {
    code: u16,
    reason: &'static str,
}

impl Rejection {
    fn new(code: u16, reason: &'static str) -> Self {
        Self { code, reason }
    }
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(header::COOKIE)?
        .to_str()
        .ok()?
        .split(';')
        .find_map(|part| {
            let (key, value) = part.trim().split_once('=')?;
            (key == name).then(|| value.to_string())
        })
}

/// Resolve identity and ownership before anything touches a room.
async fn admit(
    state: &AppState,
    params: &HashMap<String, String>,
    headers: &HeaderMap,
) -> Result<(Role, String, GameContent), Rejection> {
    let session_id = params
        .get("sessionId")
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Rejection::new(close::INVALID_SESSION, "missing session identifier"))?;

    let role = match params.get("role").map(String::as_str) {
        Some("supervisor") => Role::Supervisor,
        Some("learner") => Role::Learner,
        _ => return Err(Rejection::new(close::INVALID_ROLE, "missing or invalid role")),
    };

    let info = state
        .directory
        .lookup(session_id)
        .await
        .ok_or_else(|| Rejection::new(close::INVALID_SESSION, "unknown session"))?;

    match role {
        Role::Supervisor => {
            let cookie = cookie_value(headers, "supervisor_session").ok_or_else(|| {
                Rejection::new(close::CREDENTIAL_REJECTED, "missing supervisor cookie")
            })?;
            let supervisor_id =
                state.identity.resolve_supervisor(&cookie).await.ok_or_else(|| {
                    Rejection::new(close::CREDENTIAL_REJECTED, "unrecognized supervisor credential")
                })?;
            if supervisor_id != info.supervisor_id {
                return Err(Rejection::new(
                    close::OWNERSHIP_MISMATCH,
                    "session not owned by this supervisor",
                ));
            }
        }
        Role::Learner => {
            let token = params.get("token").ok_or_else(|| {
                Rejection::new(close::CREDENTIAL_REJECTED, "missing link token")
            })?;
            if !state.identity.admit_learner(session_id, token).await {
                return Err(Rejection::new(close::CREDENTIAL_REJECTED, "invalid link token"));
            }
        }
    }

    Ok((role, session_id.clone(), info.game))
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    params: HashMap<String, String>,
    headers: HeaderMap,
) {
    match admit(&state, &params, &headers).await {
        Ok((role, session_id, spec)) => run_connection(socket, state, role, session_id, spec).await,
        Err(rejection) => {
            tracing::info!(code = rejection.code, reason = rejection.reason, "connection rejected");
            let mut socket = socket;
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: rejection.code,
                    reason: rejection.reason.into(),
                })))
                .await;
        }
    }
}

async fn run_connection(
    socket: WebSocket,
    state: AppState,
    role: Role,
    session_id: String,
    spec: GameContent,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let conn_id = Uuid::new_v4().to_string();
    let conn = Connection {
        id: conn_id.clone(),
        tx: out_tx.clone(),
    };
    tracing::info!(session = %session_id, %role, conn = %conn_id, "websocket connected");

    // Attach, re-resolving the room once if it shut down in between.
    let mut handle = None;
    for _ in 0..2 {
        let candidate =
            state
                .registry
                .get_or_create(&session_id, || spec.build(), state.sink.clone());
        let attach = RoomCommand::Attach {
            role,
            conn: conn.clone(),
        };
        if candidate.cmd_tx.send(attach).await.is_ok() {
            handle = Some(candidate);
            break;
        }
    }
    let Some(handle) = handle else {
        let _ = ws_tx
            .send(Message::Close(Some(CloseFrame {
                code: close::INTERNAL,
                reason: "room unavailable".into(),
            })))
            .await;
        return;
    };

    // Pump room frames out to the socket. Ends when the room drops this
    // connection or tells it to close (e.g. superseded).
    let forward = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            match frame {
                Outbound::Msg(env) => {
                    let Ok(json) = serde_json::to_string(&env) else { continue };
                    if ws_tx.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    while let Some(Ok(msg)) = ws_rx.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let envelope: ClientEnvelope = match serde_json::from_str(&text) {
            Ok(envelope) => envelope,
            Err(err) => {
                // Protocol errors reply to the sender only.
                tracing::warn!(session = %session_id, %role, "malformed message: {}", err);
                let _ = out_tx.send(Outbound::Msg(ServerEnvelope::new(ServerMsg::Error {
                    message: "malformed message payload".to_string(),
                    code: Some("malformed".to_string()),
                })));
                continue;
            }
        };

        // The authoritative role comes from admission, never from the
        // envelope's player field.
        if handle
            .cmd_tx
            .send(RoomCommand::Handle {
                role,
                msg: envelope.msg,
            })
            .await
            .is_err()
        {
            break;
        }
    }

    tracing::info!(session = %session_id, %role, conn = %conn_id, "websocket disconnected");
    let _ = handle
        .cmd_tx
        .send(RoomCommand::Detach {
            role,
            conn_id,
        })
        .await;
    // Release our sender halves so the forward task can drain and finish.
    drop(conn);
    drop(out_tx);
    let _ = forward.await;
}
