use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{self, HeaderValue};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::protocol::{
    ClientEnvelope, ClientMsg, GameSnapshot, Role, ServerEnvelope, ServerMsg, close,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Handler = Box<dyn Fn(&ServerMsg) + Send + Sync>;

// Reconnection bounds for unexpected closures.
const INITIAL_RETRY_DELAY_MS: u64 = 250;
const MAX_RETRY_DELAY_MS: u64 = 4_000;
const BACKOFF_MULTIPLIER: f64 = 2.0;
const MAX_RETRY_ATTEMPTS: u32 = 5;

/// Exponential backoff state for the reconnect loop.
#[derive(Debug, Clone, Copy)]
struct BackoffState {
    attempts: u32,
    delay_ms: u64,
}

impl Default for BackoffState {
    fn default() -> Self {
        Self {
            attempts: 0,
            delay_ms: INITIAL_RETRY_DELAY_MS,
        }
    }
}

impl BackoffState {
    fn reset(&mut self) {
        *self = Self::default();
    }

    fn is_exhausted(&self) -> bool {
        self.attempts >= MAX_RETRY_ATTEMPTS
    }

    /// Returns the delay to wait before the next attempt, advancing the
    /// delay for the attempt after it.
    fn next_delay_and_advance(&mut self) -> Option<u64> {
        if self.is_exhausted() {
            return None;
        }
        let current = self.delay_ms;
        self.attempts += 1;
        self.delay_ms =
            ((self.delay_ms as f64) * BACKOFF_MULTIPLIER).min(MAX_RETRY_DELAY_MS as f64) as u64;
        Some(current)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("not connected")]
    NotConnected,
}

/// How a finished connection ended.
enum CloseKind {
    /// The user called `disconnect`.
    User,
    /// The server closed with a policy code; terminal, never retried.
    Policy(u16),
    /// Anything else; eligible for backoff reconnect.
    Abnormal,
}

/// Participant-side wrapper around the game connection. Sends the join on
/// every (re)connect, caches the latest full-state broadcast, and exposes
/// subscribe-by-message-type callbacks for the presentation layer.
#[derive(Clone)]
pub struct SessionClient {
    url: String,
    cookie: Option<String>,
    role: Role,
    session_id: String,
    latest: Arc<std::sync::Mutex<Option<GameSnapshot>>>,
    handlers: Arc<std::sync::Mutex<HashMap<String, Vec<Handler>>>>,
    out: Arc<Mutex<Option<mpsc::UnboundedSender<ClientMsg>>>>,
    user_closed: Arc<AtomicBool>,
}

impl SessionClient {
    pub fn supervisor(base_url: &str, session_id: &str, cookie: &str) -> Self {
        Self::new(
            format!("{base_url}/ws?sessionId={session_id}&role=supervisor"),
            Some(format!("supervisor_session={cookie}")),
            Role::Supervisor,
            session_id,
        )
    }

    pub fn learner(base_url: &str, session_id: &str, token: &str) -> Self {
        Self::new(
            format!("{base_url}/ws?sessionId={session_id}&role=learner&token={token}"),
            None,
            Role::Learner,
            session_id,
        )
    }

    fn new(url: String, cookie: Option<String>, role: Role, session_id: &str) -> Self {
        Self {
            url,
            cookie,
            role,
            session_id: session_id.to_string(),
            latest: Arc::new(std::sync::Mutex::new(None)),
            handlers: Arc::new(std::sync::Mutex::new(HashMap::new())),
            out: Arc::new(Mutex::new(None)),
            user_closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribe to a server message type by its wire name.
    pub fn on<F>(&self, type_name: &str, handler: F)
    where
        F: Fn(&ServerMsg) + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .unwrap()
            .entry(type_name.to_string())
            .or_default()
            .push(Box::new(handler));
    }

    /// Latest cached full-state snapshot, if any has arrived.
    pub fn latest_state(&self) -> Option<GameSnapshot> {
        self.latest.lock().unwrap().clone()
    }

    /// Open the connection. The initial handshake is not retried; only
    /// later unexpected closures trigger the backoff reconnect loop.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let stream = self
            .dial()
            .await
            .map_err(|err| ClientError::Connect(err.to_string()))?;
        let me = self.clone();
        tokio::spawn(async move { me.run(stream).await });
        Ok(())
    }

    pub async fn send(&self, msg: ClientMsg) -> Result<(), ClientError> {
        let out = self.out.lock().await;
        out.as_ref()
            .ok_or(ClientError::NotConnected)?
            .send(msg)
            .map_err(|_| ClientError::NotConnected)
    }

    /// User-initiated shutdown; no reconnect follows.
    pub async fn disconnect(&self) {
        self.user_closed.store(true, Ordering::SeqCst);
        *self.out.lock().await = None;
    }

    async fn dial(&self) -> Result<WsStream, tokio_tungstenite::tungstenite::Error> {
        let mut request = self.url.clone().into_client_request()?;
        if let Some(cookie) = &self.cookie {
            let value = HeaderValue::from_str(cookie).map_err(http::Error::from)?;
            request.headers_mut().insert("Cookie", value);
        }
        let (stream, _) = connect_async(request).await?;
        Ok(stream)
    }

    async fn run(self, first: WsStream) {
        let mut stream = Some(first);
        let mut backoff = BackoffState::default();
        loop {
            let ws = match stream.take() {
                Some(ws) => ws,
                None => {
                    let Some(delay) = backoff.next_delay_and_advance() else {
                        tracing::warn!("reconnect attempts exhausted, giving up");
                        break;
                    };
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    match self.dial().await {
                        Ok(ws) => ws,
                        Err(err) => {
                            tracing::warn!("reconnect attempt failed: {}", err);
                            continue;
                        }
                    }
                }
            };
            backoff.reset();

            match self.drive(ws).await {
                CloseKind::User => break,
                CloseKind::Policy(code) => {
                    tracing::warn!(code, "connection closed by policy, not retrying");
                    break;
                }
                CloseKind::Abnormal => {
                    if self.user_closed.load(Ordering::SeqCst) {
                        break;
                    }
                    tracing::info!("connection lost, reconnecting");
                }
            }
        }
        *self.out.lock().await = None;
    }

    /// Drive one established connection until it ends. The join message is
    /// sent first; the server's `game-state` reply is the resync.
    async fn drive(&self, ws: WsStream) -> CloseKind {
        let (mut tx, mut rx) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        *self.out.lock().await = Some(out_tx);

        let join = ClientEnvelope::new(
            ClientMsg::JoinGame {
                therapy_session_id: self.session_id.clone(),
                role: self.role,
            },
            self.role,
        );
        let Ok(json) = serde_json::to_string(&join) else {
            return CloseKind::Abnormal;
        };
        if tx.send(Message::Text(json)).await.is_err() {
            return CloseKind::Abnormal;
        }

        loop {
            tokio::select! {
                queued = out_rx.recv() => match queued {
                    Some(msg) => {
                        let envelope = ClientEnvelope::new(msg, self.role);
                        let Ok(json) = serde_json::to_string(&envelope) else { continue };
                        if tx.send(Message::Text(json)).await.is_err() {
                            return CloseKind::Abnormal;
                        }
                    }
                    None => {
                        let _ = tx.send(Message::Close(None)).await;
                        return CloseKind::User;
                    }
                },
                incoming = rx.next() => match incoming {
                    Some(Ok(Message::Text(text))) => self.dispatch(&text),
                    Some(Ok(Message::Close(frame))) => {
                        if self.user_closed.load(Ordering::SeqCst) {
                            return CloseKind::User;
                        }
                        if let Some(frame) = frame {
                            let code = u16::from(frame.code);
                            if close::is_policy(code) {
                                return CloseKind::Policy(code);
                            }
                        }
                        return CloseKind::Abnormal;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(_)) | None => {
                        return if self.user_closed.load(Ordering::SeqCst) {
                            CloseKind::User
                        } else {
                            CloseKind::Abnormal
                        };
                    }
                },
            }
        }
    }

    fn dispatch(&self, text: &str) {
        let envelope: ServerEnvelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!("unparseable server message: {}", err);
                return;
            }
        };
        if let ServerMsg::GameState(snapshot) = &envelope.msg {
            *self.latest.lock().unwrap() = Some(snapshot.clone());
        }
        let handlers = self.handlers.lock().unwrap();
        if let Some(list) = handlers.get(envelope.msg.type_name()) {
            for handler in list {
                handler(&envelope.msg);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        let mut backoff = BackoffState::default();
        let mut delays = Vec::new();
        while let Some(delay) = backoff.next_delay_and_advance() {
            delays.push(delay);
        }
        assert_eq!(delays, vec![250, 500, 1000, 2000, 4000]);
        assert!(backoff.is_exhausted());
    }

    #[test]
    fn backoff_reset_restores_the_initial_delay() {
        let mut backoff = BackoffState::default();
        backoff.next_delay_and_advance();
        backoff.next_delay_and_advance();
        backoff.reset();
        assert_eq!(backoff.next_delay_and_advance(), Some(250));
    }
}
