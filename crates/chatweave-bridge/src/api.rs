//! Generic HTTP API adapter.
//!
//! The one in-tree backend. It exposes a small HTTP surface instead of
//! speaking a chat protocol:
//!
//! - `POST /api/message` — inject an envelope into the relay
//! - `GET  /api/messages` — drain the buffer of relayed messages
//! - `GET  /api/stream`  — newline-delimited JSON live stream
//!
//! Relayed messages are buffered in a bounded ring; `send` never produces
//! a durable message ID. An optional static bearer token guards all
//! routes.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use chatweave_types::{ChatweaveError, Envelope, EventKind, Result};

use crate::{lock_poisoned, Adapter, AdapterContext};
use chatweave_types::config::ChannelInfo;

/// Buffer size when the section sets none.
const DEFAULT_BUFFER: usize = 1000;

/// Capacity of the live-stream fanout channel.
const STREAM_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Factory registered under the `api` protocol name.
pub fn new_adapter(ctx: AdapterContext) -> Result<Box<dyn Adapter>> {
    Ok(Box::new(ApiAdapter::from_context(ctx)?))
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ApiAdapter {
    bind_address: String,
    state: Arc<ApiState>,
    server: StdMutex<Option<tokio::task::JoinHandle<()>>>,
    local_addr: StdMutex<Option<SocketAddr>>,
}

#[derive(Debug)]
struct ApiState {
    account: String,
    token: String,
    capacity: usize,
    buffer: StdMutex<VecDeque<Envelope>>,
    stream_tx: broadcast::Sender<Envelope>,
    ingress: mpsc::Sender<Envelope>,
}

impl ApiAdapter {
    /// Builds the adapter from its factory context.
    pub fn from_context(ctx: AdapterContext) -> Result<Self> {
        if ctx.config.bind_address.is_empty() {
            return Err(ChatweaveError::Config {
                reason: format!("[{}] requires BindAddress", ctx.account),
            });
        }
        let capacity = match ctx.config.buffer {
            Some(0) | None => DEFAULT_BUFFER,
            Some(n) => n,
        };
        let (stream_tx, _) = broadcast::channel(STREAM_CAPACITY);
        Ok(Self {
            bind_address: ctx.config.bind_address.clone(),
            state: Arc::new(ApiState {
                account: ctx.account,
                token: ctx.config.token.clone(),
                capacity,
                buffer: StdMutex::new(VecDeque::with_capacity(capacity.min(1024))),
                stream_tx,
                ingress: ctx.ingress,
            }),
            server: StdMutex::new(None),
            local_addr: StdMutex::new(None),
        })
    }

    /// The bound listen address, available after `connect`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.lock().ok().and_then(|addr| *addr)
    }

    fn router(state: Arc<ApiState>) -> Router {
        Router::new()
            .route("/api/messages", get(get_messages))
            .route("/api/message", post(post_message))
            .route("/api/stream", get(get_stream))
            .with_state(state)
    }
}

#[async_trait]
impl Adapter for ApiAdapter {
    async fn connect(&self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.bind_address)
            .await
            .map_err(|e| ChatweaveError::Transport {
                reason: format!("bind {} failed: {e}", self.bind_address),
            })?;
        let addr = listener.local_addr().map_err(|e| ChatweaveError::Transport {
            reason: format!("local_addr failed: {e}"),
        })?;
        *self
            .local_addr
            .lock()
            .map_err(|_| lock_poisoned("listen address"))? = Some(addr);

        let app = Self::router(self.state.clone());
        let account = self.state.account.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(account = %account, error = %e, "api server exited");
            }
        });
        *self
            .server
            .lock()
            .map_err(|_| lock_poisoned("server handle"))? = Some(handle);

        tracing::info!(account = %self.state.account, listen = %addr, "api adapter listening");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(handle) = self
            .server
            .lock()
            .map_err(|_| lock_poisoned("server handle"))?
            .take()
        {
            handle.abort();
        }
        Ok(())
    }

    async fn join_channel(&self, _channel: &ChannelInfo) -> Result<()> {
        // The api surface has a single implicit channel.
        Ok(())
    }

    async fn send(&self, msg: &Envelope) -> Result<String> {
        // Deletes have nothing to act on in a drain-style buffer.
        if msg.event == EventKind::MsgDelete {
            return Ok(String::new());
        }
        {
            let mut buffer = self
                .state
                .buffer
                .lock()
                .map_err(|_| lock_poisoned("api buffer"))?;
            if buffer.len() == self.state.capacity {
                buffer.pop_front();
            }
            buffer.push_back(msg.clone());
        }
        // Stream subscribers are best-effort; nobody listening is fine.
        let _ = self.state.stream_tx.send(msg.clone());
        Ok(String::new())
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Body accepted by `POST /api/message`.
#[derive(Debug, Deserialize)]
struct ApiMessage {
    text: String,
    username: String,
    #[serde(default)]
    userid: String,
    #[serde(default)]
    avatar: String,
    #[serde(default)]
    gateway: String,
}

fn authorized(state: &ApiState, headers: &HeaderMap) -> bool {
    if state.token.is_empty() {
        return true;
    }
    let expected = format!("Bearer {}", state.token);
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false)
}

async fn get_messages(State(state): State<Arc<ApiState>>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let drained: Vec<Envelope> = match state.buffer.lock() {
        Ok(mut buffer) => buffer.drain(..).collect(),
        Err(_) => {
            tracing::error!(account = %state.account, "api buffer lock poisoned");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    Json(drained).into_response()
}

async fn post_message(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(payload): Json<ApiMessage>,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let env = Envelope {
        text: payload.text,
        username: payload.username,
        user_id: payload.userid,
        avatar: payload.avatar,
        gateway: payload.gateway,
        account: state.account.clone(),
        protocol: "api".into(),
        channel: "api".into(),
        ..Envelope::default()
    };
    if state.ingress.send(env).await.is_err() {
        tracing::warn!(account = %state.account, "ingress closed, api message dropped");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    StatusCode::OK.into_response()
}

async fn get_stream(State(state): State<Arc<ApiState>>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let stream = BroadcastStream::new(state.stream_tx.subscribe()).filter_map(|item| {
        // Lagged subscribers just skip; the stream stays alive.
        let env = item.ok()?;
        let mut line = serde_json::to_string(&env).ok()?;
        line.push('\n');
        Some(Ok::<String, std::convert::Infallible>(line))
    });
    Response::builder()
        .header("content-type", "application/x-ndjson")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chatweave_types::config::{AdapterConfig, GeneralConfig};

    fn adapter_with(buffer: Option<usize>, token: &str) -> (ApiAdapter, mpsc::Receiver<Envelope>) {
        let (ingress, rx) = mpsc::channel(16);
        let adapter = ApiAdapter::from_context(AdapterContext {
            account: "api.local".into(),
            protocol: "api".into(),
            name: "local".into(),
            config: AdapterConfig {
                bind_address: "127.0.0.1:0".into(),
                token: token.into(),
                buffer,
                ..AdapterConfig::default()
            },
            general: GeneralConfig::default(),
            ingress,
        })
        .expect("api adapter");
        (adapter, rx)
    }

    #[test]
    fn missing_bind_address_rejected() {
        let (ingress, _rx) = mpsc::channel(1);
        let err = ApiAdapter::from_context(AdapterContext {
            account: "api.local".into(),
            protocol: "api".into(),
            name: "local".into(),
            config: AdapterConfig::default(),
            general: GeneralConfig::default(),
            ingress,
        })
        .unwrap_err();
        assert!(err.to_string().contains("BindAddress"));
    }

    #[tokio::test]
    async fn send_buffers_and_evicts_oldest() -> Result<()> {
        let (adapter, _rx) = adapter_with(Some(2), "");
        for i in 0..3 {
            let env = Envelope {
                text: format!("m{i}"),
                ..Envelope::default()
            };
            // The api surface produces no durable IDs.
            assert_eq!(adapter.send(&env).await?, "");
        }
        let texts: Vec<String> = adapter
            .state
            .buffer
            .lock()
            .expect("buffer")
            .iter()
            .map(|e| e.text.clone())
            .collect();
        assert_eq!(texts, vec!["m1".to_string(), "m2".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn delete_events_ignored() -> Result<()> {
        let (adapter, _rx) = adapter_with(None, "");
        let env = Envelope {
            event: EventKind::MsgDelete,
            id: "X-1".into(),
            ..Envelope::default()
        };
        assert_eq!(adapter.send(&env).await?, "");
        assert!(adapter.state.buffer.lock().expect("buffer").is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn post_message_reaches_ingress() -> Result<()> {
        let (adapter, mut rx) = adapter_with(None, "hunter2");
        adapter.connect().await?;
        let addr = adapter.local_addr().expect("bound");

        let client = reqwest::Client::new();
        let url = format!("http://{addr}/api/message");

        // Without the token the request is refused.
        let resp = client
            .post(&url)
            .json(&serde_json::json!({"text": "hi", "username": "alice"}))
            .send()
            .await
            .expect("request");
        assert_eq!(resp.status().as_u16(), 401);

        let resp = client
            .post(&url)
            .header("authorization", "Bearer hunter2")
            .json(&serde_json::json!({"text": "hi", "username": "alice"}))
            .send()
            .await
            .expect("request");
        assert_eq!(resp.status().as_u16(), 200);

        let env = rx.recv().await.expect("envelope");
        assert_eq!(env.text, "hi");
        assert_eq!(env.username, "alice");
        assert_eq!(env.account, "api.local");
        assert_eq!(env.protocol, "api");
        assert_eq!(env.channel, "api");

        adapter.disconnect().await?;
        Ok(())
    }
}
