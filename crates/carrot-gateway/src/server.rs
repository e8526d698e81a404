//! Gateway server: axum HTTP surface with the WebSocket upgrade path

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use carrot_core::{CarrotError, Frame, HubConfig, HubHandle, Request, SessionToken};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt, future};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::auth::{self, Credentials};

/// Listen address and shared-secret gate
#[derive(Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub secret: String,
    /// Reject upgrades whose presented secret does not match `secret`
    #[serde(default)]
    pub require_secret: bool,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("bind", &self.bind)
            .field("secret", &auth::mask_secret(&self.secret))
            .field("require_secret", &self.require_secret)
            .finish()
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            secret: String::new(),
            require_secret: false,
        }
    }
}

impl GatewayConfig {
    /// The secret to enforce, or `None` when the gate is off
    pub fn enforced_secret(&self) -> Option<&str> {
        if self.require_secret && !self.secret.is_empty() {
            Some(&self.secret)
        } else {
            None
        }
    }
}

/// Shared state for every request
#[derive(Clone)]
pub struct GatewayState {
    pub hub: HubHandle,
    pub ingress: mpsc::Sender<Request>,
    pub hub_config: Arc<HubConfig>,
    pub secret: Option<String>,
    pub start_time: std::time::Instant,
    pub started_at: DateTime<Utc>,
}

/// The gateway server
pub struct GatewayServer {
    state: GatewayState,
    bind: String,
}

impl GatewayServer {
    pub fn new(
        config: GatewayConfig,
        hub: HubHandle,
        ingress: mpsc::Sender<Request>,
        hub_config: Arc<HubConfig>,
    ) -> Self {
        if config.require_secret && config.secret.is_empty() {
            warn!("require_secret is set but no secret is configured; the gate stays off");
        }
        let state = GatewayState {
            hub,
            ingress,
            hub_config,
            secret: config.enforced_secret().map(str::to_string),
            start_time: std::time::Instant::now(),
            started_at: Utc::now(),
        };
        Self {
            state,
            bind: config.bind,
        }
    }

    /// Build the Axum router
    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/api/status", get(status_handler))
            .route("/", get(crate::home::index_handler))
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Bind the configured address and serve until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let addr: SocketAddr = self
            .bind
            .parse()
            .with_context(|| format!("Invalid listen address '{}'", self.bind))?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        self.serve(listener, cancel).await
    }

    /// Serve on an already bound listener until `cancel` fires
    pub async fn serve(self, listener: TcpListener, cancel: CancellationToken) -> anyhow::Result<()> {
        let router = self.router();
        info!("Gateway listening on {}", listener.local_addr()?);

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;

        info!("Gateway stopped");
        Ok(())
    }

    /// Start the server in the background, returning a handle
    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move { self.run(cancel).await })
    }
}

// ── HTTP Handlers ──

async fn status_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": if state.hub.is_closed() { "stopping" } else { "ok" },
        "sessions": state.hub.session_count(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "started_at": state.started_at.to_rfc3339(),
    }))
}

// ── WebSocket Handler ──

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    let credentials = Credentials::from_request(&headers, query.get("token").map(String::as_str));

    if let Err(status) = check_secret(state.secret.as_deref(), &headers, &credentials) {
        warn!(%addr, status = status.as_u16(), error = %CarrotError::SecretMismatch, "rejecting upgrade");
        return status.into_response();
    }

    debug!(%addr, requested = ?credentials.token, "WebSocket upgrade");
    let max_message_size = state.hub_config.max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_ws(socket, state, credentials.token, addr))
        .into_response()
}

/// 401 when the gate is on and no credentials came with the request, 403
/// when they came with the wrong secret.
fn check_secret(
    secret: Option<&str>,
    headers: &HeaderMap,
    credentials: &Credentials,
) -> Result<(), StatusCode> {
    let Some(secret) = secret else {
        return Ok(());
    };
    if !headers.contains_key("authorization") {
        return Err(StatusCode::UNAUTHORIZED);
    }
    if auth::validate_secret(secret, &credentials.secret) {
        Ok(())
    } else {
        Err(StatusCode::FORBIDDEN)
    }
}

async fn handle_ws(
    socket: WebSocket,
    state: GatewayState,
    requested: Option<SessionToken>,
    addr: SocketAddr,
) {
    let (ws_sender, ws_receiver) = socket.split();
    let sink = ws_sender.with(|frame: Frame| future::ready(Ok::<_, axum::Error>(to_message(frame))));
    let stream = ws_receiver.map(|msg| msg.map(to_frame));

    match carrot_core::serve(
        sink,
        stream,
        requested,
        state.hub,
        state.ingress,
        state.hub_config,
    )
    .await
    {
        Ok(token) => info!(%addr, session_token = %token, "WebSocket closed"),
        Err(e) => warn!(%addr, error = %e, "WebSocket rejected"),
    }
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Ping(data) => Message::Ping(data.into()),
        Frame::Pong(data) => Message::Pong(data.into()),
        Frame::Close => Message::Close(None),
    }
}

fn to_frame(msg: Message) -> Frame {
    match msg {
        Message::Text(text) => Frame::Text(text.as_str().to_string()),
        Message::Binary(data) => Frame::Text(String::from_utf8_lossy(&data).into_owned()),
        Message::Ping(data) => Frame::Ping(data.to_vec()),
        Message::Pong(data) => Frame::Pong(data.to_vec()),
        Message::Close(_) => Frame::Close,
    }
}
