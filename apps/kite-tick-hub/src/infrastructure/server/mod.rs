//! Client-Facing HTTP Server
//!
//! Serves the tick WebSocket and the ticker admin routes on one port.
//!
//! # Routes
//!
//! - `GET /ws/ticks` - WebSocket upgrade for tick streaming
//! - `POST /ticker/start` - Start the upstream feed
//! - `POST /ticker/stop` - Stop the upstream feed
//! - `POST /ticker/subscribe` - Pin a JSON array of tokens upstream
//! - `POST /ticker/unsubscribe` - Release pinned tokens
//! - `GET /ticker/status` - Feed and hub status
//! - `GET /ticker/ticks/{token}` - Last cached tick for an instrument

mod session;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::domain::streaming::InstrumentToken;
use crate::domain::subscription::TokenDelta;
use crate::infrastructure::broadcast::{ADMIN_CLIENT, FanoutBroadcaster, HubError};
use crate::infrastructure::config::ClientSettings;
use crate::infrastructure::kite::{ConnectionState, FeedConnector};

// =============================================================================
// Errors
// =============================================================================

/// Errors from the client server and its sessions.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),

    /// A message could not be encoded.
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    /// The client socket failed.
    #[error("client socket error: {0}")]
    Socket(#[from] axum::Error),

    /// A write did not complete in time.
    #[error("send timed out after {0:?}")]
    SendTimeout(Duration),
}

// =============================================================================
// State
// =============================================================================

/// Shared state for the client server.
pub struct AppState {
    hub: Arc<FanoutBroadcaster>,
    feed: Arc<FeedConnector>,
    client: ClientSettings,
}

impl AppState {
    /// Create server state.
    #[must_use]
    pub const fn new(
        hub: Arc<FanoutBroadcaster>,
        feed: Arc<FeedConnector>,
        client: ClientSettings,
    ) -> Self {
        Self { hub, feed, client }
    }
}

/// Body of `GET /ticker/status`.
#[derive(Debug, Clone, Serialize)]
pub struct TickerStatusResponse {
    /// Whether ticks are flowing.
    pub connected: bool,
    /// Tokens requested upstream.
    pub subscribed_tokens: Vec<InstrumentToken>,
    /// Tokens pinned through `/ticker/subscribe`.
    pub pinned_tokens: Vec<InstrumentToken>,
    /// Connected WebSocket clients.
    pub active_clients: usize,
    /// Feed state.
    pub state: ConnectionState,
    /// Stopped after repeated authentication failures.
    pub unauthenticated: bool,
    /// Most recent feed error.
    pub last_error: Option<String>,
    /// Reconnect attempts since the last successful handshake.
    pub reconnect_attempts: u32,
    /// Ticks received since startup.
    pub ticks_received: u64,
    /// Time of the last successful handshake.
    pub last_connected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct ControlResponse {
    changed: bool,
    state: ConnectionState,
}

#[derive(Debug, Serialize)]
struct PinResponse {
    success: bool,
    subscribed: Vec<InstrumentToken>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

// =============================================================================
// Server
// =============================================================================

/// HTTP server for clients and ticker control.
pub struct TickHubServer {
    port: u16,
    state: Arc<AppState>,
    cancel: CancellationToken,
}

impl TickHubServer {
    /// Create the server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<AppState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `ServerError` if binding fails or the HTTP server stops with
    /// an error.
    pub async fn run(self) -> Result<(), ServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Tick server listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| ServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Tick server stopped");
        Ok(())
    }
}

/// Routes served to clients.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws/ticks", get(ticks_ws_handler))
        .route("/ticker/start", post(start_handler))
        .route("/ticker/stop", post(stop_handler))
        .route("/ticker/subscribe", post(subscribe_handler))
        .route("/ticker/unsubscribe", post(unsubscribe_handler))
        .route("/ticker/status", get(status_handler))
        .route("/ticker/ticks/{token}", get(last_tick_handler))
        .with_state(state)
}

// =============================================================================
// Handlers
// =============================================================================

async fn ticks_ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| session::run(socket, state))
}

async fn start_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let changed = state.feed.start();
    Json(ControlResponse {
        changed,
        state: state.feed.status().state,
    })
}

async fn stop_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let changed = state.feed.stop();
    Json(ControlResponse {
        changed,
        state: state.feed.status().state,
    })
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<TickerStatusResponse> {
    let status = state.feed.status();
    Json(TickerStatusResponse {
        connected: status.is_connected(),
        subscribed_tokens: status.desired_tokens,
        pinned_tokens: state.hub.client_tokens(ADMIN_CLIENT).into_iter().collect(),
        active_clients: state.hub.active_clients(),
        state: status.state,
        unauthenticated: status.unauthenticated,
        last_error: status.last_error,
        reconnect_attempts: status.reconnect_attempts,
        ticks_received: status.ticks_received,
        last_connected_at: status.last_connected_at,
    })
}

async fn subscribe_handler(
    State(state): State<Arc<AppState>>,
    Json(tokens): Json<Vec<i64>>,
) -> Response {
    pin_response(state.hub.admin_subscribe(&tokens))
}

async fn unsubscribe_handler(
    State(state): State<Arc<AppState>>,
    Json(tokens): Json<Vec<i64>>,
) -> Response {
    pin_response(state.hub.admin_unsubscribe(&tokens))
}

fn pin_response(result: Result<TokenDelta, HubError>) -> Response {
    match result {
        Ok(required) => Json(PinResponse {
            success: true,
            subscribed: required.into_iter().collect(),
        })
        .into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

async fn last_tick_handler(
    State(state): State<Arc<AppState>>,
    Path(raw): Path<i64>,
) -> Response {
    let token = match InstrumentToken::try_from(raw) {
        Ok(token) => token,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };

    state.hub.last_tick(token).map_or_else(
        || error_response(StatusCode::NOT_FOUND, format!("no tick for {token}")),
        |tick| Json(tick).into_response(),
    )
}

fn error_response(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorResponse { error })).into_response()
}
