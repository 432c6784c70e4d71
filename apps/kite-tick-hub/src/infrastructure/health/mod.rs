//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, feed status reporting, and Prometheus
//! metrics. Served on its own port, separate from client traffic.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON health status
//! - `GET /healthz` - Liveness probe (simple OK)
//! - `GET /readyz` - Readiness probe (ready when the feed is connected)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::infrastructure::broadcast::{FanoutBroadcaster, HubStats};
use crate::infrastructure::kite::{ConnectionState, FeedConnector, FeedStatus};
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: HealthStatus,
    /// Hub version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Upstream feed status.
    pub feed: FeedInfo,
    /// Client and subscription counts.
    pub hub: HubStats,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Feed connected.
    Healthy,
    /// Feed connecting or reconnecting.
    Degraded,
    /// Feed stopped or unauthenticated.
    Unhealthy,
}

/// Upstream feed summary.
#[derive(Debug, Clone, Serialize)]
pub struct FeedInfo {
    /// Connection state.
    pub state: ConnectionState,
    /// Whether the feed is connected.
    pub connected: bool,
    /// Stopped after repeated authentication failures.
    pub unauthenticated: bool,
    /// Ticks received since startup.
    pub ticks_received: u64,
    /// Reconnect attempts since the last successful handshake.
    pub reconnect_attempts: u32,
}

impl From<&FeedStatus> for FeedInfo {
    fn from(status: &FeedStatus) -> Self {
        Self {
            state: status.state,
            connected: status.is_connected(),
            unauthenticated: status.unauthenticated,
            ticks_received: status.ticks_received,
            reconnect_attempts: status.reconnect_attempts,
        }
    }
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    feed: Arc<FeedConnector>,
    hub: Arc<FanoutBroadcaster>,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(version: String, feed: Arc<FeedConnector>, hub: Arc<FanoutBroadcaster>) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            feed,
            hub,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

/// Routes served by the health server.
pub fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    if state.feed.status().is_connected() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let feed = FeedInfo::from(&state.feed.status());

    HealthResponse {
        status: determine_health_status(&feed),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        feed,
        hub: state.hub.stats(),
    }
}

const fn determine_health_status(feed: &FeedInfo) -> HealthStatus {
    if feed.unauthenticated {
        return HealthStatus::Unhealthy;
    }
    match feed.state {
        ConnectionState::Connected => HealthStatus::Healthy,
        ConnectionState::Connecting | ConnectionState::Reconnecting => HealthStatus::Degraded,
        ConnectionState::Disconnected => HealthStatus::Unhealthy,
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    use super::*;
    use crate::application::ports::MockCredentialProvider;
    use crate::infrastructure::config::{ClientSettings, FeedSettings, InstrumentDirectory};

    fn feed_info(state: ConnectionState, unauthenticated: bool) -> FeedInfo {
        FeedInfo {
            state,
            connected: state == ConnectionState::Connected,
            unauthenticated,
            ticks_received: 0,
            reconnect_attempts: 0,
        }
    }

    fn state() -> Arc<HealthServerState> {
        let (tx, _rx) = mpsc::channel(1);
        let feed = Arc::new(FeedConnector::new(
            FeedSettings::default(),
            Arc::new(MockCredentialProvider::new()),
            tx,
            CancellationToken::new(),
        ));
        let hub = Arc::new(FanoutBroadcaster::new(
            feed.clone(),
            &ClientSettings::default(),
            InstrumentDirectory::default(),
        ));
        Arc::new(HealthServerState::new("0.1.0".to_string(), feed, hub))
    }

    async fn get(path: &str) -> (StatusCode, String) {
        let response = router(state())
            .oneshot(Request::get(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Degraded).unwrap(),
            "\"degraded\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
    }

    #[test]
    fn status_follows_feed_state() {
        assert_eq!(
            determine_health_status(&feed_info(ConnectionState::Connected, false)),
            HealthStatus::Healthy
        );
        assert_eq!(
            determine_health_status(&feed_info(ConnectionState::Reconnecting, false)),
            HealthStatus::Degraded
        );
        assert_eq!(
            determine_health_status(&feed_info(ConnectionState::Disconnected, false)),
            HealthStatus::Unhealthy
        );
        assert_eq!(
            determine_health_status(&feed_info(ConnectionState::Disconnected, true)),
            HealthStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn liveness_is_always_ok() {
        assert_eq!(get("/healthz").await, (StatusCode::OK, "OK".to_string()));
    }

    #[tokio::test]
    async fn not_ready_until_feed_connects() {
        let (status, body) = get("/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, "NOT READY");
    }

    #[tokio::test]
    async fn health_reports_stopped_feed() {
        let (status, body) = get("/health").await;
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(value["status"], "unhealthy");
        assert_eq!(value["feed"]["state"], "disconnected");
        assert_eq!(value["hub"]["clients"], 0);
    }
}
