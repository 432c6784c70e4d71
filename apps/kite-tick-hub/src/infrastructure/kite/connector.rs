//! Kite Feed Connector
//!
//! Owns the single upstream connection to the Kite ticker.
//!
//! # State Machine
//!
//! ```text
//! Disconnected --start()--> Connecting --handshake ok--> Connected
//!                               ^    \                       |
//!                               |     handshake failed       | transport error
//!                               |          v                 v
//!                               +----- Reconnecting <--------+
//! ```
//!
//! `stop()` moves any state to `Disconnected`. Repeated authentication
//! failures end the loop with the `unauthenticated` flag set until the
//! next `start()`.
//!
//! # Subscriptions
//!
//! The desired token set is updated through [`FeedControl`] in any state.
//! The receive loop keeps the set it last sent on the live connection and
//! sends only the difference on every change notification. A new connection
//! starts from an empty sent set, so the whole desired set is re-issued.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::auth::{AuthError, rejection_status, ticker_url};
use super::codec::{decode_frame, is_heartbeat};
use super::messages::{TickerMessage, TickerRequest, describe_error};
use super::reconnect::{Backoff, BackoffConfig};
use crate::application::ports::{CredentialError, CredentialProvider, FeedControl};
use crate::domain::streaming::{InstrumentToken, TickBatch};
use crate::infrastructure::config::FeedSettings;
use crate::infrastructure::heartbeat::{Heartbeat, HeartbeatConfig, HeartbeatEvent};
use crate::infrastructure::metrics;

type FeedSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type FeedWriter = SplitSink<FeedSocket, Message>;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that end one upstream connection.
#[derive(Debug, Error)]
pub enum FeedError {
    /// The credential was missing or rejected.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The credential provider could not be reached.
    #[error(transparent)]
    CredentialUnavailable(CredentialError),

    /// WebSocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// The ticker closed the connection.
    #[error("connection closed by ticker")]
    ConnectionClosed,

    /// No inbound traffic after a ping.
    #[error("no traffic from ticker for {0:?}")]
    HeartbeatTimeout(Duration),

    /// The configured ticker URL is not usable.
    #[error("invalid ticker url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// A control request could not be encoded.
    #[error("failed to encode ticker request: {0}")]
    Encode(#[from] serde_json::Error),

    /// The ingestion task is gone.
    #[error("tick channel closed")]
    TickChannelClosed,
}

impl FeedError {
    /// Metric label for this error.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth",
            Self::CredentialUnavailable(_) => "credential_unavailable",
            Self::WebSocket(_) => "websocket",
            Self::InvalidUrl(_) => "invalid_url",
            Self::ConnectionClosed => "closed",
            Self::HeartbeatTimeout(_) => "heartbeat_timeout",
            Self::Encode(_) => "encode",
            Self::TickChannelClosed => "tick_channel",
        }
    }
}

// =============================================================================
// Status
// =============================================================================

/// Connection state of the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not running.
    #[default]
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Streaming ticks.
    Connected,
    /// Waiting out the backoff delay.
    Reconnecting,
}

impl ConnectionState {
    /// Returns the string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }
}

/// Point-in-time view of the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedStatus {
    /// Current state.
    pub state: ConnectionState,
    /// The loop stopped after repeated authentication failures.
    pub unauthenticated: bool,
    /// Most recent error reported by or about the ticker.
    pub last_error: Option<String>,
    /// Reconnect attempts since the last successful handshake.
    pub reconnect_attempts: u32,
    /// Ticks decoded since startup.
    pub ticks_received: u64,
    /// Time of the last successful handshake.
    pub last_connected_at: Option<DateTime<Utc>>,
    /// Tokens requested upstream.
    pub desired_tokens: Vec<InstrumentToken>,
}

impl FeedStatus {
    /// Whether ticks are flowing.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

#[derive(Debug, Default)]
struct StatusState {
    // Bumped by start() and stop(); a loop only writes status for its own run.
    generation: u64,
    state: ConnectionState,
    unauthenticated: bool,
    last_error: Option<String>,
    reconnect_attempts: u32,
    ticks_received: u64,
    last_connected_at: Option<DateTime<Utc>>,
}

struct RunningLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

// =============================================================================
// Connector
// =============================================================================

/// Upstream connection to the Kite ticker.
pub struct FeedConnector {
    settings: FeedSettings,
    credentials: Arc<dyn CredentialProvider>,
    ticks: mpsc::Sender<TickBatch>,
    shutdown: CancellationToken,
    desired: RwLock<BTreeSet<InstrumentToken>>,
    changed: Notify,
    status: Mutex<StatusState>,
    running: Mutex<Option<RunningLoop>>,
}

impl std::fmt::Debug for FeedConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedConnector")
            .field("url", &self.settings.url)
            .field("mode", &self.settings.mode)
            .field("desired", &self.desired.read().len())
            .finish_non_exhaustive()
    }
}

impl FeedConnector {
    /// Create a stopped connector.
    ///
    /// Decoded batches are sent on `ticks`. Cancelling `shutdown` stops the
    /// receive loop for good.
    #[must_use]
    pub fn new(
        settings: FeedSettings,
        credentials: Arc<dyn CredentialProvider>,
        ticks: mpsc::Sender<TickBatch>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            settings,
            credentials,
            ticks,
            shutdown,
            desired: RwLock::new(BTreeSet::new()),
            changed: Notify::new(),
            status: Mutex::new(StatusState::default()),
            running: Mutex::new(None),
        }
    }

    /// Start the receive loop.
    ///
    /// Clears a previous `unauthenticated` status. Returns `false` if the
    /// loop was already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return false;
        }

        let generation = {
            let mut status = self.status.lock();
            status.generation += 1;
            status.state = ConnectionState::Connecting;
            status.unauthenticated = false;
            status.reconnect_attempts = 0;
            status.generation
        };

        tracing::info!(url = %self.settings.url, mode = self.settings.mode.as_str(), "Starting ticker feed");

        let cancel = self.shutdown.child_token();
        let handle = tokio::spawn(Arc::clone(self).run(generation, cancel.clone()));
        *running = Some(RunningLoop { cancel, handle });
        true
    }

    /// Start the loop unless it is running or stopped on authentication.
    pub fn ensure_started(self: &Arc<Self>) -> bool {
        if self.status.lock().unauthenticated {
            return false;
        }
        self.start()
    }

    /// Stop the receive loop. Idempotent.
    ///
    /// Returns `true` if a running loop was stopped.
    pub fn stop(&self) -> bool {
        let running = self.running.lock().take();
        {
            let mut status = self.status.lock();
            status.generation += 1;
            status.state = ConnectionState::Disconnected;
        }
        metrics::set_feed_connected(false);

        running.is_some_and(|r| {
            r.cancel.cancel();
            let was_running = !r.handle.is_finished();
            if was_running {
                tracing::info!("Ticker feed stopped");
            }
            was_running
        })
    }

    /// Stop the loop and wait for it to exit.
    pub async fn shutdown(&self) {
        let running = self.running.lock().take();
        self.stop();
        if let Some(r) = running {
            r.cancel.cancel();
            if let Err(e) = r.handle.await {
                tracing::warn!(error = %e, "Ticker feed task failed");
            }
        }
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> FeedStatus {
        let desired_tokens = self.desired_tokens();
        let status = self.status.lock();
        FeedStatus {
            state: status.state,
            unauthenticated: status.unauthenticated,
            last_error: status.last_error.clone(),
            reconnect_attempts: status.reconnect_attempts,
            ticks_received: status.ticks_received,
            last_connected_at: status.last_connected_at,
            desired_tokens,
        }
    }

    /// Tokens requested upstream, ascending.
    #[must_use]
    pub fn desired_tokens(&self) -> Vec<InstrumentToken> {
        self.desired.read().iter().copied().collect()
    }

    // -------------------------------------------------------------------------
    // Receive loop
    // -------------------------------------------------------------------------

    async fn run(self: Arc<Self>, generation: u64, cancel: CancellationToken) {
        let mut backoff = Backoff::new(BackoffConfig::from_feed_settings(&self.settings));
        let mut auth_failures = 0u32;

        loop {
            if cancel.is_cancelled() {
                break;
            }
            self.update_status(generation, |s| s.state = ConnectionState::Connecting);

            let result = tokio::select! {
                () = cancel.cancelled() => break,
                result = self.connect() => result,
            };

            let result = match result {
                Ok(socket) => {
                    auth_failures = 0;
                    backoff.reset();
                    self.on_connected(generation);
                    let result = self.stream(socket, generation, &cancel).await;
                    metrics::set_feed_connected(false);
                    result
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => break,
                Err(FeedError::TickChannelClosed) => {
                    tracing::info!("Tick channel closed, stopping ticker feed");
                    break;
                }
                Err(e) => {
                    metrics::record_feed_error(e.kind());
                    self.update_status(generation, |s| s.last_error = Some(e.to_string()));

                    if let FeedError::Auth(auth) = &e {
                        auth_failures += 1;
                        tracing::warn!(
                            error = %auth,
                            attempt = auth_failures,
                            max = self.settings.max_auth_failures,
                            "Ticker authentication failed"
                        );
                        if auth_failures >= self.settings.max_auth_failures {
                            tracing::error!(
                                failures = auth_failures,
                                "Giving up on ticker feed: unauthenticated"
                            );
                            self.update_status(generation, |s| s.unauthenticated = true);
                            break;
                        }
                    } else {
                        tracing::warn!(error = %e, "Ticker connection lost");
                    }
                }
            }

            let delay = backoff.next_delay();
            let attempt = backoff.attempts();
            self.update_status(generation, |s| {
                s.state = ConnectionState::Reconnecting;
                s.reconnect_attempts = attempt;
            });
            metrics::record_reconnect();
            tracing::info!(
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Reconnecting to ticker"
            );

            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.update_status(generation, |s| s.state = ConnectionState::Disconnected);
        tracing::debug!(generation, "Ticker feed loop exited");
    }

    async fn connect(&self) -> Result<FeedSocket, FeedError> {
        let credential = match self.credentials.access_credential().await {
            Ok(credential) => credential,
            // Retried like a transport failure; only a bad credential counts
            // towards the authentication limit.
            Err(e @ CredentialError::Unavailable(_)) => {
                return Err(FeedError::CredentialUnavailable(e));
            }
            Err(e) => return Err(AuthError::from(e).into()),
        };
        let url = ticker_url(&self.settings.url, &credential)?;

        tracing::info!(url = %self.settings.url, "Connecting to ticker");

        match tokio_tungstenite::connect_async(url).await {
            Ok((socket, _response)) => Ok(socket),
            Err(e) => match rejection_status(&e) {
                Some(status) => Err(AuthError::Rejected(status).into()),
                None => Err(e.into()),
            },
        }
    }

    fn on_connected(&self, generation: u64) {
        self.update_status(generation, |s| {
            s.state = ConnectionState::Connected;
            s.reconnect_attempts = 0;
            s.last_connected_at = Some(Utc::now());
        });
        metrics::set_feed_connected(true);
        tracing::info!("Ticker connected");
    }

    async fn stream(
        &self,
        socket: FeedSocket,
        generation: u64,
        cancel: &CancellationToken,
    ) -> Result<(), FeedError> {
        let (mut write, mut read) = socket.split();
        let mut sent = BTreeSet::new();

        let heartbeat_config = HeartbeatConfig::new(
            self.settings.heartbeat_interval,
            self.settings.heartbeat_timeout,
        );
        let mut heartbeat = Heartbeat::new(heartbeat_config);
        let mut poll = tokio::time::interval(heartbeat_config.poll_period());
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        self.reconcile(&mut write, &mut sent).await?;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                () = self.changed.notified() => {
                    self.reconcile(&mut write, &mut sent).await?;
                }
                _ = poll.tick() => {
                    match heartbeat.poll() {
                        Some(HeartbeatEvent::SendPing) => {
                            write.send(Message::Ping(Bytes::new())).await?;
                        }
                        Some(HeartbeatEvent::Timeout) => {
                            return Err(FeedError::HeartbeatTimeout(heartbeat.idle_for()));
                        }
                        None => {}
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Binary(frame))) => {
                            heartbeat.record_activity();
                            self.handle_binary(&frame, generation).await?;
                        }
                        Some(Ok(Message::Text(text))) => {
                            heartbeat.record_activity();
                            self.handle_text(&text, generation);
                        }
                        Some(Ok(Message::Ping(data))) => {
                            heartbeat.record_activity();
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            heartbeat.record_activity();
                        }
                        Some(Ok(Message::Close(frame))) => {
                            tracing::info!(frame = ?frame, "Ticker sent close frame");
                            return Err(FeedError::ConnectionClosed);
                        }
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => return Err(FeedError::ConnectionClosed),
                    }
                }
            }
        }
    }

    async fn handle_binary(&self, frame: &[u8], generation: u64) -> Result<(), FeedError> {
        if is_heartbeat(frame) {
            return Ok(());
        }

        let batch = match decode_frame(frame, Utc::now()) {
            Ok(batch) => batch,
            Err(e) => {
                tracing::warn!(error = %e, len = frame.len(), "Dropping malformed ticker frame");
                metrics::record_feed_error("codec");
                return Ok(());
            }
        };
        if batch.is_empty() {
            return Ok(());
        }

        let count = batch.len() as u64;
        metrics::record_ticks_received(count);
        self.update_status(generation, |s| s.ticks_received += count);

        self.ticks
            .send(batch)
            .await
            .map_err(|_| FeedError::TickChannelClosed)
    }

    fn handle_text(&self, text: &str, generation: u64) {
        match TickerMessage::parse(text) {
            Ok(TickerMessage::Error { data }) => {
                let message = describe_error(&data);
                tracing::warn!(error = %message, "Ticker reported error");
                metrics::record_feed_error("upstream");
                self.update_status(generation, |s| s.last_error = Some(message));
            }
            Ok(_) => tracing::trace!("Ignoring ticker text message"),
            Err(e) => tracing::debug!(error = %e, "Unparseable ticker text message"),
        }
    }

    async fn reconcile(
        &self,
        write: &mut FeedWriter,
        sent: &mut BTreeSet<InstrumentToken>,
    ) -> Result<(), FeedError> {
        let desired = self.desired.read().clone();
        let added: Vec<_> = desired.difference(sent).copied().collect();
        let removed: Vec<_> = sent.difference(&desired).copied().collect();

        if !added.is_empty() {
            tracing::debug!(count = added.len(), "Subscribing upstream");
            send_request(write, &TickerRequest::subscribe(&added)).await?;
            send_request(write, &TickerRequest::mode(self.settings.mode, &added)).await?;
        }
        if !removed.is_empty() {
            tracing::debug!(count = removed.len(), "Unsubscribing upstream");
            send_request(write, &TickerRequest::unsubscribe(&removed)).await?;
        }

        *sent = desired;
        Ok(())
    }

    fn update_status(&self, generation: u64, apply: impl FnOnce(&mut StatusState)) {
        let mut status = self.status.lock();
        if status.generation == generation {
            apply(&mut status);
        }
    }
}

async fn send_request(write: &mut FeedWriter, request: &TickerRequest) -> Result<(), FeedError> {
    write.send(Message::text(request.to_json()?)).await?;
    Ok(())
}

impl FeedControl for FeedConnector {
    fn subscribe(&self, tokens: &[InstrumentToken]) {
        let changed = {
            let mut desired = self.desired.write();
            tokens.iter().fold(false, |acc, t| desired.insert(*t) | acc)
        };
        if changed {
            self.changed.notify_one();
        }
    }

    fn unsubscribe(&self, tokens: &[InstrumentToken]) {
        let changed = {
            let mut desired = self.desired.write();
            tokens.iter().fold(false, |acc, t| desired.remove(t) | acc)
        };
        if changed {
            self.changed.notify_one();
        }
    }
}
