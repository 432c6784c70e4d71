//! Prometheus Metrics Module
//!
//! Exposes hub metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Ticks**: ticks received upstream and messages sent to clients
//! - **Clients**: connected clients and clients shed for being slow
//! - **Feed**: connection state, reconnects and errors
//! - **Latency**: time from frame decode to delivery
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Safe to call more than once; later calls return the same handle.
///
/// # Panics
///
/// Panics if another global recorder was already installed.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "tick_hub_ticks_received_total",
        "Total ticks decoded from the upstream feed"
    );
    describe_counter!(
        "tick_hub_messages_sent_total",
        "Total messages queued to downstream clients"
    );
    describe_counter!(
        "tick_hub_clients_shed_total",
        "Clients disconnected because their queue was full or closed"
    );

    describe_gauge!("tick_hub_clients", "Number of connected downstream clients");
    describe_gauge!(
        "tick_hub_required_tokens",
        "Number of instruments requested upstream"
    );
    describe_gauge!(
        "tick_hub_feed_connected",
        "1 when the upstream feed is connected, else 0"
    );

    describe_counter!(
        "tick_hub_feed_errors_total",
        "Upstream feed errors by type"
    );
    describe_counter!(
        "tick_hub_reconnects_total",
        "Upstream reconnection attempts"
    );

    describe_histogram!(
        "tick_hub_ingest_seconds",
        "Time to cache and fan out one tick batch"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Reason a client was shed by the broadcaster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShedReason {
    /// Outbound queue was full.
    QueueFull,
    /// Outbound receiver was dropped.
    Closed,
}

impl ShedReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::QueueFull => "queue_full",
            Self::Closed => "closed",
        }
    }
}

/// Record ticks decoded from one upstream frame.
pub fn record_ticks_received(count: u64) {
    counter!("tick_hub_ticks_received_total").increment(count);
}

/// Record messages queued to downstream clients.
pub fn record_messages_sent(count: u64) {
    counter!("tick_hub_messages_sent_total").increment(count);
}

/// Record a client being shed.
pub fn record_client_shed(reason: ShedReason) {
    counter!(
        "tick_hub_clients_shed_total",
        "reason" => reason.as_str()
    )
    .increment(1);
}

/// Update the connected client count.
#[allow(clippy::cast_precision_loss)]
pub fn set_clients(count: usize) {
    gauge!("tick_hub_clients").set(count as f64);
}

/// Update the number of tokens requested upstream.
#[allow(clippy::cast_precision_loss)]
pub fn set_required_tokens(count: usize) {
    gauge!("tick_hub_required_tokens").set(count as f64);
}

/// Update the feed connection flag.
pub fn set_feed_connected(connected: bool) {
    gauge!("tick_hub_feed_connected").set(if connected { 1.0 } else { 0.0 });
}

/// Record an upstream feed error.
pub fn record_feed_error(error_type: &'static str) {
    counter!(
        "tick_hub_feed_errors_total",
        "error_type" => error_type
    )
    .increment(1);
}

/// Record an upstream reconnection attempt.
pub fn record_reconnect() {
    counter!("tick_hub_reconnects_total").increment(1);
}

/// Record the time taken to ingest one batch.
pub fn record_ingest_duration(duration: Duration) {
    histogram!("tick_hub_ingest_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================
