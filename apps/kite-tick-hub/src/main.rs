//! Kite Tick Hub Binary
//!
//! Starts the ticker connector, the fan-out broadcaster and the HTTP
//! servers.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin kite-tick-hub
//! ```
//!
//! # Environment Variables
//!
//! ## Required (read at every ticker connect)
//! - `KITE_API_KEY`: Kite Connect API key
//! - `KITE_ACCESS_TOKEN`: Access token from the Kite login flow
//!
//! ## Optional
//! - `TICK_HUB_PORT`: Client WebSocket and admin port (default: 8000)
//! - `TICK_HUB_HEALTH_PORT`: Health check HTTP port (default: 8082)
//! - `KITE_TICKER_URL`: Ticker base URL (default: wss://ws.kite.trade)
//! - `KITE_TICKER_MODE`: ltp | quote | full (default: full)
//! - `TICK_HUB_AUTOSTART`: Connect at startup (default: true)
//! - `TICK_HUB_INSTRUMENTS`: `token:SYMBOL,...` symbol directory
//! - `OTEL_ENABLED`: Export spans over OTLP (default: false)
//! - `RUST_LOG`: Log filter (default: info)

use std::sync::Arc;
use std::time::Duration;

use kite_tick_hub::infrastructure::health::{HealthServer, HealthServerState};
use kite_tick_hub::infrastructure::server::{AppState, TickHubServer};
use kite_tick_hub::infrastructure::telemetry;
use kite_tick_hub::{
    EnvCredentialProvider, FanoutBroadcaster, FeedConnector, HubConfig, init_metrics,
    run_ingestion,
};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Upper bound on waiting for the feed and ingestion tasks at shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Kite Tick Hub");

    let _metrics_handle = init_metrics();

    let config = HubConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    // Connector -> ingestion channel
    let (tick_tx, tick_rx) = mpsc::channel(config.feed.tick_channel_capacity);

    let feed = Arc::new(FeedConnector::new(
        config.feed.clone(),
        Arc::new(EnvCredentialProvider::new()),
        tick_tx,
        shutdown_token.clone(),
    ));

    let hub = Arc::new(FanoutBroadcaster::new(
        Arc::clone(&feed) as _,
        &config.client,
        config.instruments.clone(),
    ));

    let ingestion = tokio::spawn(run_ingestion(
        tick_rx,
        Arc::clone(&hub) as _,
        shutdown_token.clone(),
    ));

    // Health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&feed),
        Arc::clone(&hub),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    // Client server
    let app_state = Arc::new(AppState::new(
        Arc::clone(&hub),
        Arc::clone(&feed),
        config.client.clone(),
    ));
    let tick_server = TickHubServer::new(config.server.port, app_state, shutdown_token.clone());
    tokio::spawn(async move {
        if let Err(e) = tick_server.run().await {
            tracing::error!(error = %e, "Tick server error");
        }
    });

    if config.feed.autostart {
        feed.start();
    }

    tracing::info!("Tick hub ready");

    await_shutdown(shutdown_token).await;

    let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        feed.shutdown().await;
        ingestion.await
    })
    .await;
    match drained {
        Ok(Ok(batches)) => tracing::info!(batches, "Ingestion drained"),
        Ok(Err(e)) => tracing::warn!(error = %e, "Ingestion task failed"),
        Err(_) => tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Shutdown timed out"
        ),
    }

    tracing::info!("Tick hub stopped");
    Ok(())
}

/// Log the parsed configuration.
fn log_config(config: &HubConfig) {
    tracing::info!(
        port = config.server.port,
        health_port = config.server.health_port,
        ticker_url = %config.feed.url,
        mode = config.feed.mode.as_str(),
        autostart = config.feed.autostart,
        instruments = config.instruments.len(),
        "Configuration loaded"
    );
    tracing::debug!(
        queue_capacity = config.client.queue_capacity,
        idle_timeout_secs = config.client.idle_timeout.as_secs(),
        max_auth_failures = config.feed.max_auth_failures,
        "Tuning"
    );
}

/// Load .env from the working directory or the nearest ancestor.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
}
