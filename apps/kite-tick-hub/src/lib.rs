#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::cast_possible_truncation
    )
)]

//! Kite Tick Hub - Market Data Fan-out
//!
//! Maintains one connection to the Zerodha Kite ticker and fans live ticks
//! out to any number of WebSocket clients, each subscribed to its own set
//! of instruments.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core types with no I/O
//!   - `streaming`: instrument tokens, ticks, segments
//!   - `subscription`: client interest and the required upstream set
//!   - `cache`: last tick per instrument
//!
//! - **Application**: Port definitions and the ingestion service
//!   - `ports`: feed control, tick sink, credential provider
//!   - `services`: connector-to-broadcaster ingestion loop
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `kite`: ticker connector, binary codec, credentials
//!   - `broadcast`: fan-out to client queues
//!   - `server`: client WebSocket and ticker admin routes
//!   - `config`, `health`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//!                                                   +--> Client 1
//! Kite ticker --> FeedConnector --> ingestion --> Broadcaster --> Client 2
//!                      ^                             |    +--> Client N
//!                      +------ subscribe deltas -----+
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core streaming types with no external dependencies.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::cache::TickCache;
pub use domain::streaming::{InstrumentToken, Tick, TickBatch, TickMode};
pub use domain::subscription::{ClientId, SubscriptionRegistry, SubscriptionStats, TokenDelta};

// Ports and services
pub use application::ports::{
    AccessCredential, CredentialError, CredentialProvider, FeedControl, TickSink,
};
pub use application::services::run_ingestion;

// Infrastructure config
pub use infrastructure::config::{
    ClientSettings, ConfigError, FeedSettings, HubConfig, InstrumentDirectory, ServerSettings,
};

// Upstream feed
pub use infrastructure::kite::{
    ConnectionState, EnvCredentialProvider, FeedConnector, FeedError, FeedStatus,
    StaticCredentialProvider,
};

// Fan-out
pub use infrastructure::broadcast::{
    ADMIN_CLIENT, ClientSession, FanoutBroadcaster, HubError, HubStats,
};
pub use infrastructure::protocol::{ClientCommand, ServerMessage, TickPayload};

// Servers
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};
pub use infrastructure::server::{AppState, ServerError, TickHubServer};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
