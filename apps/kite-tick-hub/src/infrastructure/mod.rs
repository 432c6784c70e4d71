//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Kite ticker connection, codec and credentials.
pub mod kite;

/// Fan-out of tick batches to client queues.
pub mod broadcast;

/// Configuration loading.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Connection liveness tracking.
pub mod heartbeat;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Downstream client JSON protocol.
pub mod protocol;

/// Client WebSocket and ticker admin server.
pub mod server;

/// Logging and OpenTelemetry tracing setup.
pub mod telemetry;
