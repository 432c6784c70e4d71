//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the hub interacts with external systems.

/// Port interfaces for the upstream feed and credential source.
pub mod ports;

/// Application services (tick ingestion).
pub mod services;
