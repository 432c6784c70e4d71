//! Domain Layer - Core market data types and pure state.
//!
//! This layer contains the tick model, the subscription registry and the
//! tick cache. Nothing here performs I/O or takes a lock; the fan-out
//! broadcaster serializes access to the mutable structures.

/// Last-known tick per instrument.
pub mod cache;

/// Instrument tokens and ticks.
pub mod streaming;

/// Client interest tracking and upstream deltas.
pub mod subscription;
