//! Kite Ticker Integration
//!
//! Upstream market data from the Zerodha Kite ticker.
//!
//! # Modules
//!
//! - `auth`: credential handling and handshake rejection
//! - `codec`: binary tick packet decoding
//! - `connector`: connection lifecycle and subscription reconciliation
//! - `messages`: JSON control messages
//! - `reconnect`: exponential backoff

pub mod auth;
pub mod codec;
pub mod connector;
pub mod messages;
pub mod reconnect;

pub use auth::{AuthError, EnvCredentialProvider, StaticCredentialProvider};
pub use codec::{CodecError, decode_frame};
pub use connector::{ConnectionState, FeedConnector, FeedError, FeedStatus};
pub use reconnect::{Backoff, BackoffConfig};
