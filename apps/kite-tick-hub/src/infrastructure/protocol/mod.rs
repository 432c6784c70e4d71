//! Downstream Client Protocol
//!
//! JSON messages exchanged with clients on `/ws/ticks`.
//!
//! # Client -> Server
//!
//! ```json
//! {"action":"subscribe","tokens":[256265,738561]}
//! {"action":"unsubscribe","tokens":[738561]}
//! {"action":"pong"}
//! ```
//!
//! # Server -> Client
//!
//! ```json
//! {"type":"connected"}
//! {"type":"subscribed","tokens":[256265]}
//! {"type":"ticks","data":[{"instrument_token":256265,"symbol":"NIFTY 50",...}]}
//! {"type":"ping"}
//! {"type":"error","message":"invalid instrument token: -5"}
//! ```

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::streaming::{InstrumentToken, Ohlc, Tick};

// =============================================================================
// Client Commands
// =============================================================================

/// Command sent by a client.
///
/// Tokens are accepted as signed integers so that negative or oversized
/// values reach validation instead of failing to parse.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ClientCommand {
    /// Add instruments to the client's subscription.
    Subscribe {
        /// Requested tokens.
        tokens: Vec<i64>,
    },
    /// Remove instruments from the client's subscription.
    Unsubscribe {
        /// Tokens to drop.
        tokens: Vec<i64>,
    },
    /// Reply to a server ping.
    Pong,
    /// Client-initiated keepalive.
    Ping,
}

impl ClientCommand {
    /// Parse a text frame.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed JSON, unknown actions or tokens that
    /// are not integers.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

// =============================================================================
// Server Messages
// =============================================================================

/// Message sent to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Session accepted.
    Connected,
    /// Subscription acknowledged.
    Subscribed {
        /// Tokens the client is now subscribed to from this request.
        tokens: Vec<InstrumentToken>,
    },
    /// Unsubscription acknowledged.
    Unsubscribed {
        /// Tokens removed by this request.
        tokens: Vec<InstrumentToken>,
    },
    /// One or more ticks.
    Ticks {
        /// Ticks in upstream order.
        data: Vec<TickPayload>,
    },
    /// Keepalive probe; clients answer with `{"action":"pong"}`.
    Ping,
    /// A command was rejected.
    Error {
        /// Reason for the rejection.
        message: String,
    },
}

impl ServerMessage {
    /// Error message with the given reason.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Serialize to a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Tick as delivered to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickPayload {
    /// Instrument token.
    pub instrument_token: InstrumentToken,
    /// Trading symbol, empty if unknown.
    pub symbol: String,
    /// Last traded price.
    #[serde(with = "rust_decimal::serde::float")]
    pub last_price: Decimal,
    /// Percentage change against the previous close.
    #[serde(with = "rust_decimal::serde::float")]
    pub change: Decimal,
    /// Cumulative volume.
    pub volume: u64,
    /// OHLC snapshot.
    pub ohlc: Ohlc,
    /// Exchange timestamp if known, else receipt time.
    pub timestamp: DateTime<Utc>,
}

impl TickPayload {
    /// Format `tick` for clients.
    #[must_use]
    pub fn from_tick(tick: &Tick, symbol: &str) -> Self {
        Self {
            instrument_token: tick.instrument_token,
            symbol: symbol.to_string(),
            last_price: tick.last_price,
            change: tick.change,
            volume: tick.volume,
            ohlc: tick.ohlc,
            timestamp: tick.display_timestamp(),
        }
    }
}
