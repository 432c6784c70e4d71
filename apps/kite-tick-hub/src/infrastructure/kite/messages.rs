//! Kite Ticker Text Messages
//!
//! JSON control messages exchanged with the Kite ticker. Market data
//! itself arrives in binary frames (see [`super::codec`]).
//!
//! # Requests (client -> ticker)
//!
//! ```json
//! {"a":"subscribe","v":[256265,738561]}
//! {"a":"mode","v":["full",[256265,738561]]}
//! {"a":"unsubscribe","v":[738561]}
//! ```
//!
//! # Text Messages (ticker -> client)
//!
//! ```json
//! {"type":"error","data":"Invalid access token"}
//! {"type":"order","data":{...}}
//! ```

use serde::{Deserialize, Serialize};

use crate::domain::streaming::{InstrumentToken, TickMode};

// =============================================================================
// Requests
// =============================================================================

/// Control request sent to the ticker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "a", content = "v", rename_all = "lowercase")]
pub enum TickerRequest {
    /// Start streaming the given tokens.
    Subscribe(Vec<u32>),
    /// Stop streaming the given tokens.
    Unsubscribe(Vec<u32>),
    /// Set the streaming mode for the given tokens.
    Mode(TickMode, Vec<u32>),
}

impl TickerRequest {
    /// Subscribe request for `tokens`.
    #[must_use]
    pub fn subscribe(tokens: &[InstrumentToken]) -> Self {
        Self::Subscribe(raw(tokens))
    }

    /// Unsubscribe request for `tokens`.
    #[must_use]
    pub fn unsubscribe(tokens: &[InstrumentToken]) -> Self {
        Self::Unsubscribe(raw(tokens))
    }

    /// Mode request for `tokens`.
    #[must_use]
    pub fn mode(mode: TickMode, tokens: &[InstrumentToken]) -> Self {
        Self::Mode(mode, raw(tokens))
    }

    /// Serialize to the JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

fn raw(tokens: &[InstrumentToken]) -> Vec<u32> {
    tokens.iter().map(|token| token.get()).collect()
}

// =============================================================================
// Text Messages
// =============================================================================

/// Text message received from the ticker.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TickerMessage {
    /// Error reported by the ticker.
    Error {
        /// Error payload, usually a string.
        #[serde(default)]
        data: serde_json::Value,
    },
    /// Order postback; not used by the hub.
    Order {
        /// Order payload.
        #[serde(default)]
        data: serde_json::Value,
    },
    /// Broker message; not used by the hub.
    Message {
        /// Message payload.
        #[serde(default)]
        data: serde_json::Value,
    },
    /// Any other message type.
    #[serde(other)]
    Other,
}

impl TickerMessage {
    /// Parse a text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not a JSON object with a `type`.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Human-readable form of an error payload.
#[must_use]
pub fn describe_error(data: &serde_json::Value) -> String {
    match data {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => "unspecified ticker error".to_string(),
        other => other.to_string(),
    }
}
