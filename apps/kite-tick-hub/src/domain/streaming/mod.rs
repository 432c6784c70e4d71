//! Market Data Streaming Types
//!
//! Core domain types for market data: instrument tokens and ticks.
//! These types are codec-agnostic and represent the canonical
//! internal representation of a price update.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Instrument Token
// =============================================================================

/// Identifier of a tradable instrument; the unit of subscription.
///
/// Kite tokens are unsigned 32-bit integers whose low byte encodes the
/// exchange segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstrumentToken(u32);

impl InstrumentToken {
    /// Wrap a raw token value.
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw token value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Exchange segment encoded in the low byte.
    #[must_use]
    pub const fn segment(self) -> Segment {
        Segment::from_code((self.0 & 0xff) as u8)
    }
}

impl fmt::Display for InstrumentToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<i64> for InstrumentToken {
    type Error = InvalidToken;

    fn try_from(raw: i64) -> Result<Self, Self::Error> {
        match u32::try_from(raw) {
            Ok(0) | Err(_) => Err(InvalidToken(raw)),
            Ok(value) => Ok(Self(value)),
        }
    }
}

/// A value that is not a well-formed instrument token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid instrument token: {0}")]
pub struct InvalidToken(pub i64);

// =============================================================================
// Exchange Segment
// =============================================================================

/// Exchange segment of an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    /// NSE equity.
    Nse,
    /// NSE futures and options.
    Nfo,
    /// NSE currency derivatives.
    Cds,
    /// BSE equity.
    Bse,
    /// BSE futures and options.
    Bfo,
    /// BSE currency derivatives.
    Bcd,
    /// MCX commodities.
    Mcx,
    /// MCX-SX.
    Mcxsx,
    /// Indices (not tradable).
    Indices,
    /// Segment code not known to this build.
    Unknown(u8),
}

impl Segment {
    /// Map a segment code to a segment.
    #[must_use]
    pub const fn from_code(code: u8) -> Self {
        match code {
            1 => Self::Nse,
            2 => Self::Nfo,
            3 => Self::Cds,
            4 => Self::Bse,
            5 => Self::Bfo,
            6 => Self::Bcd,
            7 => Self::Mcx,
            8 => Self::Mcxsx,
            9 => Self::Indices,
            other => Self::Unknown(other),
        }
    }

    /// Number of decimal places encoded in raw integer prices.
    #[must_use]
    pub const fn price_scale(self) -> u32 {
        match self {
            Self::Cds => 7,
            Self::Bcd => 4,
            _ => 2,
        }
    }

    /// Whether instruments in this segment can be traded.
    #[must_use]
    pub const fn is_tradable(self) -> bool {
        !matches!(self, Self::Indices)
    }
}

// =============================================================================
// Tick
// =============================================================================

/// Upstream streaming mode a tick was produced in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TickMode {
    /// Last traded price only.
    Ltp,
    /// Price, volume and OHLC.
    Quote,
    /// Quote plus timestamps, open interest and depth.
    #[default]
    Full,
}

impl TickMode {
    /// Wire name used by the upstream mode request.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ltp => "ltp",
            Self::Quote => "quote",
            Self::Full => "full",
        }
    }

    /// Parse a mode name, case-insensitively.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "ltp" => Some(Self::Ltp),
            "quote" => Some(Self::Quote),
            "full" => Some(Self::Full),
            _ => None,
        }
    }
}

/// Open/high/low/close snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Ohlc {
    /// Open price.
    #[serde(with = "rust_decimal::serde::float")]
    pub open: Decimal,
    /// High price.
    #[serde(with = "rust_decimal::serde::float")]
    pub high: Decimal,
    /// Low price.
    #[serde(with = "rust_decimal::serde::float")]
    pub low: Decimal,
    /// Close price (previous session).
    #[serde(with = "rust_decimal::serde::float")]
    pub close: Decimal,
}

/// One level of market depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthLevel {
    /// Quantity at this level.
    pub quantity: u32,
    /// Price of this level.
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    /// Number of orders at this level.
    pub orders: u16,
}

/// Five-level bid/ask depth.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MarketDepth {
    /// Bid side, best first.
    pub buy: Vec<DepthLevel>,
    /// Ask side, best first.
    pub sell: Vec<DepthLevel>,
}

/// An immutable price update for one instrument.
///
/// Produced only by the feed connector when data arrives. Fields that a
/// packet mode does not carry are `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tick {
    /// Instrument the tick belongs to.
    pub instrument_token: InstrumentToken,
    /// Mode of the packet this tick was decoded from.
    pub mode: TickMode,
    /// Whether the instrument is tradable (indices are not).
    pub tradable: bool,
    /// Last traded price.
    pub last_price: Decimal,
    /// Quantity of the last trade.
    pub last_traded_quantity: Option<u32>,
    /// Volume-weighted average traded price.
    pub average_traded_price: Option<Decimal>,
    /// Cumulative traded volume for the day.
    pub volume: u64,
    /// Pending buy quantity.
    pub total_buy_quantity: Option<u32>,
    /// Pending sell quantity.
    pub total_sell_quantity: Option<u32>,
    /// Percentage change against the previous close.
    pub change: Decimal,
    /// OHLC snapshot.
    pub ohlc: Ohlc,
    /// Time of the last trade, as reported by the exchange.
    pub last_trade_time: Option<DateTime<Utc>>,
    /// Open interest.
    pub oi: Option<u32>,
    /// Day high of open interest.
    pub oi_day_high: Option<u32>,
    /// Day low of open interest.
    pub oi_day_low: Option<u32>,
    /// Exchange timestamp of the update.
    pub exchange_timestamp: Option<DateTime<Utc>>,
    /// When this process received the packet.
    pub received_at: DateTime<Utc>,
    /// Market depth (full mode only).
    pub depth: Option<MarketDepth>,
}

impl Tick {
    /// Minimal tick carrying only a last price, as sent in LTP mode.
    #[must_use]
    pub fn ltp(instrument_token: InstrumentToken, last_price: Decimal) -> Self {
        Self {
            instrument_token,
            mode: TickMode::Ltp,
            tradable: instrument_token.segment().is_tradable(),
            last_price,
            last_traded_quantity: None,
            average_traded_price: None,
            volume: 0,
            total_buy_quantity: None,
            total_sell_quantity: None,
            change: Decimal::ZERO,
            ohlc: Ohlc::default(),
            last_trade_time: None,
            oi: None,
            oi_day_high: None,
            oi_day_low: None,
            exchange_timestamp: None,
            received_at: Utc::now(),
            depth: None,
        }
    }

    /// Timestamp shown to clients: exchange time when known, else receipt.
    #[must_use]
    pub fn display_timestamp(&self) -> DateTime<Utc> {
        self.exchange_timestamp.unwrap_or(self.received_at)
    }
}

/// Percentage change of `last` against `close`; zero when close is zero.
#[must_use]
pub fn percent_change(last: Decimal, close: Decimal) -> Decimal {
    if close.is_zero() {
        return Decimal::ZERO;
    }
    ((last - close) * Decimal::ONE_HUNDRED)
        .checked_div(close)
        .unwrap_or(Decimal::ZERO)
}

/// Ticks decoded from one upstream frame, in arrival order.
pub type TickBatch = Vec<Tick>;
