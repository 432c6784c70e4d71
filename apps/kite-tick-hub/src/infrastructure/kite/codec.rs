//! Kite Ticker Binary Codec
//!
//! Decodes the binary market data frames sent by the Kite ticker.
//!
//! # Frame Layout
//!
//! All integers are big-endian.
//!
//! ```text
//! [u16 packet count] ([u16 packet length] [packet bytes])*
//! ```
//!
//! A frame of exactly one byte is a heartbeat and carries no packets.
//!
//! # Packet Layouts
//!
//! | Length | Kind                    | Mode  |
//! |--------|-------------------------|-------|
//! | 8      | last price              | ltp   |
//! | 28     | index quote             | quote |
//! | 32     | index full (+timestamp) | full  |
//! | 44     | quote                   | quote |
//! | 184    | full with 5-level depth | full  |
//!
//! Prices are integers in the segment's minor unit; see
//! [`Segment::price_scale`](crate::domain::streaming::Segment::price_scale).

use bytes::Buf;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::domain::streaming::{
    DepthLevel, InstrumentToken, MarketDepth, Ohlc, Tick, TickBatch, TickMode, percent_change,
};

/// Packet length of an LTP packet.
pub const LTP_PACKET_LEN: usize = 8;
/// Packet length of an index quote packet.
pub const INDEX_QUOTE_PACKET_LEN: usize = 28;
/// Packet length of an index full packet.
pub const INDEX_FULL_PACKET_LEN: usize = 32;
/// Packet length of a quote packet.
pub const QUOTE_PACKET_LEN: usize = 44;
/// Packet length of a full packet.
pub const FULL_PACKET_LEN: usize = 184;

const DEPTH_LEVELS: usize = 5;

/// Codec errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Frame ended before the declared data.
    #[error("truncated frame: needed {needed} bytes at offset {offset}, have {available}")]
    Truncated {
        /// Offset at which the read was attempted.
        offset: usize,
        /// Bytes required.
        needed: usize,
        /// Bytes left in the frame.
        available: usize,
    },
}

/// Decode one binary frame into ticks, in packet order.
///
/// Heartbeat frames and frames shorter than a packet count decode to an
/// empty batch. Packets of unknown length are skipped.
///
/// # Errors
///
/// Returns [`CodecError::Truncated`] if a packet header or body runs past
/// the end of the frame.
pub fn decode_frame(frame: &[u8], received_at: DateTime<Utc>) -> Result<TickBatch, CodecError> {
    if frame.len() < 2 {
        return Ok(Vec::new());
    }

    let mut cursor = frame;
    let count = usize::from(cursor.get_u16());
    let mut ticks = Vec::with_capacity(count);

    for _ in 0..count {
        let offset = frame.len() - cursor.remaining();
        ensure(cursor, offset, 2)?;
        let len = usize::from(cursor.get_u16());

        ensure(cursor, offset + 2, len)?;
        let (packet, rest) = cursor.split_at(len);
        cursor = rest;

        match decode_packet(packet, received_at) {
            Some(tick) => ticks.push(tick),
            None => tracing::debug!(packet_len = len, "Skipping packet of unknown length"),
        }
    }

    Ok(ticks)
}

/// Whether `frame` is a ticker heartbeat.
#[must_use]
pub const fn is_heartbeat(frame: &[u8]) -> bool {
    frame.len() == 1
}

/// Decode a single packet. Returns `None` for unknown lengths.
#[must_use]
pub fn decode_packet(packet: &[u8], received_at: DateTime<Utc>) -> Option<Tick> {
    match packet.len() {
        LTP_PACKET_LEN => Some(decode_ltp(packet, received_at)),
        INDEX_QUOTE_PACKET_LEN | INDEX_FULL_PACKET_LEN => Some(decode_index(packet, received_at)),
        QUOTE_PACKET_LEN | FULL_PACKET_LEN => Some(decode_quote(packet, received_at)),
        _ => None,
    }
}

fn ensure(cursor: &[u8], offset: usize, needed: usize) -> Result<(), CodecError> {
    if cursor.remaining() < needed {
        return Err(CodecError::Truncated {
            offset,
            needed,
            available: cursor.remaining(),
        });
    }
    Ok(())
}

/// Reads a packet after its token, scaling prices by the token's segment.
struct PacketReader<'a> {
    buf: &'a [u8],
    scale: u32,
}

impl<'a> PacketReader<'a> {
    fn open(mut buf: &'a [u8]) -> (InstrumentToken, Self) {
        let token = InstrumentToken::new(buf.get_u32());
        let scale = token.segment().price_scale();
        (token, Self { buf, scale })
    }

    fn u32(&mut self) -> u32 {
        self.buf.get_u32()
    }

    fn price(&mut self) -> Decimal {
        Decimal::new(i64::from(self.buf.get_u32()), self.scale)
    }

    fn timestamp(&mut self) -> Option<DateTime<Utc>> {
        match self.buf.get_u32() {
            0 => None,
            secs => DateTime::from_timestamp(i64::from(secs), 0),
        }
    }

    fn depth_level(&mut self) -> DepthLevel {
        let quantity = self.u32();
        let price = self.price();
        let orders = self.buf.get_u16();
        self.buf.advance(2);
        DepthLevel {
            quantity,
            price,
            orders,
        }
    }
}

fn decode_ltp(packet: &[u8], received_at: DateTime<Utc>) -> Tick {
    let (token, mut reader) = PacketReader::open(packet);
    let mut tick = Tick::ltp(token, reader.price());
    tick.received_at = received_at;
    tick
}

fn decode_index(packet: &[u8], received_at: DateTime<Utc>) -> Tick {
    let full = packet.len() == INDEX_FULL_PACKET_LEN;
    let (token, mut reader) = PacketReader::open(packet);

    let last_price = reader.price();
    let high = reader.price();
    let low = reader.price();
    let open = reader.price();
    let close = reader.price();
    // Upstream change; recomputed from close below.
    let _ = reader.u32();
    let exchange_timestamp = if full { reader.timestamp() } else { None };

    Tick {
        instrument_token: token,
        mode: if full { TickMode::Full } else { TickMode::Quote },
        tradable: token.segment().is_tradable(),
        last_price,
        last_traded_quantity: None,
        average_traded_price: None,
        volume: 0,
        total_buy_quantity: None,
        total_sell_quantity: None,
        change: percent_change(last_price, close),
        ohlc: Ohlc {
            open,
            high,
            low,
            close,
        },
        last_trade_time: None,
        oi: None,
        oi_day_high: None,
        oi_day_low: None,
        exchange_timestamp,
        received_at,
        depth: None,
    }
}

fn decode_quote(packet: &[u8], received_at: DateTime<Utc>) -> Tick {
    let full = packet.len() == FULL_PACKET_LEN;
    let (token, mut reader) = PacketReader::open(packet);

    let last_price = reader.price();
    let last_traded_quantity = reader.u32();
    let average_traded_price = reader.price();
    let volume = reader.u32();
    let total_buy_quantity = reader.u32();
    let total_sell_quantity = reader.u32();
    let ohlc = Ohlc {
        open: reader.price(),
        high: reader.price(),
        low: reader.price(),
        close: reader.price(),
    };

    let mut tick = Tick {
        instrument_token: token,
        mode: TickMode::Quote,
        tradable: token.segment().is_tradable(),
        last_price,
        last_traded_quantity: Some(last_traded_quantity),
        average_traded_price: Some(average_traded_price),
        volume: u64::from(volume),
        total_buy_quantity: Some(total_buy_quantity),
        total_sell_quantity: Some(total_sell_quantity),
        change: percent_change(last_price, ohlc.close),
        ohlc,
        last_trade_time: None,
        oi: None,
        oi_day_high: None,
        oi_day_low: None,
        exchange_timestamp: None,
        received_at,
        depth: None,
    };

    if full {
        tick.mode = TickMode::Full;
        tick.last_trade_time = reader.timestamp();
        tick.oi = Some(reader.u32());
        tick.oi_day_high = Some(reader.u32());
        tick.oi_day_low = Some(reader.u32());
        tick.exchange_timestamp = reader.timestamp();

        let buy = (0..DEPTH_LEVELS).map(|_| reader.depth_level()).collect();
        let sell = (0..DEPTH_LEVELS).map(|_| reader.depth_level()).collect();
        tick.depth = Some(MarketDepth { buy, sell });
    }

    tick
}
