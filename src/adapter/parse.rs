//! Frame parsing: vendor JSON → canonical building blocks.
//!
//! Each frame is JSON `{stream, data}`; `data`'s shape is
//! channel-specific and fixed by the vendor. Every numeric field is parsed
//! through [`crate::util::parse_decimal`] — never through a JSON number,
//! never through `f64`.

use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;

use crate::aggregate::{MarkFundingUpdate, RawDiff};
use crate::model::{BaseEvent, Channel, KlineEvent, LiquidationEvent, Side, TradeEvent};
use crate::util::{millis_to_nanos, parse_decimal};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unrecognized stream name: {0}")]
    UnknownStream(String),
    #[error("decimal field error: {0}")]
    Decimal(#[from] crate::util::DecimalError),
}

/// The envelope every combined-stream frame arrives in.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    pub stream: String,
    pub data: serde_json::Value,
}

pub fn parse_envelope(text: &str) -> Result<Envelope, ParseError> {
    Ok(serde_json::from_str(text)?)
}

/// Everything this parser can produce from one frame's `data` payload.
#[derive(Debug)]
pub enum ParsedFrame {
    Trade(TradeEvent),
    Depth(RawDiff),
    BookTicker {
        instrument: String,
        best_bid: Decimal,
        best_bid_qty: Decimal,
        best_ask: Decimal,
        best_ask_qty: Decimal,
        ts_event_ns: u64,
        ts_recv_ns: u64,
    },
    Kline(KlineEvent),
    MarkFunding(MarkFundingUpdate),
    Liquidation(LiquidationEvent),
}

#[derive(Debug, Deserialize)]
struct WireAggTrade {
    #[serde(rename = "E")]
    event_time_ms: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "a")]
    trade_id: u64,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    qty: String,
    #[serde(rename = "m")]
    is_buyer_maker: bool,
}

pub fn parse_agg_trade(data: &serde_json::Value, ts_recv_ns: u64) -> Result<ParsedFrame, ParseError> {
    let w: WireAggTrade = serde_json::from_value(data.clone())?;
    let side = Some(if w.is_buyer_maker { Side::Sell } else { Side::Buy });
    Ok(ParsedFrame::Trade(TradeEvent {
        base: BaseEvent {
            instrument: w.symbol,
            channel: Channel::Trades,
            ts_event_ns: millis_to_nanos(w.event_time_ms),
            ts_recv_ns,
        },
        price: parse_decimal(&w.price)?,
        qty: parse_decimal(&w.qty)?,
        side,
        trade_id: w.trade_id,
        is_aggressor: Some(!w.is_buyer_maker),
    }))
}

#[derive(Debug, Deserialize)]
struct WireDepthUpdate {
    #[serde(rename = "E")]
    event_time_ms: i64,
    #[serde(rename = "U")]
    first_update_id: u64,
    #[serde(rename = "u")]
    last_update_id: u64,
    #[serde(rename = "b")]
    bids: Vec<(String, String)>,
    #[serde(rename = "a")]
    asks: Vec<(String, String)>,
}

pub fn parse_depth_update(data: &serde_json::Value, ts_recv_ns: u64) -> Result<ParsedFrame, ParseError> {
    let w: WireDepthUpdate = serde_json::from_value(data.clone())?;
    let ts_event_ns = millis_to_nanos(w.event_time_ms);
    let bids = w
        .bids
        .iter()
        .map(|(p, q)| Ok((parse_decimal(p)?, parse_decimal(q)?)))
        .collect::<Result<Vec<_>, crate::util::DecimalError>>()?;
    let asks = w
        .asks
        .iter()
        .map(|(p, q)| Ok((parse_decimal(p)?, parse_decimal(q)?)))
        .collect::<Result<Vec<_>, crate::util::DecimalError>>()?;
    Ok(ParsedFrame::Depth(RawDiff {
        first_update_id: w.first_update_id,
        last_update_id: w.last_update_id,
        bids,
        asks,
        ts_event_ns,
        ts_recv_ns,
    }))
}

#[derive(Debug, Deserialize)]
struct WireBookTicker {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "b")]
    best_bid: String,
    #[serde(rename = "B")]
    best_bid_qty: String,
    #[serde(rename = "a")]
    best_ask: String,
    #[serde(rename = "A")]
    best_ask_qty: String,
    #[serde(rename = "E")]
    event_time_ms: Option<i64>,
}

pub fn parse_book_ticker(data: &serde_json::Value, ts_recv_ns: u64) -> Result<ParsedFrame, ParseError> {
    let w: WireBookTicker = serde_json::from_value(data.clone())?;
    Ok(ParsedFrame::BookTicker {
        instrument: w.symbol,
        best_bid: parse_decimal(&w.best_bid)?,
        best_bid_qty: parse_decimal(&w.best_bid_qty)?,
        best_ask: parse_decimal(&w.best_ask)?,
        best_ask_qty: parse_decimal(&w.best_ask_qty)?,
        ts_event_ns: w.event_time_ms.map(millis_to_nanos).unwrap_or(ts_recv_ns),
        ts_recv_ns,
    })
}

#[derive(Debug, Deserialize)]
struct WireKlinePayload {
    #[serde(rename = "E")]
    event_time_ms: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "k")]
    k: WireKline,
}

#[derive(Debug, Deserialize)]
struct WireKline {
    #[serde(rename = "i")]
    interval: String,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "q")]
    quote_volume: String,
    #[serde(rename = "V")]
    taker_buy_base_volume: String,
    #[serde(rename = "Q")]
    taker_buy_quote_volume: String,
    #[serde(rename = "n")]
    trade_count: u64,
    #[serde(rename = "x")]
    is_closed: bool,
}

pub fn parse_kline(data: &serde_json::Value, ts_recv_ns: u64) -> Result<ParsedFrame, ParseError> {
    let w: WireKlinePayload = serde_json::from_value(data.clone())?;
    Ok(ParsedFrame::Kline(KlineEvent {
        base: BaseEvent {
            instrument: w.symbol,
            channel: Channel::Klines,
            ts_event_ns: millis_to_nanos(w.event_time_ms),
            ts_recv_ns,
        },
        interval: w.k.interval,
        open: parse_decimal(&w.k.open)?,
        high: parse_decimal(&w.k.high)?,
        low: parse_decimal(&w.k.low)?,
        close: parse_decimal(&w.k.close)?,
        volume: parse_decimal(&w.k.volume)?,
        quote_volume: parse_decimal(&w.k.quote_volume)?,
        taker_buy_base_volume: parse_decimal(&w.k.taker_buy_base_volume)?,
        taker_buy_quote_volume: parse_decimal(&w.k.taker_buy_quote_volume)?,
        trade_count: w.k.trade_count,
        is_closed: w.k.is_closed,
    }))
}

#[derive(Debug, Deserialize)]
struct WireMarkPrice {
    #[serde(rename = "E")]
    event_time_ms: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    mark_price: String,
    #[serde(rename = "i")]
    index_price: Option<String>,
    #[serde(rename = "r")]
    funding_rate: String,
    #[serde(rename = "T")]
    next_funding_time_ms: i64,
}

/// Mark-price frames stamp `ts_event_ns` with the raw millisecond `E` value,
/// not scaled up to nanoseconds. This is a known quirk carried over from an
/// earlier wire version for compatibility with existing downstream
/// consumers of this field; every other frame kind scales `E` through
/// `millis_to_nanos` as normal.
pub fn parse_mark_price(data: &serde_json::Value, ts_recv_ns: u64) -> Result<ParsedFrame, ParseError> {
    let w: WireMarkPrice = serde_json::from_value(data.clone())?;
    Ok(ParsedFrame::MarkFunding(MarkFundingUpdate {
        instrument: w.symbol,
        ts_event_ns: w.event_time_ms as u64,
        ts_recv_ns,
        mark_price: parse_decimal(&w.mark_price)?,
        index_price: w.index_price.as_deref().map(parse_decimal).transpose()?,
        funding_rate: parse_decimal(&w.funding_rate)?,
        next_funding_ts_ns: millis_to_nanos(w.next_funding_time_ms),
    }))
}

#[derive(Debug, Deserialize)]
struct WireForceOrderPayload {
    #[serde(rename = "E")]
    event_time_ms: i64,
    #[serde(rename = "o")]
    order: WireForceOrder,
}

#[derive(Debug, Deserialize)]
struct WireForceOrder {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    qty: String,
}

pub fn parse_liquidation(data: &serde_json::Value, ts_recv_ns: u64) -> Result<ParsedFrame, ParseError> {
    let w: WireForceOrderPayload = serde_json::from_value(data.clone())?;
    let side = if w.order.side.eq_ignore_ascii_case("SELL") {
        Side::Sell
    } else {
        Side::Buy
    };
    Ok(ParsedFrame::Liquidation(LiquidationEvent {
        base: BaseEvent {
            instrument: w.order.symbol,
            channel: Channel::Liquidations,
            ts_event_ns: millis_to_nanos(w.event_time_ms),
            ts_recv_ns,
        },
        side,
        price: parse_decimal(&w.order.price)?,
        qty: parse_decimal(&w.order.qty)?,
        order_id: None,
        reason: None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_agg_trade_with_decimal_round_trip() {
        let data = json!({
            "E": 1_700_000_001_000i64,
            "s": "BTCUSDT",
            "a": 42,
            "p": "100.00",
            "q": "1.500",
            "m": true,
        });
        let frame = parse_agg_trade(&data, 99).unwrap();
        match frame {
            ParsedFrame::Trade(t) => {
                assert_eq!(t.price.to_string(), "100.00");
                assert_eq!(t.qty.to_string(), "1.500");
                assert_eq!(t.side, Some(Side::Sell));
                assert_eq!(t.base.ts_event_ns, 1_700_000_001_000_000_000);
            }
            other => panic!("expected Trade, got {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_frame() {
        let data = json!({"s": "BTCUSDT"});
        assert!(parse_agg_trade(&data, 0).is_err());
    }
}
