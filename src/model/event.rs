//! The canonical, sink-agnostic event model.
//!
//! Every frame the adapter parses is turned into exactly one [`Event`]
//! variant. The router and writers dispatch on [`Event::channel`] alone —
//! there is no other polymorphism here, since the channel is the tagged
//! variant itself.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The closed set of logical streams this pipeline understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Trades,
    AggTrades5s,
    L1,
    ObTop5,
    ObTop20,
    ObDiff,
    Liquidations,
    Klines,
    MarkPrice,
    Funding,
    AdvancedMetrics,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Trades => "trades",
            Channel::AggTrades5s => "agg_trades_5s",
            Channel::L1 => "l1",
            Channel::ObTop5 => "ob_top5",
            Channel::ObTop20 => "ob_top20",
            Channel::ObDiff => "ob_diff",
            Channel::Liquidations => "liquidations",
            Channel::Klines => "klines",
            Channel::MarkPrice => "mark_price",
            Channel::Funding => "funding",
            Channel::AdvancedMetrics => "advanced_metrics",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

/// Fields present on every event, regardless of channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseEvent {
    pub instrument: String,
    pub channel: Channel,
    /// Exchange-originated timestamp, nanoseconds since epoch. If the vendor
    /// only supplies milliseconds, some deployments leave the millisecond
    /// count left-placed in the field rather than scaling it up — that
    /// decision is made by whichever parser stamps the event, not by this
    /// struct.
    pub ts_event_ns: u64,
    /// Collector wall-clock nanoseconds at parse time. Not guaranteed to be
    /// `>= ts_event_ns`: clocks disagree, and that is allowed.
    pub ts_recv_ns: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEvent {
    pub base: BaseEvent,
    pub price: Decimal,
    pub qty: Decimal,
    pub side: Option<Side>,
    pub trade_id: u64,
    pub is_aggressor: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggTrades5sEvent {
    pub base: BaseEvent,
    pub window_start_ns: u64,
    pub interval_s: u32,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub notional: Decimal,
    pub trade_count: u64,
    pub buy_qty: Decimal,
    pub sell_qty: Decimal,
    pub buy_notional: Decimal,
    pub sell_notional: Decimal,
    pub first_trade_id: u64,
    pub last_trade_id: u64,
}

/// Supported book depths for the snapshot-style orderbook channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Depth {
    D1,
    D5,
    D20,
    D50,
    D100,
}

impl Depth {
    pub fn levels(&self) -> usize {
        match self {
            Depth::D1 => 1,
            Depth::D5 => 5,
            Depth::D20 => 20,
            Depth::D50 => 50,
            Depth::D100 => 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookDepthEvent {
    pub base: BaseEvent,
    pub depth: Depth,
    /// Sorted descending (best bid first).
    pub bid_prices: Vec<Decimal>,
    pub bid_qtys: Vec<Decimal>,
    /// Sorted ascending (best ask first).
    pub ask_prices: Vec<Decimal>,
    pub ask_qtys: Vec<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookDiffEvent {
    pub base: BaseEvent,
    pub sequence: u64,
    pub prev_sequence: u64,
    /// price -> qty; qty == 0 means delete.
    pub bids: BTreeMap<Decimal, Decimal>,
    pub asks: BTreeMap<Decimal, Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidationEvent {
    pub base: BaseEvent,
    pub side: Side,
    pub price: Decimal,
    pub qty: Decimal,
    pub order_id: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KlineEvent {
    pub base: BaseEvent,
    pub interval: String,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub quote_volume: Decimal,
    pub taker_buy_base_volume: Decimal,
    pub taker_buy_quote_volume: Decimal,
    pub trade_count: u64,
    pub is_closed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkPriceEvent {
    pub base: BaseEvent,
    pub mark_price: Decimal,
    pub index_price: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingEvent {
    pub base: BaseEvent,
    pub funding_rate: Decimal,
    pub next_funding_ts_ns: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvancedMetricsEvent {
    pub base: BaseEvent,
    pub metrics: BTreeMap<String, Decimal>,
}

/// The canonical tagged sum of every event kind the pipeline produces.
/// Writers and the router match on this, and on nothing else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Trade(TradeEvent),
    AggTrades5s(AggTrades5sEvent),
    OrderBookDepth(OrderBookDepthEvent),
    OrderBookDiff(OrderBookDiffEvent),
    Liquidation(LiquidationEvent),
    Kline(KlineEvent),
    MarkPrice(MarkPriceEvent),
    Funding(FundingEvent),
    AdvancedMetrics(AdvancedMetricsEvent),
}

impl Event {
    pub fn base(&self) -> &BaseEvent {
        match self {
            Event::Trade(e) => &e.base,
            Event::AggTrades5s(e) => &e.base,
            Event::OrderBookDepth(e) => &e.base,
            Event::OrderBookDiff(e) => &e.base,
            Event::Liquidation(e) => &e.base,
            Event::Kline(e) => &e.base,
            Event::MarkPrice(e) => &e.base,
            Event::Funding(e) => &e.base,
            Event::AdvancedMetrics(e) => &e.base,
        }
    }

    pub fn channel(&self) -> Channel {
        self.base().channel
    }

    pub fn instrument(&self) -> &str {
        &self.base().instrument
    }
}
