//! The two sinks. Each owns its own batching writer ([`columnar::ColumnarWriter`],
//! [`cache::CacheWriter`]) plus a consumer task that receives canonical
//! [`Event`]s from the router and translates them into that writer's public
//! contract (`enqueue(table, row)` / `enqueue(command, key, fields, ttl)`).

pub mod cache;
pub mod columnar;

use std::time::Duration;

use rust_decimal::Decimal;
use serde_json::json;
use tokio::sync::mpsc;

use crate::model::{Channel, Event};
use cache::{decimal_field, CacheCommand, CacheWriter};
use columnar::ColumnarWriter;

/// TTLs for the cache keyspace.
mod ttl {
    use std::time::Duration;
    pub const MARK: Duration = Duration::from_secs(3);
    pub const KLINE: Duration = Duration::from_secs(120);
    pub const AGG_TRADES_5S: Duration = Duration::from_secs(10);
}

/// Spawn the task that drains `rx` into the columnar writer's per-table
/// buffers. Returns immediately; the task runs until `rx` closes.
pub fn spawn_columnar_sink(mut rx: mpsc::Receiver<Event>, writer: ColumnarWriter) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Some((table, row)) = columnar_row(&event) {
                writer.enqueue(table, row);
            }
        }
    });
}

/// Spawn the task that drains `rx` into the cache writer's pipeline queue.
pub fn spawn_cache_sink(mut rx: mpsc::Receiver<Event>, writer: CacheWriter) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            for command in cache_commands(&event) {
                writer.enqueue(command);
            }
        }
    });
}

fn dec(d: Decimal) -> serde_json::Value {
    json!(d.to_string())
}

/// Translate a canonical event into a `(table, row)` pair for the columnar
/// store. Channels with no columnar table (book depth snapshots, diffs,
/// advanced metrics) return `None` — the core does not invent a schema
/// the external contract never named.
fn columnar_row(event: &Event) -> Option<(&'static str, serde_json::Value)> {
    match event {
        Event::Trade(e) => Some((
            "trades",
            json!({
                "instrument": e.base.instrument,
                "ts_event_ns": e.base.ts_event_ns,
                "ts_recv_ns": e.base.ts_recv_ns,
                "price": dec(e.price),
                "qty": dec(e.qty),
                "side": e.side,
                "trade_id": e.trade_id,
            }),
        )),
        Event::AggTrades5s(e) => Some((
            "agg_trades_5s",
            json!({
                "instrument": e.base.instrument,
                "window_start_ns": e.window_start_ns,
                "ts_event_ns": e.base.ts_event_ns,
                "ts_recv_ns": e.base.ts_recv_ns,
                "interval_s": e.interval_s,
                "open": dec(e.open),
                "high": dec(e.high),
                "low": dec(e.low),
                "close": dec(e.close),
                "volume": dec(e.volume),
                "notional": dec(e.notional),
                "trade_count": e.trade_count,
                "buy_qty": dec(e.buy_qty),
                "sell_qty": dec(e.sell_qty),
                "buy_notional": dec(e.buy_notional),
                "sell_notional": dec(e.sell_notional),
                "first_trade_id": e.first_trade_id,
                "last_trade_id": e.last_trade_id,
            }),
        )),
        Event::MarkPrice(e) => Some((
            "mark_price",
            json!({
                "instrument": e.base.instrument,
                "ts_event_ns": e.base.ts_event_ns,
                "ts_recv_ns": e.base.ts_recv_ns,
                "mark_price": dec(e.mark_price),
                "index_price": e.index_price.map(dec),
            }),
        )),
        Event::Funding(e) => Some((
            "funding",
            json!({
                "instrument": e.base.instrument,
                "ts_event_ns": e.base.ts_event_ns,
                "ts_recv_ns": e.base.ts_recv_ns,
                "funding_rate": dec(e.funding_rate),
                "next_funding_ts_ns": e.next_funding_ts_ns,
            }),
        )),
        Event::Kline(e) => Some((
            "klines",
            json!({
                "instrument": e.base.instrument,
                "ts_event_ns": e.base.ts_event_ns,
                "ts_recv_ns": e.base.ts_recv_ns,
                "interval": e.interval,
                "open": dec(e.open),
                "high": dec(e.high),
                "low": dec(e.low),
                "close": dec(e.close),
                "volume": dec(e.volume),
                "quote_volume": dec(e.quote_volume),
                "taker_buy_base_volume": dec(e.taker_buy_base_volume),
                "taker_buy_quote_volume": dec(e.taker_buy_quote_volume),
                "trade_count": e.trade_count,
                "is_closed": e.is_closed,
            }),
        )),
        Event::OrderBookDepth(_)
        | Event::OrderBookDiff(_)
        | Event::Liquidation(_)
        | Event::AdvancedMetrics(_) => None,
    }
}

/// Translate a canonical event into the cache commands it produces. A
/// channel with no cache mapping (e.g. an already-applied orderbook diff
/// once L1/top-N are derived) yields no commands.
fn cache_commands(event: &Event) -> Vec<CacheCommand> {
    match event {
        Event::Trade(e) => vec![CacheCommand::XAdd {
            key: format!("marketdata:stream:trades:{}", e.base.instrument),
            fields: vec![
                decimal_field("price", e.price),
                decimal_field("qty", e.qty),
                ("trade_id".into(), e.trade_id.to_string()),
                ("ts_event_ns".into(), e.base.ts_event_ns.to_string()),
                ("ts_recv_ns".into(), e.base.ts_recv_ns.to_string()),
            ],
        }],
        Event::AggTrades5s(e) => vec![CacheCommand::HSet {
            key: format!("marketdata:last:agg_trades_5s:{}", e.base.instrument),
            fields: vec![
                ("window_start_ns".into(), e.window_start_ns.to_string()),
                decimal_field("open", e.open),
                decimal_field("high", e.high),
                decimal_field("low", e.low),
                decimal_field("close", e.close),
                decimal_field("volume", e.volume),
                ("trade_count".into(), e.trade_count.to_string()),
                ("ts_event_ns".into(), e.base.ts_event_ns.to_string()),
                ("ts_recv_ns".into(), e.base.ts_recv_ns.to_string()),
            ],
            ttl: Some(ttl::AGG_TRADES_5S),
        }],
        Event::OrderBookDepth(e) => {
            let prefix = match e.depth.levels() {
                5 => "top5",
                20 => "top20",
                _ => "l1",
            };
            let key = if prefix == "l1" {
                format!("marketdata:last:l1:{}", e.base.instrument)
            } else {
                format!("marketdata:last:{}:{}", prefix, e.base.instrument)
            };
            vec![CacheCommand::HSet {
                key,
                fields: vec![
                    (
                        "best_bid".into(),
                        e.bid_prices.first().map(Decimal::to_string).unwrap_or_default(),
                    ),
                    (
                        "best_bid_qty".into(),
                        e.bid_qtys.first().map(Decimal::to_string).unwrap_or_default(),
                    ),
                    (
                        "best_ask".into(),
                        e.ask_prices.first().map(Decimal::to_string).unwrap_or_default(),
                    ),
                    (
                        "best_ask_qty".into(),
                        e.ask_qtys.first().map(Decimal::to_string).unwrap_or_default(),
                    ),
                    ("ts_event_ns".into(), e.base.ts_event_ns.to_string()),
                    ("ts_recv_ns".into(), e.base.ts_recv_ns.to_string()),
                ],
                ttl: None,
            }]
        }
        Event::MarkPrice(e) => vec![CacheCommand::HSet {
            key: format!("marketdata:last:mark:{}", e.base.instrument),
            fields: vec![
                decimal_field("mark_price", e.mark_price),
                (
                    "index_price".into(),
                    e.index_price.map(Decimal::to_string).unwrap_or_default(),
                ),
                ("ts_event_ns".into(), e.base.ts_event_ns.to_string()),
                ("ts_recv_ns".into(), e.base.ts_recv_ns.to_string()),
            ],
            ttl: Some(ttl::MARK),
        }],
        Event::Funding(e) => vec![CacheCommand::HSet {
            key: format!("marketdata:last:funding:{}", e.base.instrument),
            fields: vec![
                decimal_field("funding_rate", e.funding_rate),
                (
                    "next_funding_ts_ns".into(),
                    e.next_funding_ts_ns.to_string(),
                ),
                ("ts_event_ns".into(), e.base.ts_event_ns.to_string()),
            ],
            ttl: None,
        }],
        Event::Kline(e) => vec![CacheCommand::HSet {
            key: format!("marketdata:last:klines:{}:{}", e.interval, e.base.instrument),
            fields: vec![
                decimal_field("open", e.open),
                decimal_field("high", e.high),
                decimal_field("low", e.low),
                decimal_field("close", e.close),
                decimal_field("volume", e.volume),
                ("is_closed".into(), e.is_closed.to_string()),
                ("ts_event_ns".into(), e.base.ts_event_ns.to_string()),
            ],
            ttl: Some(ttl::KLINE),
        }],
        Event::Liquidation(e) => vec![CacheCommand::XAdd {
            key: format!("marketdata:stream:liquidations:{}", e.base.instrument),
            fields: vec![
                decimal_field("price", e.price),
                decimal_field("qty", e.qty),
                ("side".into(), format!("{:?}", e.side)),
                ("ts_event_ns".into(), e.base.ts_event_ns.to_string()),
                ("ts_recv_ns".into(), e.base.ts_recv_ns.to_string()),
            ],
        }],
        Event::OrderBookDiff(_) | Event::AdvancedMetrics(_) => Vec::new(),
    }
}

/// Two per-channel sink masks are all the router needs; this just lists
/// which channels this pipeline ever routes anywhere, to keep
/// `RouterConfig` construction in one place for the supervisor.
pub fn all_channels() -> [Channel; 11] {
    [
        Channel::Trades,
        Channel::AggTrades5s,
        Channel::L1,
        Channel::ObTop5,
        Channel::ObTop20,
        Channel::ObDiff,
        Channel::Liquidations,
        Channel::Klines,
        Channel::MarkPrice,
        Channel::Funding,
        Channel::AdvancedMetrics,
    ]
}

pub const FLUSH_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BaseEvent, Channel, MarkPriceEvent};
    use rust_decimal::Decimal;
    use std::str::FromStr;

    #[test]
    fn mark_price_cache_command_carries_a_three_second_ttl() {
        let event = Event::MarkPrice(MarkPriceEvent {
            base: BaseEvent {
                instrument: "BTCUSDT".into(),
                channel: Channel::MarkPrice,
                ts_event_ns: 1,
                ts_recv_ns: 2,
            },
            mark_price: Decimal::from_str("50000.5").unwrap(),
            index_price: None,
        });
        let commands = cache_commands(&event);
        assert_eq!(commands.len(), 1);
        match &commands[0] {
            CacheCommand::HSet { key, ttl, .. } => {
                assert_eq!(key, "marketdata:last:mark:BTCUSDT");
                assert_eq!(*ttl, Some(ttl::MARK));
            }
            other => panic!("expected HSet, got {other:?}"),
        }
    }

    #[test]
    fn l1_order_book_cache_command_has_no_ttl() {
        use crate::model::{Depth, OrderBookDepthEvent};

        let event = Event::OrderBookDepth(OrderBookDepthEvent {
            base: BaseEvent {
                instrument: "BTCUSDT".into(),
                channel: Channel::L1,
                ts_event_ns: 1,
                ts_recv_ns: 2,
            },
            depth: Depth::D1,
            bid_prices: vec![Decimal::from_str("100").unwrap()],
            bid_qtys: vec![Decimal::from_str("1").unwrap()],
            ask_prices: vec![Decimal::from_str("101").unwrap()],
            ask_qtys: vec![Decimal::from_str("1").unwrap()],
        });
        let commands = cache_commands(&event);
        assert_eq!(commands.len(), 1);
        match &commands[0] {
            CacheCommand::HSet { key, ttl, .. } => {
                assert_eq!(key, "marketdata:last:l1:BTCUSDT");
                assert_eq!(*ttl, None);
            }
            other => panic!("expected HSet, got {other:?}"),
        }
    }
}
