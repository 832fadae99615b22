//! The 5-second aggregated-trade roller.
//!
//! One [`AggTradeAggregator`] lives inside the shard task that owns a given
//! symbol's trade stream, owned by that shard and never touched by
//! another task. It never locks anything — there is exactly one writer.

use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::model::{AggTrades5sEvent, BaseEvent, Channel, Side, TradeEvent};
use crate::util::floor_to_window_ns;

const INTERVAL_S: u32 = 5;
/// How long past a window's end an idle accumulator is allowed to sit open
/// before the wall-clock closer emits it anyway.
pub const IDLE_CLOSE_GRACE_NS: u64 = 2_000_000_000;

struct OpenWindow {
    window_start_ns: u64,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
    notional: Decimal,
    trade_count: u64,
    buy_qty: Decimal,
    sell_qty: Decimal,
    buy_notional: Decimal,
    sell_notional: Decimal,
    first_trade_id: u64,
    last_trade_id: u64,
    last_ts_event_ns: u64,
    last_ts_recv_ns: u64,
}

impl OpenWindow {
    fn open(trade: &TradeEvent, window_start_ns: u64) -> Self {
        let mut w = Self {
            window_start_ns,
            open: trade.price,
            high: trade.price,
            low: trade.price,
            close: trade.price,
            volume: Decimal::ZERO,
            notional: Decimal::ZERO,
            trade_count: 0,
            buy_qty: Decimal::ZERO,
            sell_qty: Decimal::ZERO,
            buy_notional: Decimal::ZERO,
            sell_notional: Decimal::ZERO,
            first_trade_id: trade.trade_id,
            last_trade_id: trade.trade_id,
            last_ts_event_ns: trade.base.ts_event_ns,
            last_ts_recv_ns: trade.base.ts_recv_ns,
        };
        w.fold_in(trade);
        w
    }

    fn fold_in(&mut self, trade: &TradeEvent) {
        self.high = self.high.max(trade.price);
        self.low = self.low.min(trade.price);
        self.close = trade.price;
        self.volume += trade.qty;
        self.notional += trade.price * trade.qty;
        self.trade_count += 1;
        self.last_trade_id = trade.trade_id;
        self.last_ts_event_ns = trade.base.ts_event_ns;
        self.last_ts_recv_ns = trade.base.ts_recv_ns;

        match trade.side {
            Some(Side::Buy) => {
                self.buy_qty += trade.qty;
                self.buy_notional += trade.price * trade.qty;
            }
            Some(Side::Sell) => {
                self.sell_qty += trade.qty;
                self.sell_notional += trade.price * trade.qty;
            }
            None => {}
        }
    }

    fn emit(&self, instrument: &str) -> AggTrades5sEvent {
        AggTrades5sEvent {
            base: BaseEvent {
                instrument: instrument.to_string(),
                channel: Channel::AggTrades5s,
                ts_event_ns: self.last_ts_event_ns,
                ts_recv_ns: self.last_ts_recv_ns,
            },
            window_start_ns: self.window_start_ns,
            interval_s: INTERVAL_S,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            notional: self.notional,
            trade_count: self.trade_count,
            buy_qty: self.buy_qty,
            sell_qty: self.sell_qty,
            buy_notional: self.buy_notional,
            sell_notional: self.sell_notional,
            first_trade_id: self.first_trade_id,
            last_trade_id: self.last_trade_id,
        }
    }

    fn window_end_ns(&self) -> u64 {
        self.window_start_ns + (INTERVAL_S as u64) * 1_000_000_000
    }
}

/// Per-symbol registry of open accumulators, owned by one shard.
#[derive(Default)]
pub struct AggTradeAggregator {
    open: HashMap<String, OpenWindow>,
    /// Protocol-level drop counter: late trades that arrived after their
    /// window had already rolled over.
    pub lost: u64,
}

impl AggTradeAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a trade into its window, emitting the previous window's row if
    /// the trade belongs to a new one. Late trades (window already closed
    /// and rolled past) are dropped and counted, never folded in.
    pub fn on_trade(&mut self, instrument: &str, trade: &TradeEvent) -> Option<AggTrades5sEvent> {
        let window_start_ns = floor_to_window_ns(trade.base.ts_event_ns, u64::from(INTERVAL_S));

        match self.open.get(instrument) {
            None => {
                self.open
                    .insert(instrument.to_string(), OpenWindow::open(trade, window_start_ns));
                None
            }
            Some(current) if window_start_ns == current.window_start_ns => {
                self.open.get_mut(instrument).unwrap().fold_in(trade);
                None
            }
            Some(current) if window_start_ns > current.window_start_ns => {
                let emitted = current.emit(instrument);
                self.open
                    .insert(instrument.to_string(), OpenWindow::open(trade, window_start_ns));
                Some(emitted)
            }
            Some(_) => {
                // window_start_ns < current.window_start_ns: late trade.
                self.lost += 1;
                None
            }
        }
    }

    /// Called periodically by the shard's wall-clock closer task. Emits and
    /// resets any accumulator whose window ended more than
    /// [`IDLE_CLOSE_GRACE_NS`] ago, so idle symbols elide a row instead of
    /// zero-filling it.
    pub fn close_idle(&mut self, wall_clock_ns: u64) -> Vec<AggTrades5sEvent> {
        let mut due = Vec::new();
        self.open.retain(|instrument, window| {
            if wall_clock_ns >= window.window_end_ns() + IDLE_CLOSE_GRACE_NS {
                due.push(window.emit(instrument));
                false
            } else {
                true
            }
        });
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BaseEvent;
    use std::str::FromStr;

    fn trade(ts_event_ms: u64, price: &str, qty: &str, side: Side, trade_id: u64) -> TradeEvent {
        TradeEvent {
            base: BaseEvent {
                instrument: "BTCUSDT".into(),
                channel: Channel::Trades,
                ts_event_ns: ts_event_ms * 1_000_000,
                ts_recv_ns: ts_event_ms * 1_000_000,
            },
            price: Decimal::from_str(price).unwrap(),
            qty: Decimal::from_str(qty).unwrap(),
            side: Some(side),
            trade_id,
            is_aggressor: Some(true),
        }
    }

    /// Scenario S1: three trades in one window.
    #[test]
    fn aggregates_three_trades_in_one_window() {
        let mut agg = AggTradeAggregator::new();
        assert!(agg
            .on_trade("BTCUSDT", &trade(1_700_000_001_000, "100", "1", Side::Buy, 1))
            .is_none());
        assert!(agg
            .on_trade("BTCUSDT", &trade(1_700_000_002_500, "110", "2", Side::Sell, 2))
            .is_none());
        assert!(agg
            .on_trade("BTCUSDT", &trade(1_700_000_004_999, "90", "3", Side::Buy, 3))
            .is_none());

        let rows = agg.close_idle(1_700_000_007_000 * 1_000_000);
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.window_start_ns, 1_700_000_000_000_000_000);
        assert_eq!(row.open.to_string(), "100");
        assert_eq!(row.high.to_string(), "110");
        assert_eq!(row.low.to_string(), "90");
        assert_eq!(row.close.to_string(), "90");
        assert_eq!(row.volume.to_string(), "6");
        assert_eq!(row.trade_count, 3);
        assert_eq!(row.buy_qty.to_string(), "4");
        assert_eq!(row.sell_qty.to_string(), "2");
    }

    /// Scenario S2: a trade for an already-rolled-over window is dropped.
    #[test]
    fn late_trade_is_dropped_and_counted() {
        let mut agg = AggTradeAggregator::new();
        agg.on_trade("BTCUSDT", &trade(1_700_000_001_000, "100", "1", Side::Buy, 1));
        let emitted = agg.on_trade("BTCUSDT", &trade(1_700_000_006_000, "101", "1", Side::Buy, 2));
        assert!(emitted.is_some(), "new window rolls over and emits the prior one");

        let late = agg.on_trade("BTCUSDT", &trade(1_700_000_003_000, "99", "1", Side::Buy, 3));
        assert!(late.is_none());
        assert_eq!(agg.lost, 1);
    }

    #[test]
    fn window_start_is_five_second_aligned() {
        let mut agg = AggTradeAggregator::new();
        agg.on_trade("ETHUSDT", &trade(1_700_000_002_123, "10", "1", Side::Buy, 1));
        let rows = agg.close_idle(u64::MAX);
        assert_eq!(rows[0].window_start_ns % 5_000_000_000, 0);
    }
}
