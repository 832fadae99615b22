//! One WebSocket connection carrying up to `max_streams_per_conn` per-symbol
//! subscriptions for a single vendor channel. Spec.md §4.1/§5.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use rust_decimal::Decimal;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::aggregate::{AggTradeAggregator, DiffOutcome, MarkFundingCombiner, OrderBookDiffMachine, RawDiff};
use crate::health::HealthMonitor;
use crate::model::{
    BaseEvent, Channel, Depth, Event, OrderBookDepthEvent, OrderBookDiffEvent,
};
use crate::router::Router;
use crate::util::{now_ns, parse_decimal, DecimalError};

use super::parse::{self, ParsedFrame};
use super::VendorChannel;

const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const IDLE_TICK: Duration = Duration::from_secs(1);

/// Per-shard counters, read by the health monitor.
#[derive(Debug, Default)]
pub struct ShardCounters {
    pub msgs: AtomicU64,
    pub conns: AtomicU64,
    pub discs: AtomicU64,
    /// Protocol-level drops: late trades, stale/gapped diffs.
    pub drop: AtomicU64,
    pub parse_errors: AtomicU64,
}

/// Per-symbol state a shard owns exclusively, no locking required: only
/// the shard's own task ever touches it.
#[derive(Default)]
struct ShardState {
    agg_trades: AggTradeAggregator,
    books: HashMap<String, OrderBookDiffMachine>,
    mark_funding: MarkFundingCombiner,
}

pub struct Shard {
    pub id: usize,
    pub channel: VendorChannel,
    pub symbols: Vec<String>,
    pub ws_host: String,
    pub rest_host: String,
    pub router: Router,
    pub health: Arc<HealthMonitor>,
    pub counters: Arc<ShardCounters>,
    http: reqwest::Client,
}

impl Shard {
    pub fn new(
        id: usize,
        channel: VendorChannel,
        symbols: Vec<String>,
        ws_host: String,
        rest_host: String,
        router: Router,
        health: Arc<HealthMonitor>,
    ) -> Self {
        Self {
            id,
            channel,
            symbols,
            ws_host,
            rest_host,
            router,
            health,
            counters: Arc::new(ShardCounters::default()),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("failed to build reqwest client"),
        }
    }

    /// Publish one event, recording it on the health monitor on success.
    /// `lag_ms` saturates at 0 — clocks may disagree and put `ts_recv_ns`
    /// before `ts_event_ns`, which is not a real lag.
    async fn publish(&self, event: Event) {
        let channel = event.channel();
        let base = event.base();
        let lag_ms = base
            .ts_recv_ns
            .saturating_sub(base.ts_event_ns)
            / 1_000_000;
        if self.router.publish(event).await.is_ok() {
            self.health.record_routed(channel, lag_ms);
        }
    }

    /// Run until cancelled. Reconnects forever with exponential backoff;
    /// never returns on its own.
    pub async fn run(mut self) {
        let mut attempt: u32 = 0;
        loop {
            match self.connect_and_process().await {
                Ok(()) => {
                    info!(shard_id = self.id, channel = ?self.channel, "shard connection closed cleanly");
                }
                Err(e) => {
                    warn!(shard_id = self.id, channel = ?self.channel, error = %e, "shard connection error");
                }
            }
            self.counters.discs.fetch_add(1, Ordering::Relaxed);

            let delay = backoff_delay(attempt);
            attempt = attempt.saturating_add(1);
            tokio::time::sleep(delay).await;
        }
    }

    async fn connect_and_process(&mut self) -> anyhow::Result<()> {
        let url = format!("wss://{}/stream", self.ws_host);
        let (ws, _resp) = connect_async(&url).await?;
        self.counters.conns.fetch_add(1, Ordering::Relaxed);
        info!(shard_id = self.id, channel = ?self.channel, symbols = self.symbols.len(), "shard connected");

        let (mut write, mut read) = ws.split();

        let params: Vec<String> = self
            .symbols
            .iter()
            .map(|s| self.channel.stream_name(s))
            .collect();
        let subscribe = serde_json::json!({
            "method": "SUBSCRIBE",
            "params": params,
            "id": self.id,
        });
        write.send(Message::Text(subscribe.to_string())).await?;

        let mut state = ShardState::default();
        if self.channel == VendorChannel::Depth {
            for symbol in &self.symbols {
                state.books.insert(symbol.to_uppercase(), OrderBookDiffMachine::new());
            }
        }

        let mut idle_tick = tokio::time::interval(IDLE_TICK);

        loop {
            tokio::select! {
                biased;

                frame = tokio::time::timeout(HEARTBEAT_TIMEOUT, read.next()) => {
                    let frame = frame.map_err(|_| anyhow::anyhow!("no heartbeat within {HEARTBEAT_TIMEOUT:?}"))?;
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            self.counters.msgs.fetch_add(1, Ordering::Relaxed);
                            self.health.record_ws(self.channel.canonical_channel());
                            self.handle_text(&text, &mut state).await;
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(()),
                    }
                }

                _ = idle_tick.tick() => {
                    if self.channel == VendorChannel::AggTrade {
                        for row in state.agg_trades.close_idle(now_ns()) {
                            self.publish(Event::AggTrades5s(row)).await;
                        }
                    }
                    if self.channel == VendorChannel::Depth {
                        self.maybe_resync(&mut state.books).await;
                    }
                }
            }
        }
    }

    async fn handle_text(&self, text: &str, state: &mut ShardState) {
        let envelope = match parse::parse_envelope(text) {
            Ok(e) => e,
            Err(e) => {
                self.counters.parse_errors.fetch_add(1, Ordering::Relaxed);
                debug!(shard_id = self.id, error = %e, "dropping unparseable frame");
                return;
            }
        };

        let ts_recv_ns = now_ns();
        let parsed = match self.channel {
            VendorChannel::AggTrade => parse::parse_agg_trade(&envelope.data, ts_recv_ns),
            VendorChannel::Depth => parse::parse_depth_update(&envelope.data, ts_recv_ns),
            VendorChannel::BookTicker => parse::parse_book_ticker(&envelope.data, ts_recv_ns),
            VendorChannel::Kline1m => parse::parse_kline(&envelope.data, ts_recv_ns),
            VendorChannel::MarkPrice1s => parse::parse_mark_price(&envelope.data, ts_recv_ns),
            VendorChannel::ForceOrder => parse::parse_liquidation(&envelope.data, ts_recv_ns),
        };

        let parsed = match parsed {
            Ok(p) => p,
            Err(e) => {
                self.counters.parse_errors.fetch_add(1, Ordering::Relaxed);
                warn!(shard_id = self.id, stream = %envelope.stream, error = %e, "parse error");
                return;
            }
        };

        self.dispatch(&envelope.stream, parsed, state).await;
    }

    async fn dispatch(&self, stream: &str, frame: ParsedFrame, state: &mut ShardState) {
        match frame {
            ParsedFrame::Trade(trade) => {
                let instrument = trade.base.instrument.clone();
                if let Some(rolled) = state.agg_trades.on_trade(&instrument, &trade) {
                    self.publish(Event::AggTrades5s(rolled)).await;
                }
                self.publish(Event::Trade(trade)).await;
            }

            ParsedFrame::Depth(raw) => {
                let instrument = symbol_from_stream(stream);
                let book = state
                    .books
                    .entry(instrument.clone())
                    .or_insert_with(OrderBookDiffMachine::new);
                let outcome = book.feed_diff(raw.clone());
                self.publish_diff_outcome(&instrument, outcome, &raw, book).await;
            }

            ParsedFrame::BookTicker {
                instrument,
                best_bid,
                best_bid_qty,
                best_ask,
                best_ask_qty,
                ts_event_ns,
                ts_recv_ns,
            } => {
                let l1 = OrderBookDepthEvent {
                    base: BaseEvent {
                        instrument,
                        channel: Channel::L1,
                        ts_event_ns,
                        ts_recv_ns,
                    },
                    depth: Depth::D1,
                    bid_prices: vec![best_bid],
                    bid_qtys: vec![best_bid_qty],
                    ask_prices: vec![best_ask],
                    ask_qtys: vec![best_ask_qty],
                };
                self.publish(Event::OrderBookDepth(l1)).await;
            }

            ParsedFrame::Kline(kline) => {
                if let Err(e) = crate::aggregate::kline::validate(&kline) {
                    self.counters.parse_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(shard_id = self.id, error = %e, "dropping invalid kline");
                    return;
                }
                self.publish(Event::Kline(kline)).await;
            }

            ParsedFrame::MarkFunding(update) => {
                let (mark, funding) = state.mark_funding.on_update(update);
                self.publish(Event::MarkPrice(mark)).await;
                self.publish(Event::Funding(funding)).await;
            }

            ParsedFrame::Liquidation(liq) => {
                self.publish(Event::Liquidation(liq)).await;
            }
        }
    }

    async fn maybe_resync(&self, books: &mut HashMap<String, OrderBookDiffMachine>) {
        let now = now_ns();
        let due: Vec<String> = books
            .iter()
            .filter(|(_, book)| book.snapshot_due(now))
            .map(|(symbol, _)| symbol.clone())
            .collect();

        for instrument in due {
            if let Some(book) = books.get_mut(&instrument) {
                book.mark_snapshot_requested(now);
            }
            match self.fetch_snapshot(&instrument).await {
                Ok((bids, asks, last_update_id)) => {
                    if let Some(book) = books.get_mut(&instrument) {
                        let outcomes = book.integrate_snapshot(bids, asks, last_update_id);
                        for outcome in outcomes {
                            let empty = RawDiff {
                                first_update_id: 0,
                                last_update_id: 0,
                                bids: Vec::new(),
                                asks: Vec::new(),
                                ts_event_ns: now,
                                ts_recv_ns: now,
                            };
                            self.publish_diff_outcome(&instrument, outcome, &empty, book)
                                .await;
                        }
                    }
                }
                Err(e) => {
                    warn!(shard_id = self.id, instrument, error = %e, "snapshot fetch failed");
                }
            }
        }
    }

    async fn fetch_snapshot(
        &self,
        instrument: &str,
    ) -> anyhow::Result<(Vec<(Decimal, Decimal)>, Vec<(Decimal, Decimal)>, u64)> {
        #[derive(serde::Deserialize)]
        struct Snapshot {
            #[serde(rename = "lastUpdateId")]
            last_update_id: u64,
            bids: Vec<(String, String)>,
            asks: Vec<(String, String)>,
        }

        let url = format!(
            "https://{}/depth?symbol={}&limit=1000",
            self.rest_host, instrument
        );
        let mut last_err = None;
        for attempt in 0..3 {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            match tokio::time::timeout(Duration::from_secs(5), self.http.get(&url).send()).await {
                Ok(Ok(resp)) => {
                    let snap: Snapshot = resp.json().await?;
                    let to_levels = |rows: &[(String, String)]| -> Result<Vec<(Decimal, Decimal)>, DecimalError> {
                        rows.iter()
                            .map(|(p, q)| Ok((parse_decimal(p)?, parse_decimal(q)?)))
                            .collect()
                    };
                    let bids = to_levels(&snap.bids)?;
                    let asks = to_levels(&snap.asks)?;
                    return Ok((bids, asks, snap.last_update_id));
                }
                Ok(Err(e)) => last_err = Some(anyhow::anyhow!(e)),
                Err(_) => last_err = Some(anyhow::anyhow!("snapshot fetch timed out")),
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("snapshot fetch failed")))
    }

    async fn publish_diff_outcome(
        &self,
        instrument: &str,
        outcome: DiffOutcome,
        raw: &RawDiff,
        book: &OrderBookDiffMachine,
    ) {
        match outcome {
            DiffOutcome::Applied {
                sequence,
                prev_sequence,
                bid_side_changed,
                ask_side_changed,
            } => {
                let diff_event = Event::OrderBookDiff(OrderBookDiffEvent {
                    base: BaseEvent {
                        instrument: instrument.to_string(),
                        channel: Channel::ObDiff,
                        ts_event_ns: raw.ts_event_ns,
                        ts_recv_ns: raw.ts_recv_ns,
                    },
                    sequence,
                    prev_sequence,
                    bids: raw.bids.iter().cloned().collect::<BTreeMap<_, _>>(),
                    asks: raw.asks.iter().cloned().collect::<BTreeMap<_, _>>(),
                });
                self.publish(diff_event).await;

                if bid_side_changed || ask_side_changed {
                    let (best_bid, best_ask) = book.l1();
                    let l1 = OrderBookDepthEvent {
                        base: BaseEvent {
                            instrument: instrument.to_string(),
                            channel: Channel::L1,
                            ts_event_ns: raw.ts_event_ns,
                            ts_recv_ns: raw.ts_recv_ns,
                        },
                        depth: Depth::D1,
                        bid_prices: best_bid.map(|(p, _)| vec![p]).unwrap_or_default(),
                        bid_qtys: best_bid.map(|(_, q)| vec![q]).unwrap_or_default(),
                        ask_prices: best_ask.map(|(p, _)| vec![p]).unwrap_or_default(),
                        ask_qtys: best_ask.map(|(_, q)| vec![q]).unwrap_or_default(),
                    };
                    self.publish(Event::OrderBookDepth(l1)).await;
                }
            }
            DiffOutcome::Stale | DiffOutcome::GapDetected => {
                self.counters.drop.fetch_add(1, Ordering::Relaxed);
            }
            DiffOutcome::Buffered => {}
        }
    }
}

/// Recover the instrument from a combined-stream name, e.g.
/// `btcusdt@depth@100ms` -> `BTCUSDT`. The vendor's diff payload itself
/// carries no symbol field.
fn symbol_from_stream(stream: &str) -> String {
    stream.split('@').next().unwrap_or(stream).to_uppercase()
}

/// Exponential backoff with a 1s base, 30s cap, and ±20% jitter.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(1u32.checked_shl(attempt.min(8)).unwrap_or(u32::MAX));
    let capped = exp.min(BACKOFF_CAP);
    let jitter_frac = rand::thread_rng().gen_range(-0.2..=0.2);
    let jittered_ms = (capped.as_millis() as f64) * (1.0 + jitter_frac);
    Duration::from_millis(jittered_ms.max(0.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_never_exceeds_cap_plus_jitter() {
        for attempt in 0..20 {
            let d = backoff_delay(attempt);
            assert!(d <= BACKOFF_CAP.mul_f64(1.2) + Duration::from_millis(1));
        }
    }

    #[test]
    fn backoff_grows_with_attempt_before_cap() {
        assert!(backoff_delay(0) <= Duration::from_millis(1_200));
        assert!(backoff_delay(3) <= Duration::from_millis(9_600));
    }

    #[test]
    fn symbol_from_stream_strips_suffix() {
        assert_eq!(symbol_from_stream("btcusdt@depth@100ms"), "BTCUSDT");
        assert_eq!(symbol_from_stream("ethusdt@aggTrade"), "ETHUSDT");
    }
}
