//! Mark-price / funding combiner.
//!
//! The vendor's `markPrice@1s` stream carries mark price, index price, and
//! the funding rate / next funding time in a single frame. This combiner
//! splits that one frame into the two canonical events the rest of the
//! pipeline expects and keeps the last-seen pair per symbol — the only
//! long-lived per-instrument state this combiner holds.

use std::collections::HashMap;

use crate::model::{BaseEvent, Channel, FundingEvent, MarkPriceEvent};
use rust_decimal::Decimal;

#[derive(Debug, Clone)]
pub struct MarkFundingUpdate {
    pub instrument: String,
    pub ts_event_ns: u64,
    pub ts_recv_ns: u64,
    pub mark_price: Decimal,
    pub index_price: Option<Decimal>,
    pub funding_rate: Decimal,
    pub next_funding_ts_ns: u64,
}

#[derive(Default)]
pub struct MarkFundingCombiner {
    last: HashMap<String, MarkFundingUpdate>,
}

impl MarkFundingCombiner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split one vendor frame into its two canonical events and remember it
    /// as the last-seen pair for the instrument.
    pub fn on_update(&mut self, update: MarkFundingUpdate) -> (MarkPriceEvent, FundingEvent) {
        let mark = MarkPriceEvent {
            base: BaseEvent {
                instrument: update.instrument.clone(),
                channel: Channel::MarkPrice,
                ts_event_ns: update.ts_event_ns,
                ts_recv_ns: update.ts_recv_ns,
            },
            mark_price: update.mark_price,
            index_price: update.index_price,
        };
        let funding = FundingEvent {
            base: BaseEvent {
                instrument: update.instrument.clone(),
                channel: Channel::Funding,
                ts_event_ns: update.ts_event_ns,
                ts_recv_ns: update.ts_recv_ns,
            },
            funding_rate: update.funding_rate,
            next_funding_ts_ns: update.next_funding_ts_ns,
        };
        self.last.insert(update.instrument.clone(), update);
        (mark, funding)
    }

    pub fn last_for(&self, instrument: &str) -> Option<&MarkFundingUpdate> {
        self.last.get(instrument)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn splits_one_frame_into_mark_and_funding() {
        let mut combiner = MarkFundingCombiner::new();
        let (mark, funding) = combiner.on_update(MarkFundingUpdate {
            instrument: "BTCUSDT".into(),
            ts_event_ns: 1,
            ts_recv_ns: 2,
            mark_price: Decimal::from_str("50000.1").unwrap(),
            index_price: Some(Decimal::from_str("50001.2").unwrap()),
            funding_rate: Decimal::from_str("0.0001").unwrap(),
            next_funding_ts_ns: 3,
        });

        assert_eq!(mark.mark_price.to_string(), "50000.1");
        assert_eq!(funding.funding_rate.to_string(), "0.0001");
        assert!(combiner.last_for("BTCUSDT").is_some());
    }
}
