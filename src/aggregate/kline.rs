//! 1-minute kline passthrough/validator.
//!
//! The vendor already delivers fully-formed OHLCV candles; there is no
//! aggregation to do here, only a sanity check before the event is handed to
//! the router. A candle that fails validation is a parse-level drop, not
//! folded into any state.

use crate::model::KlineEvent;

#[derive(Debug, thiserror::Error)]
pub enum KlineValidationError {
    #[error("high {high} is below low {low}")]
    HighBelowLow { high: String, low: String },
    #[error("open {open} is outside [low, high]")]
    OpenOutOfRange { open: String, low: String, high: String },
    #[error("close {close} is outside [low, high]")]
    CloseOutOfRange { close: String, low: String, high: String },
}

pub fn validate(kline: &KlineEvent) -> Result<(), KlineValidationError> {
    if kline.high < kline.low {
        return Err(KlineValidationError::HighBelowLow {
            high: kline.high.to_string(),
            low: kline.low.to_string(),
        });
    }
    if kline.open < kline.low || kline.open > kline.high {
        return Err(KlineValidationError::OpenOutOfRange {
            open: kline.open.to_string(),
            low: kline.low.to_string(),
            high: kline.high.to_string(),
        });
    }
    if kline.close < kline.low || kline.close > kline.high {
        return Err(KlineValidationError::CloseOutOfRange {
            close: kline.close.to_string(),
            low: kline.low.to_string(),
            high: kline.high.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BaseEvent, Channel};
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn kline(open: &str, high: &str, low: &str, close: &str) -> KlineEvent {
        KlineEvent {
            base: BaseEvent {
                instrument: "BTCUSDT".into(),
                channel: Channel::Klines,
                ts_event_ns: 0,
                ts_recv_ns: 0,
            },
            interval: "1m".into(),
            open: Decimal::from_str(open).unwrap(),
            high: Decimal::from_str(high).unwrap(),
            low: Decimal::from_str(low).unwrap(),
            close: Decimal::from_str(close).unwrap(),
            volume: Decimal::ZERO,
            quote_volume: Decimal::ZERO,
            taker_buy_base_volume: Decimal::ZERO,
            taker_buy_quote_volume: Decimal::ZERO,
            trade_count: 0,
            is_closed: true,
        }
    }

    #[test]
    fn accepts_sane_candle() {
        assert!(validate(&kline("100", "110", "90", "105")).is_ok());
    }

    #[test]
    fn rejects_high_below_low() {
        assert!(validate(&kline("100", "90", "110", "100")).is_err());
    }

    #[test]
    fn rejects_close_outside_range() {
        assert!(validate(&kline("100", "110", "90", "200")).is_err());
    }
}
