//! Monotonic nanosecond time source used for `ts_recv_ns` stamping and for the
//! aggregator's window-close timers.
//!
//! Everything downstream (aggregators, health monitor) works in nanoseconds
//! since the Unix epoch. We derive wall-clock nanoseconds from
//! `SystemTime::now()` rather than a true monotonic clock because the value
//! must be comparable to exchange-originated `ts_event_ns` values, which are
//! themselves wall-clock timestamps.

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock time, backed by the OS clock, expressed as nanoseconds since
/// the Unix epoch.
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before UNIX epoch")
        .as_nanos() as u64
}

/// Floor `ts_ns` to the start of the `window_s`-second grid it falls in:
/// `window_start_ns = floor(ts_ns / window_s) * window_s`. Used by the
/// 5-second trade aggregator (`window_s = 5`).
pub fn floor_to_window_ns(ts_ns: u64, window_s: u64) -> u64 {
    let window_ns = window_s * 1_000_000_000;
    (ts_ns / window_ns) * window_ns
}

/// Convert a millisecond timestamp (as supplied by the exchange) into the
/// nanosecond-typed `ts_event_ns` field: a straight `* 1_000_000` scale-up.
///
/// Mark-price frames do not go through this: `parse_mark_price` stamps the
/// raw millisecond count directly, a wire-version quirk kept for
/// compatibility with existing downstream consumers.
pub fn millis_to_nanos(ms: i64) -> u64 {
    (ms as u64).saturating_mul(1_000_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floors_to_five_second_grid() {
        // 1_700_000_001.000s -> window starting at 1_700_000_000.000s
        let ts_ns = 1_700_000_001_000_000_000u64;
        assert_eq!(floor_to_window_ns(ts_ns, 5), 1_700_000_000_000_000_000u64);

        let ts_ns = 1_700_000_004_999_000_000u64;
        assert_eq!(floor_to_window_ns(ts_ns, 5), 1_700_000_000_000_000_000u64);

        let ts_ns = 1_700_000_005_000_000_000u64;
        assert_eq!(floor_to_window_ns(ts_ns, 5), 1_700_000_005_000_000_000u64);
    }

    #[test]
    fn millis_scale_up_is_exact() {
        assert_eq!(millis_to_nanos(1_700_000_001_000), 1_700_000_001_000_000_000);
    }
}
