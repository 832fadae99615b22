//! Arbitrary-precision decimal parsing for exchange-provided numeric strings.
//!
//! Every price/size value that reaches an aggregator, a writer, or a sink
//! travels through [`parse_decimal`]. Nothing between the adapter's parser
//! and the sinks may convert through `f64`/`f32` — `rust_decimal::Decimal` is
//! a scaled 96-bit integer, so parsing `"100.00"` and calling `.to_string()`
//! on the result yields `"100.00"` back, trailing zeros and all. That
//! bit-exact round-trip is the whole point of carrying `Decimal` this far.

use rust_decimal::Decimal;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecimalError {
    #[error("not a string: {0}")]
    NotAString(serde_json::Value),
    #[error("unparseable decimal {raw:?}: {source}")]
    Parse {
        raw: String,
        #[source]
        source: rust_decimal::Error,
    },
}

/// Parse a vendor numeric string into a [`Decimal`]. Never goes through
/// floating point.
pub fn parse_decimal(raw: &str) -> Result<Decimal, DecimalError> {
    Decimal::from_str(raw).map_err(|source| DecimalError::Parse {
        raw: raw.to_string(),
        source,
    })
}

/// Parse a `serde_json::Value` that is expected to be a JSON string holding a
/// decimal, as the vendor always encodes prices/sizes this way (never as a
/// JSON number, which would already have lost precision at the parser).
pub fn parse_decimal_field(value: &serde_json::Value) -> Result<Decimal, DecimalError> {
    match value.as_str() {
        Some(s) => parse_decimal(s),
        None => Err(DecimalError::NotAString(value.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_trailing_zeros() {
        let d = parse_decimal("100.00").unwrap();
        assert_eq!(d.to_string(), "100.00");
    }

    #[test]
    fn round_trips_many_fractional_digits() {
        let d = parse_decimal("0.000123450").unwrap();
        assert_eq!(d.to_string(), "0.000123450");
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_decimal("not-a-number").is_err());
    }
}
