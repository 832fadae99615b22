pub mod clock;
pub mod decimal;

pub use clock::{floor_to_window_ns, millis_to_nanos, now_ns};
pub use decimal::{parse_decimal, parse_decimal_field, DecimalError};
