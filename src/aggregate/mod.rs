pub mod agg_trades;
pub mod kline;
pub mod mark_funding;
pub mod orderbook;

pub use agg_trades::AggTradeAggregator;
pub use mark_funding::{MarkFundingCombiner, MarkFundingUpdate};
pub use orderbook::{BookState, DiffOutcome, OrderBookDiffMachine, RawDiff};
