pub mod event;

pub use event::{
    AdvancedMetricsEvent, AggTrades5sEvent, BaseEvent, Channel, Depth, Event, FundingEvent,
    KlineEvent, LiquidationEvent, MarkPriceEvent, OrderBookDepthEvent, OrderBookDiffEvent, Side,
    TradeEvent,
};
