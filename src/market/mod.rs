// Market data cache module
pub mod cache;
pub mod types;

pub use cache::{MarketCache, MarketSnapshot, DERIVED_BAR_MINS, TRADE_RING_CAP};
pub use types::{AggTrade, Bbo, DerivedBar, FundingInfo, Kline, L2Depth};
