use serde::{Deserialize, Serialize};

/// Best bid/offer for a symbol at one event time
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bbo {
    pub symbol: String,
    pub event_time_ms: i64,
    pub bid_px: f64,
    pub bid_qty: f64,
    pub ask_px: f64,
    pub ask_qty: f64,
}

impl Bbo {
    pub fn mid(&self) -> f64 {
        0.5 * (self.bid_px + self.ask_px)
    }

    pub fn spread(&self) -> f64 {
        self.ask_px - self.bid_px
    }

    /// Spread in basis points of mid, or None when mid is not positive
    pub fn spread_bps(&self) -> Option<f64> {
        let mid = self.mid();
        if mid <= 0.0 {
            return None;
        }
        Some(1e4 * self.spread() / mid)
    }
}

/// Mark/index price and funding state from the markPrice stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FundingInfo {
    pub symbol: String,
    pub event_time_ms: i64,
    pub mark_px: f64,
    pub index_px: f64,
    pub funding_rate: f64,
    pub next_funding_time_ms: i64,
}

impl FundingInfo {
    pub fn funding_bps(&self) -> f64 {
        self.funding_rate * 1e4
    }
}

/// One aggregated trade
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggTrade {
    pub symbol: String,
    pub event_time_ms: i64,
    pub trade_time_ms: i64,
    pub agg_id: i64,
    pub price: f64,
    pub qty: f64,
    pub is_buyer_maker: bool,
}

/// 1-minute OHLCV candle (streamed updates carry the in-progress bar;
/// `is_closed` flips on the final update of the minute)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Kline {
    pub symbol: String,
    pub event_time_ms: i64,
    pub start_time_ms: i64,
    pub close_time_ms: i64,
    pub interval: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub base_vol: f64,
    pub quote_vol: f64,
    pub num_trades: i64,
    pub is_closed: bool,
}

/// Top-of-book depth levels (price, qty), best first
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct L2Depth {
    pub symbol: String,
    pub event_time_ms: i64,
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
}

/// Tumbling bar derived from N consecutive closed 1m candles
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DerivedBar {
    pub symbol: String,
    pub start_time_ms: i64,
    pub close_time_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub base_vol: f64,
    pub quote_vol: f64,
    pub num_trades: i64,
}
