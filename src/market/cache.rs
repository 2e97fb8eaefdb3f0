use std::collections::HashMap;
use std::sync::Mutex;

use crate::api::MarketEvent;
use crate::market::types::{AggTrade, Bbo, DerivedBar, FundingInfo, Kline, L2Depth};

/// How many closed 1m candles make up one derived bar
pub const DERIVED_BAR_MINS: usize = 10;
/// Hard cap on the per-symbol trade ring; when exceeded the oldest half is dropped
pub const TRADE_RING_CAP: usize = 5000;
/// How many derived bars to retain per symbol
const DERIVED_BAR_KEEP: usize = 64;

/// Immutable point-in-time view of one symbol's market state.
///
/// All fields come from a single locked read, so bid/ask/funding/kline are
/// mutually consistent within one snapshot.
#[derive(Debug, Clone, Default)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub bbo: Option<Bbo>,
    pub funding: Option<FundingInfo>,
    pub kline_1m: Option<Kline>,
    pub depth: Option<L2Depth>,
    pub trades_1s: Vec<AggTrade>,
    pub last_derived_bar: Option<DerivedBar>,
}

#[derive(Debug, Default)]
struct SymbolBook {
    bbo: Option<Bbo>,
    funding: Option<FundingInfo>,
    kline_1m: Option<Kline>,
    depth: Option<L2Depth>,
    trades: Vec<AggTrade>,
    kline_bucket: Vec<Kline>,
    derived_bars: Vec<DerivedBar>,
}

/// Latest-value store for all per-symbol market state, fed by streaming
/// callbacks and REST seeding through the same typed event path.
///
/// Every mutation and every snapshot happens under one lock; `update` never
/// performs I/O while holding it.
pub struct MarketCache {
    inner: Mutex<HashMap<String, SymbolBook>>,
    derived_window: usize,
    trade_cap: usize,
}

impl Default for MarketCache {
    fn default() -> Self {
        Self::new(DERIVED_BAR_MINS, TRADE_RING_CAP)
    }
}

impl MarketCache {
    pub fn new(derived_window: usize, trade_cap: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            derived_window: derived_window.max(1),
            trade_cap: trade_cap.max(2),
        }
    }

    /// Apply one decoded market event
    pub fn update(&self, event: MarketEvent) {
        let mut inner = self.inner.lock().unwrap();
        match event {
            MarketEvent::Kline(k) => {
                let book = inner.entry(k.symbol.clone()).or_default();
                Self::apply_kline(book, k, self.derived_window);
            }
            MarketEvent::BookTicker(b) => {
                let book = inner.entry(b.symbol.clone()).or_default();
                book.bbo = Some(b);
            }
            MarketEvent::MarkPrice(f) => {
                let book = inner.entry(f.symbol.clone()).or_default();
                book.funding = Some(f);
            }
            MarketEvent::AggTrade(t) => {
                let book = inner.entry(t.symbol.clone()).or_default();
                book.trades.push(t);
                if book.trades.len() > self.trade_cap {
                    book.trades.drain(..self.trade_cap / 2);
                }
            }
            MarketEvent::Depth(d) => {
                let book = inner.entry(d.symbol.clone()).or_default();
                book.depth = Some(d);
            }
        }
    }

    fn apply_kline(book: &mut SymbolBook, k: Kline, window: usize) {
        let closed = k.is_closed && k.interval == "1m";
        book.kline_1m = Some(k.clone());
        if !closed {
            return;
        }

        book.kline_bucket.push(k);
        if book.kline_bucket.len() > window {
            book.kline_bucket.remove(0);
        }
        if book.kline_bucket.len() == window {
            let bucket = &book.kline_bucket;
            let bar = DerivedBar {
                symbol: bucket[0].symbol.clone(),
                start_time_ms: bucket[0].start_time_ms,
                close_time_ms: bucket[bucket.len() - 1].close_time_ms,
                open: bucket[0].open,
                high: bucket.iter().map(|x| x.high).fold(f64::MIN, f64::max),
                low: bucket.iter().map(|x| x.low).fold(f64::MAX, f64::min),
                close: bucket[bucket.len() - 1].close,
                base_vol: bucket.iter().map(|x| x.base_vol).sum(),
                quote_vol: bucket.iter().map(|x| x.quote_vol).sum(),
                num_trades: bucket.iter().map(|x| x.num_trades).sum(),
            };
            book.derived_bars.push(bar);
            if book.derived_bars.len() > DERIVED_BAR_KEEP {
                book.derived_bars.remove(0);
            }
            book.kline_bucket.clear();
        }
    }

    /// Point-in-time copy of everything known about a symbol
    pub fn snapshot(&self, symbol: &str, now_ms: i64, trade_lookback_ms: i64) -> MarketSnapshot {
        let inner = self.inner.lock().unwrap();
        let Some(book) = inner.get(symbol) else {
            return MarketSnapshot {
                symbol: symbol.to_string(),
                ..Default::default()
            };
        };

        let cutoff = now_ms - trade_lookback_ms;
        // Trades arrive in time order; scan from the tail.
        let trades_1s: Vec<AggTrade> = book
            .trades
            .iter()
            .rev()
            .take_while(|t| t.trade_time_ms >= cutoff)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();

        MarketSnapshot {
            symbol: symbol.to_string(),
            bbo: book.bbo.clone(),
            funding: book.funding.clone(),
            kline_1m: book.kline_1m.clone(),
            depth: book.depth.clone(),
            trades_1s,
            last_derived_bar: book.derived_bars.last().cloned(),
        }
    }

    /// Number of derived bars emitted so far for a symbol
    pub fn derived_bar_count(&self, symbol: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.get(symbol).map(|b| b.derived_bars.len()).unwrap_or(0)
    }

    /// Number of trades currently buffered for a symbol
    pub fn trade_count(&self, symbol: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.get(symbol).map(|b| b.trades.len()).unwrap_or(0)
    }
}
