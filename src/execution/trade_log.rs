use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::api::Side;
use crate::execution::ExitReason;

/// One completed round trip, written as a JSON line when the position
/// finalizes. PnL fields are None when exit fills could not be reconciled.
#[derive(Debug, Clone, Serialize)]
pub struct TradeRecord {
    pub symbol: String,
    pub side: Side,
    pub exit_reason: ExitReason,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub hold_secs: f64,
    pub entry_order_id: i64,
    pub exit_order_id: Option<i64>,
    pub qty: f64,
    pub entry_px: f64,
    pub exit_px: Option<f64>,
    pub fill_notional: f64,
    pub entry_fill_time_ms: Option<i64>,
    pub exit_fill_time_ms: Option<i64>,
    /// Price return of the round trip as seen by the market
    pub raw_return: Option<f64>,
    /// Same return sign-adjusted for shorts
    pub signed_return: Option<f64>,
    pub gross_pnl: Option<f64>,
    pub fees: f64,
    pub net_pnl: Option<f64>,
    /// Market activity observed while the position was open
    pub trades_seen: u64,
    pub traded_volume: f64,
    pub traded_notional: f64,
    pub vwap: Option<f64>,
    pub price_high: Option<f64>,
    pub price_low: Option<f64>,
    pub mark_px_entry: Option<f64>,
    pub mark_px_exit: Option<f64>,
    pub mark_delta_bps: Option<f64>,
    pub mark_high: Option<f64>,
    pub mark_low: Option<f64>,
}

/// Append-only JSON-lines trade journal, one file per UTC day
pub struct TradeLog {
    dir: PathBuf,
}

impl TradeLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, when: DateTime<Utc>) -> PathBuf {
        self.dir
            .join(format!("trades_{}.jsonl", when.format("%Y%m%d")))
    }

    pub fn record(&self, trade: &TradeRecord) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating trade log dir {}", self.dir.display()))?;
        let path = self.path_for(trade.closed_at);
        let line = serde_json::to_string(trade).context("serializing trade record")?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening trade log {}", path.display()))?;
        writeln!(file, "{line}").context("writing trade record")?;
        Ok(())
    }
}

/// Outbound notification hook for lifecycle events. Delivery is best-effort;
/// implementations must not fail the trading path.
pub trait Alerter: Send + Sync {
    fn alert(&self, message: &str);
}

/// Default alerter: surfaces alerts through the log stream
pub struct TracingAlerter;

impl Alerter for TracingAlerter {
    fn alert(&self, message: &str) {
        warn!("[ALERT] {}", message);
    }
}
