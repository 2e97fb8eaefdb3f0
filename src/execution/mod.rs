// Order placement, position lifecycle, and trade recording
pub mod filters;
pub mod manager;
pub mod order_placer;
pub mod trade_log;

pub use filters::{round_to_step, FilterBook, RoundMode, SizingError, SymbolFilters};
pub use manager::{build_trade_record, PositionManager, PositionState, TradeTracker};
pub use order_placer::{
    plan_exit_levels, ArmedExits, EntryOutcome, ExitConfig, ExitLevels, OrderPlacer,
    OrderTradeStats,
};
pub use trade_log::{Alerter, TradeLog, TradeRecord, TracingAlerter};

use serde::Serialize;

/// Why a position left the book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExitReason {
    #[serde(rename = "TP")]
    TakeProfit,
    #[serde(rename = "SL")]
    StopLoss,
    #[serde(rename = "TSL")]
    TrailingStop,
    #[serde(rename = "MARGIN")]
    Margin,
    #[serde(rename = "DAILY_DRAWDOWN_BLOCK")]
    DailyDrawdownBlock,
    #[serde(rename = "DAILY_CUTOFF")]
    DailyCutoff,
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::TakeProfit => "TP",
            ExitReason::StopLoss => "SL",
            ExitReason::TrailingStop => "TSL",
            ExitReason::Margin => "MARGIN",
            ExitReason::DailyDrawdownBlock => "DAILY_DRAWDOWN_BLOCK",
            ExitReason::DailyCutoff => "DAILY_CUTOFF",
            ExitReason::Unknown => "UNKNOWN",
        }
    }

    /// Map an exchange order type or free-text label to a reason.
    /// TRAIL must be checked before STOP: TRAILING_STOP_MARKET contains both.
    pub fn from_label(label: &str) -> ExitReason {
        let upper = label.to_uppercase();
        if upper.contains("TAKE_PROFIT") {
            ExitReason::TakeProfit
        } else if upper.contains("TRAIL") {
            ExitReason::TrailingStop
        } else if upper.contains("STOP") {
            ExitReason::StopLoss
        } else if upper.contains("MARGIN") {
            ExitReason::Margin
        } else {
            ExitReason::Unknown
        }
    }
}
