use std::collections::HashMap;

use anyhow::{bail, Result};
use chrono::{DateTime, TimeZone, Utc};

use crate::api::Side;
use crate::execution::order_placer::{ArmedExits, OrderTradeStats};
use crate::execution::trade_log::TradeRecord;
use crate::execution::ExitReason;
use crate::market::cache::MarketSnapshot;

/// One open position as the engine tracks it. Quantity and entry price are
/// local hints; the exchange remains the source of truth for both.
#[derive(Debug, Clone)]
pub struct PositionState {
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub entry_vwap_px: f64,
    pub entry_order_id: i64,
    /// When the entry order went out, used as the reconciliation window start
    pub entry_send_time_ms: i64,
    pub opened_time_ms: i64,
    pub armed: ArmedExits,
    pub opening_loss_bps: f64,
    pub funding_bps_at_entry: f64,
}

/// Market activity accumulated while a position is open, for the trade
/// journal. Deduplicates trades by aggregate id across overlapping snapshots.
#[derive(Debug, Clone, Default)]
pub struct TradeTracker {
    last_agg_id: Option<i64>,
    pub trades_seen: u64,
    pub traded_volume: f64,
    pub traded_notional: f64,
    pub price_high: Option<f64>,
    pub price_low: Option<f64>,
    pub mark_first: Option<f64>,
    pub mark_last: Option<f64>,
    pub mark_high: Option<f64>,
    pub mark_low: Option<f64>,
}

impl TradeTracker {
    pub fn observe(&mut self, snap: &MarketSnapshot) {
        for trade in &snap.trades_1s {
            if self.last_agg_id.is_some_and(|last| trade.agg_id <= last) {
                continue;
            }
            self.last_agg_id = Some(trade.agg_id);
            self.trades_seen += 1;
            self.traded_volume += trade.qty;
            self.traded_notional += trade.price * trade.qty;
            self.price_high = Some(self.price_high.map_or(trade.price, |h| h.max(trade.price)));
            self.price_low = Some(self.price_low.map_or(trade.price, |l| l.min(trade.price)));
        }
        if let Some(funding) = &snap.funding {
            let mark = funding.mark_px;
            if mark > 0.0 {
                self.mark_first.get_or_insert(mark);
                self.mark_last = Some(mark);
                self.mark_high = Some(self.mark_high.map_or(mark, |h| h.max(mark)));
                self.mark_low = Some(self.mark_low.map_or(mark, |l| l.min(mark)));
            }
        }
    }

    /// Volume-weighted average traded price over the hold
    pub fn vwap(&self) -> Option<f64> {
        if self.traded_volume > 0.0 {
            Some(self.traded_notional / self.traded_volume)
        } else {
            None
        }
    }
}

/// Registry of open positions, at most one per symbol
#[derive(Debug, Default)]
pub struct PositionManager {
    positions: HashMap<String, (PositionState, TradeTracker)>,
}

impl PositionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, state: PositionState) -> Result<()> {
        if self.positions.contains_key(&state.symbol) {
            bail!("position already open for {}", state.symbol);
        }
        self.positions
            .insert(state.symbol.clone(), (state, TradeTracker::default()));
        Ok(())
    }

    pub fn has_position(&self, symbol: &str) -> bool {
        self.positions.contains_key(symbol)
    }

    pub fn get(&self, symbol: &str) -> Option<&(PositionState, TradeTracker)> {
        self.positions.get(symbol)
    }

    pub fn get_mut(&mut self, symbol: &str) -> Option<&mut (PositionState, TradeTracker)> {
        self.positions.get_mut(symbol)
    }

    pub fn remove(&mut self, symbol: &str) -> Option<(PositionState, TradeTracker)> {
        self.positions.remove(symbol)
    }

    pub fn open_symbols(&self) -> Vec<String> {
        self.positions.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

fn ms_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).single().unwrap_or_default())
}

/// Assemble the final journal entry for a closed position.
///
/// Exchange-reconciled fill statistics win over local hints wherever they
/// exist; PnL fields stay None when the exit could not be reconciled rather
/// than reporting numbers derived from guesses.
pub fn build_trade_record(
    state: &PositionState,
    tracker: &TradeTracker,
    exit_reason: ExitReason,
    exit_order_id: Option<i64>,
    entry_stats: &OrderTradeStats,
    exit_stats: &OrderTradeStats,
    closed_time_ms: i64,
) -> TradeRecord {
    let entry_px = entry_stats.avg_px.unwrap_or(state.entry_vwap_px);
    let qty = if entry_stats.qty > 0.0 {
        entry_stats.qty
    } else {
        state.qty
    };
    let fill_notional = if entry_stats.notional > 0.0 {
        entry_stats.notional
    } else {
        qty * entry_px
    };

    let exit_px = exit_stats.avg_px;
    let raw_return = exit_px.and_then(|exit_px| {
        if entry_px <= 0.0 {
            return None;
        }
        Some((exit_px - entry_px) / entry_px)
    });
    let signed_return = raw_return.map(|raw| if state.side.is_long() { raw } else { -raw });
    let gross_pnl = signed_return.map(|r| fill_notional * r);
    let fees = entry_stats.fees + exit_stats.fees;
    let net_pnl = gross_pnl.map(|g| g - fees);

    let mark_delta_bps = match (tracker.mark_first, tracker.mark_last) {
        (Some(first), Some(last)) if first > 0.0 => Some(1e4 * (last - first) / first),
        _ => None,
    };

    TradeRecord {
        symbol: state.symbol.clone(),
        side: state.side,
        exit_reason,
        opened_at: ms_to_utc(state.opened_time_ms),
        closed_at: ms_to_utc(closed_time_ms),
        hold_secs: (closed_time_ms - state.opened_time_ms).max(0) as f64 / 1000.0,
        entry_order_id: state.entry_order_id,
        exit_order_id,
        qty,
        entry_px,
        exit_px,
        fill_notional,
        entry_fill_time_ms: entry_stats.last_time_ms,
        exit_fill_time_ms: exit_stats.last_time_ms,
        raw_return,
        signed_return,
        gross_pnl,
        fees,
        net_pnl,
        trades_seen: tracker.trades_seen,
        traded_volume: tracker.traded_volume,
        traded_notional: tracker.traded_notional,
        vwap: tracker.vwap(),
        price_high: tracker.price_high,
        price_low: tracker.price_low,
        mark_px_entry: tracker.mark_first,
        mark_px_exit: tracker.mark_last,
        mark_delta_bps,
        mark_high: tracker.mark_high,
        mark_low: tracker.mark_low,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::types::{AggTrade, FundingInfo};

    fn state(side: Side) -> PositionState {
        PositionState {
            symbol: "BTCUSDT".to_string(),
            side,
            qty: 0.002,
            entry_vwap_px: 60000.0,
            entry_order_id: 1,
            entry_send_time_ms: 1_000,
            opened_time_ms: 2_000,
            armed: ArmedExits::default(),
            opening_loss_bps: 0.5,
            funding_bps_at_entry: 1.0,
        }
    }

    fn stats(qty: f64, notional: f64, fees: f64) -> OrderTradeStats {
        OrderTradeStats {
            qty,
            notional,
            fees,
            avg_px: if qty > 0.0 { Some(notional / qty) } else { None },
            last_time_ms: Some(5_000),
        }
    }

    fn snap_with_trades(trades: Vec<AggTrade>, mark: Option<f64>) -> MarketSnapshot {
        MarketSnapshot {
            symbol: "BTCUSDT".to_string(),
            trades_1s: trades,
            funding: mark.map(|mark_px| FundingInfo {
                symbol: "BTCUSDT".to_string(),
                event_time_ms: 0,
                mark_px,
                index_px: mark_px,
                funding_rate: 0.0,
                next_funding_time_ms: 0,
            }),
            ..Default::default()
        }
    }

    fn agg(id: i64, price: f64, qty: f64) -> AggTrade {
        AggTrade {
            symbol: "BTCUSDT".to_string(),
            event_time_ms: id,
            trade_time_ms: id,
            agg_id: id,
            price,
            qty,
            is_buyer_maker: false,
        }
    }

    #[test]
    fn test_one_position_per_symbol() {
        let mut pm = PositionManager::new();
        pm.open(state(Side::Buy)).unwrap();
        assert!(pm.has_position("BTCUSDT"));
        assert!(pm.open(state(Side::Sell)).is_err());
        assert_eq!(pm.len(), 1);

        pm.remove("BTCUSDT").unwrap();
        assert!(pm.open(state(Side::Sell)).is_ok());
    }

    #[test]
    fn test_tracker_dedupes_overlapping_snapshots() {
        let mut tracker = TradeTracker::default();
        tracker.observe(&snap_with_trades(
            vec![agg(1, 100.0, 1.0), agg(2, 101.0, 2.0)],
            Some(100.5),
        ));
        // Overlap: trade 2 appears again alongside trade 3
        tracker.observe(&snap_with_trades(
            vec![agg(2, 101.0, 2.0), agg(3, 99.0, 1.0)],
            Some(99.5),
        ));

        assert_eq!(tracker.trades_seen, 3);
        assert!((tracker.traded_volume - 4.0).abs() < 1e-12);
        assert_eq!(tracker.price_high, Some(101.0));
        assert_eq!(tracker.price_low, Some(99.0));
        assert_eq!(tracker.mark_first, Some(100.5));
        assert_eq!(tracker.mark_last, Some(99.5));
        assert_eq!(tracker.mark_high, Some(100.5));
        assert_eq!(tracker.mark_low, Some(99.5));
        // vwap = (100*1 + 101*2 + 99*1) / 4
        assert!((tracker.vwap().unwrap() - 100.25).abs() < 1e-12);
    }

    #[test]
    fn test_trade_record_pnl_identities_long() {
        let entry = stats(0.002, 120.0, 0.048);
        let exit = stats(0.002, 120.24, 0.048);
        let record = build_trade_record(
            &state(Side::Buy),
            &TradeTracker::default(),
            ExitReason::TakeProfit,
            Some(9),
            &entry,
            &exit,
            8_000,
        );

        let entry_px = 120.0 / 0.002;
        let exit_px = 120.24 / 0.002;
        let raw = (exit_px - entry_px) / entry_px;
        let gross = 120.0 * raw;

        assert!((record.signed_return.unwrap() - raw).abs() < 1e-12);
        assert!((record.gross_pnl.unwrap() - gross).abs() < 1e-12);
        assert!((record.fees - 0.096).abs() < 1e-12);
        assert!((record.net_pnl.unwrap() - (gross - 0.096)).abs() < 1e-12);
        assert!((record.hold_secs - 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_trade_record_return_flipped_for_short() {
        let entry = stats(0.002, 120.0, 0.0);
        let exit = stats(0.002, 119.76, 0.0);
        let record = build_trade_record(
            &state(Side::Sell),
            &TradeTracker::default(),
            ExitReason::TakeProfit,
            None,
            &entry,
            &exit,
            8_000,
        );
        // Price fell, short profits
        assert!(record.signed_return.unwrap() > 0.0);
        assert!(record.gross_pnl.unwrap() > 0.0);
    }

    #[test]
    fn test_trade_record_without_exit_fills() {
        let entry = stats(0.002, 120.0, 0.048);
        let record = build_trade_record(
            &state(Side::Buy),
            &TradeTracker::default(),
            ExitReason::Unknown,
            None,
            &entry,
            &OrderTradeStats::default(),
            8_000,
        );
        assert!(record.exit_px.is_none());
        assert!(record.signed_return.is_none());
        assert!(record.net_pnl.is_none());
        // Entry fees are still known
        assert!((record.fees - 0.048).abs() < 1e-12);
    }

    #[test]
    fn test_trade_record_falls_back_to_local_hints() {
        let record = build_trade_record(
            &state(Side::Buy),
            &TradeTracker::default(),
            ExitReason::Unknown,
            None,
            &OrderTradeStats::default(),
            &OrderTradeStats::default(),
            8_000,
        );
        assert_eq!(record.entry_px, 60000.0);
        assert_eq!(record.qty, 0.002);
        assert!((record.fill_notional - 120.0).abs() < 1e-9);
    }
}
