use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::api::{
    GatewayError, NewOrderRequest, OrderStatus, OrderType, RestClient, Side, TimeInForce,
    WorkingType,
};
use crate::execution::filters::{FilterBook, RoundMode, SymbolFilters};
use crate::execution::ExitReason;
use crate::market::types::Bbo;

/// Minimum trailing callback the exchange accepts, as a fraction of price
const MIN_CALLBACK_RATE: f64 = 0.0001;

/// Protective-exit parameters, all in basis points of the entry price
#[derive(Debug, Clone)]
pub struct ExitConfig {
    pub taker_fee_bps: f64,
    pub take_profit_bps: f64,
    pub stop_loss_bps: f64,
    pub trailing_activation_bps: f64,
    pub breakeven_buffer_bps: f64,
    pub trailing_callback_bps: Option<f64>,
    pub min_tp_gap_bps: f64,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            taker_fee_bps: 4.0,
            take_profit_bps: 20.0,
            stop_loss_bps: 12.0,
            trailing_activation_bps: 8.0,
            breakeven_buffer_bps: 0.5,
            trailing_callback_bps: Some(6.0),
            min_tp_gap_bps: 4.0,
        }
    }
}

/// Planned protective-exit prices for one position
#[derive(Debug, Clone)]
pub struct ExitLevels {
    pub take_profit_px: f64,
    pub stop_loss_px: f64,
    pub activation_px: f64,
    pub callback_rate: f64,
    pub breakeven_floor_bps: f64,
    pub activation_bps: f64,
    pub take_profit_bps: f64,
}

/// Derive the three protective-exit levels from the entry price and current
/// costs.
///
/// The trailing activation is pushed out past the breakeven floor (round-trip
/// fees, entry slippage, a slice of funding) plus a buffer, so the trail can
/// never lock in a net loss. The take-profit then keeps a minimum gap above
/// the activation so the trail gets room to work before the hard target.
pub fn plan_exit_levels(
    side: Side,
    entry_px: f64,
    opening_loss_bps: f64,
    funding_bps: f64,
    config: &ExitConfig,
) -> ExitLevels {
    // A favorable entry (negative opening loss) must not shrink the floor
    // below round-trip fees
    let breakeven_floor_bps =
        2.0 * config.taker_fee_bps + opening_loss_bps.max(0.0) + funding_bps.abs() / 8.0;
    let activation_bps = config
        .trailing_activation_bps
        .max(breakeven_floor_bps + config.breakeven_buffer_bps);
    let take_profit_bps = config
        .take_profit_bps
        .max(activation_bps + config.min_tp_gap_bps);

    let sign = if side.is_long() { 1.0 } else { -1.0 };
    let take_profit_px = entry_px * (1.0 + sign * take_profit_bps / 1e4);
    let stop_loss_px = entry_px * (1.0 - sign * config.stop_loss_bps / 1e4);
    let activation_px = entry_px * (1.0 + sign * activation_bps / 1e4);

    let callback_rate = config
        .trailing_callback_bps
        .map(|bps| bps / 1e4)
        .unwrap_or_else(|| (activation_px - entry_px).abs() / entry_px)
        .max(MIN_CALLBACK_RATE);

    ExitLevels {
        take_profit_px,
        stop_loss_px,
        activation_px,
        callback_rate,
        breakeven_floor_bps,
        activation_bps,
        take_profit_bps,
    }
}

/// Entry limit price that crosses the touch: buys lift the ask (rounded up
/// to tick), sells hit the bid (rounded down)
pub fn entry_limit_price(side: Side, bbo: &Bbo, filters: &SymbolFilters) -> f64 {
    match side {
        Side::Buy => filters.round_price(bbo.ask_px, RoundMode::Up),
        Side::Sell => filters.round_price(bbo.bid_px, RoundMode::Down),
    }
}

/// Result of an immediate-or-cancel entry attempt
#[derive(Debug, Clone)]
pub enum EntryOutcome {
    Filled {
        order_id: i64,
        qty: f64,
        avg_px: f64,
    },
    /// IOC expired without executing anything
    NoFill,
    Rejected {
        code: i64,
        message: String,
    },
}

/// Exchange order ids of the armed protective exits. `complete` is false
/// when one or more triggers failed to arm.
#[derive(Debug, Clone, Default)]
pub struct ArmedExits {
    pub take_profit_id: Option<i64>,
    pub stop_loss_id: Option<i64>,
    pub trailing_id: Option<i64>,
    pub levels: Option<ExitLevels>,
}

impl ArmedExits {
    pub fn complete(&self) -> bool {
        self.take_profit_id.is_some() && self.stop_loss_id.is_some() && self.trailing_id.is_some()
    }

    pub fn ids(&self) -> Vec<i64> {
        [self.take_profit_id, self.stop_loss_id, self.trailing_id]
            .into_iter()
            .flatten()
            .collect()
    }
}

/// Fill statistics reconciled from the account trade history for one order
#[derive(Debug, Clone, Default)]
pub struct OrderTradeStats {
    pub qty: f64,
    pub notional: f64,
    pub fees: f64,
    pub avg_px: Option<f64>,
    pub last_time_ms: Option<i64>,
}

/// All order traffic for the engine: entries, protective exits, forced
/// closes, and fill reconciliation. Owns the symbol filter cache.
pub struct OrderPlacer {
    rest: RestClient,
    filters: Mutex<FilterBook>,
    exit_config: ExitConfig,
}

impl OrderPlacer {
    pub fn new(rest: RestClient, exit_config: ExitConfig) -> Self {
        Self {
            rest,
            filters: Mutex::new(FilterBook::default()),
            exit_config,
        }
    }

    pub fn exit_config(&self) -> &ExitConfig {
        &self.exit_config
    }

    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters> {
        let needs_fetch = self.filters.lock().unwrap().is_empty();
        if needs_fetch {
            let info = self
                .rest
                .get_exchange_info()
                .await
                .context("fetching exchange info")?;
            self.filters.lock().unwrap().populate(&info);
        }
        self.filters
            .lock()
            .unwrap()
            .get(symbol)
            .cloned()
            .with_context(|| format!("no exchange filters for {symbol}"))
    }

    /// Set leverage and isolated margin once at startup. A venue rejection
    /// for "already set" is not an error.
    pub async fn ensure_risk_setup(&self, symbol: &str, leverage: u32) -> Result<()> {
        self.rest
            .change_leverage(symbol, leverage)
            .await
            .with_context(|| format!("setting {symbol} leverage to {leverage}x"))?;
        match self.rest.change_margin_type(symbol, "ISOLATED").await {
            Ok(()) => {}
            Err(GatewayError::Rejected { code, .. }) if code == -4046 => {
                // Already isolated
            }
            Err(e) => return Err(e).with_context(|| format!("setting {symbol} margin type")),
        }
        info!("{} risk setup complete: {}x isolated", symbol, leverage);
        Ok(())
    }

    /// Submit an IOC limit entry crossing the touch for the target notional
    pub async fn submit_entry(
        &self,
        symbol: &str,
        side: Side,
        notional: f64,
        bbo: &Bbo,
    ) -> Result<EntryOutcome> {
        let filters = self.symbol_filters(symbol).await?;
        let price = entry_limit_price(side, bbo, &filters);
        let qty = match filters.qty_for_notional(notional, price) {
            Ok(q) => q,
            Err(e) => {
                return Ok(EntryOutcome::Rejected {
                    code: 0,
                    message: e.to_string(),
                })
            }
        };

        let mut req = NewOrderRequest::new(symbol, side, OrderType::Limit);
        req.quantity = Some(qty);
        req.price = Some(price);
        req.time_in_force = Some(TimeInForce::Ioc);

        let ack = match self.rest.new_order(&req).await {
            Ok(ack) => ack,
            Err(GatewayError::Rejected { code, message }) => {
                return Ok(EntryOutcome::Rejected { code, message })
            }
            Err(e) => return Err(e).context("submitting entry order"),
        };

        let status = self
            .rest
            .query_order(symbol, ack.order_id)
            .await
            .context("querying entry order after IOC")?;
        if status.executed_qty > 0.0 {
            let avg_px = status.avg_px_or(price);
            Ok(EntryOutcome::Filled {
                order_id: ack.order_id,
                qty: status.executed_qty,
                avg_px,
            })
        } else {
            Ok(EntryOutcome::NoFill)
        }
    }

    /// Arm the three exchange-native protective exits for a filled entry.
    ///
    /// Each trigger is attempted independently; a partial outcome is
    /// returned rather than unwinding, so the caller decides what to do
    /// with a position that is only partially protected.
    pub async fn arm_exit_triggers(
        &self,
        symbol: &str,
        side: Side,
        entry_px: f64,
        opening_loss_bps: f64,
        funding_bps: f64,
    ) -> Result<ArmedExits> {
        let filters = self.symbol_filters(symbol).await?;
        let levels = plan_exit_levels(side, entry_px, opening_loss_bps, funding_bps, &self.exit_config);
        let exit_side = side.opposite();

        let mut armed = ArmedExits {
            levels: Some(levels.clone()),
            ..Default::default()
        };

        let mut tp = NewOrderRequest::new(symbol, exit_side, OrderType::TakeProfitMarket);
        tp.stop_price = Some(filters.round_price(levels.take_profit_px, RoundMode::Down));
        tp.reduce_only = true;
        tp.working_type = Some(WorkingType::ContractPrice);
        tp.price_protect = true;
        armed.take_profit_id = self.try_arm(symbol, "take-profit", &tp).await;

        let mut sl = NewOrderRequest::new(symbol, exit_side, OrderType::StopMarket);
        sl.stop_price = Some(filters.round_price(levels.stop_loss_px, RoundMode::Down));
        sl.reduce_only = true;
        sl.working_type = Some(WorkingType::MarkPrice);
        sl.price_protect = true;
        armed.stop_loss_id = self.try_arm(symbol, "stop-loss", &sl).await;

        let mut tsl = NewOrderRequest::new(symbol, exit_side, OrderType::TrailingStopMarket);
        tsl.activation_price = Some(filters.round_price(levels.activation_px, RoundMode::Down));
        tsl.callback_rate = Some(levels.callback_rate);
        tsl.reduce_only = true;
        armed.trailing_id = self.try_arm(symbol, "trailing-stop", &tsl).await;

        Ok(armed)
    }

    async fn try_arm(&self, symbol: &str, label: &str, req: &NewOrderRequest) -> Option<i64> {
        match self.rest.new_order(req).await {
            Ok(ack) => {
                info!("{} {} armed, order id {}", symbol, label, ack.order_id);
                Some(ack.order_id)
            }
            Err(e) => {
                warn!("{} {} failed to arm: {}", symbol, label, e);
                None
            }
        }
    }

    /// Signed position amount reported by the exchange, zero when flat
    pub async fn position_amt(&self, symbol: &str) -> Result<f64> {
        let rows = self
            .rest
            .get_position_risk(symbol)
            .await
            .context("fetching position risk")?;
        Ok(rows
            .iter()
            .find(|r| r.symbol == symbol)
            .map(|r| r.position_amt)
            .unwrap_or(0.0))
    }

    /// Flatten whatever the exchange reports for this symbol with a
    /// reduce-only market order. Side and quantity come from the venue, not
    /// local state, so a desynced tracker cannot flip the position.
    pub async fn close_position(&self, symbol: &str) -> Result<Option<OrderStatus>> {
        let amt = self.position_amt(symbol).await?;
        let Some(position_side) = Side::from_position_amt(amt) else {
            return Ok(None);
        };

        let filters = self.symbol_filters(symbol).await?;
        let qty = filters.round_qty(amt.abs(), RoundMode::Down);
        if qty <= 0.0 {
            return Ok(None);
        }

        let mut req = NewOrderRequest::new(symbol, position_side.opposite(), OrderType::Market);
        req.quantity = Some(qty);
        req.reduce_only = true;

        let ack = self
            .rest
            .new_order(&req)
            .await
            .context("submitting close order")?;
        let status = self
            .rest
            .query_order(symbol, ack.order_id)
            .await
            .context("querying close order")?;
        info!(
            "{} closed {} {} via market order {}",
            symbol,
            position_side.opposite().as_str(),
            qty,
            ack.order_id
        );
        Ok(Some(status))
    }

    /// Query the armed exit orders and report which one filled, if any
    pub async fn detect_filled_exit(
        &self,
        symbol: &str,
        armed: &ArmedExits,
    ) -> Result<Option<(ExitReason, OrderStatus)>> {
        for id in armed.ids() {
            match self.rest.query_order(symbol, id).await {
                Ok(status) if status.is_filled() => {
                    let reason = ExitReason::from_label(&status.order_type);
                    return Ok(Some((reason, status)));
                }
                Ok(_) => {}
                Err(e) => warn!("{} exit order {} query failed: {}", symbol, id, e),
            }
        }
        Ok(None)
    }

    /// Cancel any still-working exit orders, skipping the one that filled.
    /// Cancel failures are logged and swallowed; the order is usually
    /// already gone.
    pub async fn cancel_sibling_exits(&self, symbol: &str, armed: &ArmedExits, except: Option<i64>) {
        for id in armed.ids() {
            if Some(id) == except {
                continue;
            }
            if let Err(e) = self.rest.cancel_order(symbol, id).await {
                if !e.is_rejection() {
                    warn!("{} cancel of exit order {} failed: {}", symbol, id, e);
                }
            }
        }
    }

    /// Sum the account trade rows for one order over a time window
    pub async fn order_trade_stats(
        &self,
        symbol: &str,
        order_id: i64,
        start_time_ms: i64,
        end_time_ms: i64,
    ) -> Result<OrderTradeStats> {
        let rows = self
            .rest
            .get_account_trades(symbol, start_time_ms, end_time_ms)
            .await
            .context("fetching account trades")?;

        let mut stats = OrderTradeStats::default();
        for row in rows.iter().filter(|r| r.order_id == order_id) {
            stats.qty += row.qty;
            stats.notional += row.quote_qty.unwrap_or(row.price * row.qty);
            stats.fees += row.commission.unwrap_or(0.0);
            stats.last_time_ms = Some(stats.last_time_ms.unwrap_or(0).max(row.time_ms));
        }
        if stats.qty > 0.0 {
            stats.avg_px = Some(stats.notional / stats.qty);
        }
        Ok(stats)
    }

    /// One account read for the risk loop: total margin balance and the
    /// margin safety multiple (None when no position is open)
    pub async fn account_health(&self) -> Result<(Option<f64>, Option<f64>)> {
        let account = self.rest.get_account().await.context("fetching account")?;
        let multiple = crate::risk::safety_multiple(
            account.total_margin_balance,
            account.total_maint_margin,
        );
        Ok((account.total_margin_balance, multiple))
    }
}

impl OrderStatus {
    fn avg_px_or(&self, fallback: f64) -> f64 {
        match self.avg_price {
            Some(px) if px > 0.0 => px,
            _ => fallback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbo(bid: f64, ask: f64) -> Bbo {
        Bbo {
            symbol: "BTCUSDT".to_string(),
            event_time_ms: 0,
            bid_px: bid,
            bid_qty: 1.0,
            ask_px: ask,
            ask_qty: 1.0,
        }
    }

    fn tick_filters() -> SymbolFilters {
        SymbolFilters {
            tick_size: Some(0.1),
            step_size: Some(0.001),
            min_qty: Some(0.001),
            max_qty: Some(500.0),
            min_notional: Some(5.0),
        }
    }

    #[test]
    fn test_entry_limit_price_crosses_touch() {
        let f = tick_filters();
        let b = bbo(60000.02, 60000.08);
        // Buy lifts the ask, rounded up; sell hits the bid, rounded down
        assert_eq!(entry_limit_price(Side::Buy, &b, &f), 60000.1);
        assert_eq!(entry_limit_price(Side::Sell, &b, &f), 60000.0);
    }

    #[test]
    fn test_plan_exit_levels_defaults_long() {
        let levels = plan_exit_levels(Side::Buy, 60000.0, 0.5, 1.0, &ExitConfig::default());

        // floor = 2*4 + 0.5 + 1/8 = 8.625; activation = max(8, 9.125)
        assert!((levels.breakeven_floor_bps - 8.625).abs() < 1e-9);
        assert!((levels.activation_bps - 9.125).abs() < 1e-9);
        // tp keeps the configured 20 since 9.125 + 4 < 20
        assert!((levels.take_profit_bps - 20.0).abs() < 1e-9);

        assert!(levels.take_profit_px > levels.activation_px);
        assert!(levels.activation_px > 60000.0);
        assert!(levels.stop_loss_px < 60000.0);
        assert!((levels.stop_loss_px - 60000.0 * (1.0 - 12.0 / 1e4)).abs() < 1e-6);
        // Configured 6bps callback
        assert!((levels.callback_rate - 0.0006).abs() < 1e-12);
    }

    #[test]
    fn test_negative_opening_loss_does_not_lower_floor() {
        let a = plan_exit_levels(Side::Buy, 100.0, -5.0, 0.0, &ExitConfig::default());
        let b = plan_exit_levels(Side::Buy, 100.0, 0.0, 0.0, &ExitConfig::default());
        assert!((a.breakeven_floor_bps - 8.0).abs() < 1e-9);
        assert!((a.breakeven_floor_bps - b.breakeven_floor_bps).abs() < 1e-12);
    }

    #[test]
    fn test_take_profit_pushed_past_activation_gap() {
        let config = ExitConfig {
            trailing_activation_bps: 18.0,
            ..ExitConfig::default()
        };
        let levels = plan_exit_levels(Side::Buy, 100.0, 0.0, 0.0, &config);
        assert!((levels.activation_bps - 18.0).abs() < 1e-9);
        // 18 + 4 gap beats the configured 20
        assert!((levels.take_profit_bps - 22.0).abs() < 1e-9);
    }

    #[test]
    fn test_plan_exit_levels_short_mirrors() {
        let long = plan_exit_levels(Side::Buy, 100.0, 0.0, 0.0, &ExitConfig::default());
        let short = plan_exit_levels(Side::Sell, 100.0, 0.0, 0.0, &ExitConfig::default());

        assert!(short.take_profit_px < 100.0);
        assert!(short.activation_px < 100.0);
        assert!(short.stop_loss_px > 100.0);
        assert!((long.take_profit_px - 100.0).abs() - (100.0 - short.take_profit_px).abs() < 1e-9);
    }

    #[test]
    fn test_derived_callback_rate_floored() {
        let config = ExitConfig {
            trailing_callback_bps: None,
            ..ExitConfig::default()
        };
        let levels = plan_exit_levels(Side::Buy, 100.0, 0.0, 0.0, &config);
        // Derived from the activation distance, never below the venue minimum
        let expected = ((levels.activation_px - 100.0).abs() / 100.0).max(MIN_CALLBACK_RATE);
        assert!((levels.callback_rate - expected).abs() < 1e-12);
        assert!(levels.callback_rate >= MIN_CALLBACK_RATE);
    }

    #[test]
    fn test_armed_exits_completeness() {
        let mut armed = ArmedExits::default();
        assert!(!armed.complete());
        armed.take_profit_id = Some(1);
        armed.stop_loss_id = Some(2);
        assert!(!armed.complete());
        armed.trailing_id = Some(3);
        assert!(armed.complete());
        assert_eq!(armed.ids(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_submit_entry_no_fill() {
        let mut server = mockito::Server::new_async().await;
        let _info = server
            .mock("GET", "/fapi/v1/exchangeInfo")
            .with_status(200)
            .with_body(
                r#"{"symbols":[{"symbol":"BTCUSDT","filters":[
                    {"filterType":"PRICE_FILTER","tickSize":"0.1"},
                    {"filterType":"LOT_SIZE","stepSize":"0.001","minQty":"0.001","maxQty":"500"},
                    {"filterType":"MIN_NOTIONAL","notional":"5"}]}]}"#,
            )
            .create_async()
            .await;
        let _order = server
            .mock("POST", "/fapi/v1/order")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"{"orderId": 777}"#)
            .create_async()
            .await;
        let _query = server
            .mock("GET", "/fapi/v1/order")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"{"orderId": 777, "status": "EXPIRED", "type": "LIMIT", "executedQty": "0"}"#)
            .create_async()
            .await;

        let rest = RestClient::new(&server.url())
            .with_credentials("key".to_string(), "secret".to_string());
        let placer = OrderPlacer::new(rest, ExitConfig::default());
        let outcome = placer
            .submit_entry("BTCUSDT", Side::Buy, 100.0, &bbo(60000.0, 60000.1))
            .await
            .unwrap();
        assert!(matches!(outcome, EntryOutcome::NoFill));
    }

    #[tokio::test]
    async fn test_close_position_when_flat() {
        let mut server = mockito::Server::new_async().await;
        let _risk = server
            .mock("GET", "/fapi/v2/positionRisk")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"[{"symbol":"BTCUSDT","positionAmt":"0.000","entryPrice":"0"}]"#)
            .create_async()
            .await;

        let rest = RestClient::new(&server.url())
            .with_credentials("key".to_string(), "secret".to_string());
        let placer = OrderPlacer::new(rest, ExitConfig::default());
        let closed = placer.close_position("BTCUSDT").await.unwrap();
        assert!(closed.is_none());
    }
}
