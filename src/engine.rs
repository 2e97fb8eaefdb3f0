use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::execution::order_placer::{ArmedExits, EntryOutcome, OrderTradeStats};
use crate::execution::{
    build_trade_record, Alerter, ExitReason, OrderPlacer, PositionManager, PositionState, TradeLog,
};
use crate::market::cache::{MarketCache, MarketSnapshot};
use crate::market::types::Kline;
use crate::risk::{is_breached, Cooldowns, DrawdownTracker};
use crate::strategy::{
    check_entry_blockers, opening_loss_bps, SignalEngine, SignalEvaluation, SignalReport,
};

/// Recent-trade window attached to each snapshot
const TRADE_LOOKBACK_MS: i64 = 1_000;
/// How far before the entry send time fill reconciliation looks back
const RECONCILE_LOOKBACK_MS: i64 = 15 * 60_000;

/// Sequential decision loop: one pass per second over every configured
/// symbol. All order traffic happens here, one step at a time, so no two
/// decisions ever race for the same position.
pub struct ControlLoop {
    config: AppConfig,
    cache: Arc<MarketCache>,
    signals: SignalEngine,
    drawdown: DrawdownTracker,
    cooldowns: Cooldowns,
    positions: PositionManager,
    placer: Option<Arc<OrderPlacer>>,
    trade_log: TradeLog,
    alerter: Box<dyn Alerter>,
    last_margin_multiple: Option<f64>,
    stop: Arc<AtomicBool>,
}

impl ControlLoop {
    pub fn new(
        config: AppConfig,
        cache: Arc<MarketCache>,
        placer: Option<Arc<OrderPlacer>>,
        alerter: Box<dyn Alerter>,
    ) -> Self {
        let signals = SignalEngine::new(config.signal.clone());
        let drawdown = DrawdownTracker::new(config.risk.max_daily_drawdown_frac);
        let trade_log = TradeLog::new(config.trade_log_dir.clone());
        Self {
            config,
            cache,
            signals,
            drawdown,
            cooldowns: Cooldowns::new(),
            positions: PositionManager::new(),
            placer,
            trade_log,
            alerter,
            last_margin_multiple: None,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Warm the signal windows from REST-seeded candles so evaluation does
    /// not wait a full window of live minutes after startup
    pub fn prime_signals(&mut self, klines: &[Kline]) {
        let mut primed = 0usize;
        for k in klines.iter().filter(|k| k.is_closed) {
            self.signals.on_bar(k);
            primed += 1;
        }
        if primed > 0 {
            info!("Signal windows primed with {} seeded candles", primed);
        }
    }

    pub fn open_position_count(&self) -> usize {
        self.positions.len()
    }

    pub async fn run(&mut self) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            "Control loop started for {} symbol(s){}",
            self.config.symbols.len(),
            if self.placer.is_none() { " (observe mode)" } else { "" }
        );
        while !self.stop.load(Ordering::SeqCst) {
            interval.tick().await;
            self.tick(Utc::now()).await;
        }
        info!("Control loop stopped");
    }

    /// One decision pass. Every step is fallible in isolation; a failure in
    /// one symbol never blocks the others.
    pub async fn tick(&mut self, now: DateTime<Utc>) {
        self.poll_account(now).await;

        let now_ms = now.timestamp_millis();
        for symbol in self.config.symbols.clone() {
            let snap = self.cache.snapshot(&symbol, now_ms, TRADE_LOOKBACK_MS);
            let signal = self.evaluate_signal(&snap);

            if self.positions.has_position(&symbol) {
                self.manage_open_position(&symbol, &snap, now).await;
            } else if self.drawdown.is_blocked() {
                self.sweep_residual(&symbol, ExitReason::DailyDrawdownBlock, now).await;
            } else if self.config.schedule.force_exit_due(now) {
                self.sweep_residual(&symbol, ExitReason::DailyCutoff, now).await;
            } else if let Some(eval) = signal {
                if eval.triggered() {
                    self.try_enter(&symbol, &eval, &snap, now).await;
                }
            }
        }
    }

    /// On shutdown: flatten anything still open and finalize it
    pub async fn flatten_all(&mut self) {
        for symbol in self.positions.open_symbols() {
            info!("{} flattening on shutdown", symbol);
            self.force_close(&symbol, ExitReason::DailyCutoff, Utc::now())
                .await;
        }
    }

    async fn poll_account(&mut self, now: DateTime<Utc>) {
        let Some(placer) = self.placer.clone() else {
            return;
        };
        match placer.account_health().await {
            Ok((balance, multiple)) => {
                if let Some(balance) = balance {
                    self.drawdown.observe(now, balance);
                }
                self.last_margin_multiple = multiple;
            }
            Err(e) => warn!("Account poll failed: {:#}", e),
        }
    }

    fn evaluate_signal(&mut self, snap: &MarketSnapshot) -> Option<SignalEvaluation> {
        let bar = snap.kline_1m.as_ref().filter(|k| k.is_closed)?;
        match self.signals.on_bar(bar) {
            SignalReport::Evaluated(eval) => {
                info!(
                    "{} bar eval: ret {:.2}bps vs ±{:.2}bps, vol {:.2} vs {:.2} avg{}",
                    eval.symbol,
                    eval.ret_bps,
                    eval.threshold_bps,
                    eval.bar_volume,
                    eval.avg_volume,
                    if eval.triggered() { " → SIGNAL" } else { "" }
                );
                Some(eval)
            }
            SignalReport::WarmingUp { have, need } => {
                debug!("{} warming up: {}/{} bars", bar.symbol, have, need);
                None
            }
            SignalReport::MissingOhlcv => {
                warn!("{} closed bar carried non-positive OHLCV, skipped", bar.symbol);
                None
            }
            SignalReport::FirstClose | SignalReport::Duplicate => None,
        }
    }

    // ============== Open position management ==============

    async fn manage_open_position(
        &mut self,
        symbol: &str,
        snap: &MarketSnapshot,
        now: DateTime<Utc>,
    ) {
        if let Some((_, tracker)) = self.positions.get_mut(symbol) {
            tracker.observe(snap);
        }
        let Some(placer) = self.placer.clone() else {
            return;
        };

        // Exit checks in priority order: kill-switches first, then the
        // flat-on-exchange check that infers which trigger fired, then the
        // margin watchdog
        if self.drawdown.is_blocked() {
            self.force_close(symbol, ExitReason::DailyDrawdownBlock, now).await;
            return;
        }
        if self.config.schedule.force_exit_due(now) {
            self.force_close(symbol, ExitReason::DailyCutoff, now).await;
            return;
        }

        match placer.position_amt(symbol).await {
            Ok(amt) if amt == 0.0 => {
                // Position left the book: ask the armed triggers which fired
                let armed = self
                    .positions
                    .get(symbol)
                    .map(|(state, _)| state.armed.clone())
                    .unwrap_or_default();
                let (reason, exit_order_id) =
                    match placer.detect_filled_exit(symbol, &armed).await {
                        Ok(Some((reason, status))) => (reason, Some(status.order_id)),
                        Ok(None) => {
                            warn!("{} flat on exchange with no filled trigger", symbol);
                            (ExitReason::Unknown, None)
                        }
                        Err(e) => {
                            warn!("{} exit detection failed: {:#}", symbol, e);
                            (ExitReason::Unknown, None)
                        }
                    };
                info!("{} position closed on exchange: {}", symbol, reason.as_str());
                self.finalize(symbol, reason, exit_order_id, now).await;
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("{} position poll failed: {:#}", symbol, e);
                return;
            }
        }

        if is_breached(self.last_margin_multiple, self.config.risk.min_margin_multiple) {
            self.force_close(symbol, ExitReason::Margin, now).await;
        }
    }

    /// With the drawdown block active or the daily cutoff passed, exposure
    /// the venue reports for a symbol with no local state still gets
    /// flattened. The close order is synthesized from the exchange side and
    /// size; nothing is journaled because there is no entry to reconcile
    /// against.
    async fn sweep_residual(&mut self, symbol: &str, reason: ExitReason, now: DateTime<Utc>) {
        let Some(placer) = self.placer.clone() else {
            return;
        };
        let now_ms = now.timestamp_millis();
        if !self.cooldowns.may_attempt_force_exit(symbol, now_ms) {
            return;
        }
        match placer.position_amt(symbol).await {
            Ok(amt) if amt != 0.0 => {
                warn!(
                    "{} untracked exchange position {}, closing ({})",
                    symbol,
                    amt,
                    reason.as_str()
                );
                match placer.close_position(symbol).await {
                    Ok(_) => {
                        info!("{} residual position closed ({})", symbol, reason.as_str());
                        self.cooldowns.start(symbol, now_ms, self.config.risk.cooldown_ms);
                    }
                    Err(e) => warn!("{} residual close failed, will retry: {:#}", symbol, e),
                }
            }
            Ok(_) => {}
            Err(e) => warn!("{} residual position poll failed: {:#}", symbol, e),
        }
    }

    async fn force_close(&mut self, symbol: &str, reason: ExitReason, now: DateTime<Utc>) {
        let now_ms = now.timestamp_millis();
        if !self.cooldowns.may_attempt_force_exit(symbol, now_ms) {
            return;
        }
        let Some(placer) = self.placer.clone() else {
            return;
        };
        info!("{} force close ({})", symbol, reason.as_str());
        match placer.close_position(symbol).await {
            Ok(closed) => {
                self.finalize(symbol, reason, closed.map(|s| s.order_id), now)
                    .await;
            }
            Err(e) => {
                warn!("{} force close failed, will retry: {:#}", symbol, e);
                self.alerter
                    .alert(&format!("{symbol} force close ({}) failed: {e:#}", reason.as_str()));
            }
        }
    }

    /// Tear down a finished position: cancel leftover triggers, reconcile
    /// fills from the account trade history, journal the result, and start
    /// the re-entry cooldown.
    async fn finalize(
        &mut self,
        symbol: &str,
        reason: ExitReason,
        exit_order_id: Option<i64>,
        now: DateTime<Utc>,
    ) {
        let Some((state, tracker)) = self.positions.remove(symbol) else {
            return;
        };
        let now_ms = now.timestamp_millis();

        if let Some(placer) = self.placer.clone() {
            placer.cancel_sibling_exits(symbol, &state.armed, exit_order_id).await;

            let window_start = state.entry_send_time_ms - RECONCILE_LOOKBACK_MS;
            let window_end = now_ms + 60_000;
            let entry_stats = self
                .reconcile(&placer, symbol, state.entry_order_id, window_start, window_end)
                .await;
            let exit_stats = match exit_order_id {
                Some(id) => self.reconcile(&placer, symbol, id, window_start, window_end).await,
                None => OrderTradeStats::default(),
            };

            let record = build_trade_record(
                &state,
                &tracker,
                reason,
                exit_order_id,
                &entry_stats,
                &exit_stats,
                now_ms,
            );
            match record.net_pnl {
                Some(net) => info!(
                    "{} {} closed ({}): net {:.4} after {:.4} fees over {:.0}s",
                    symbol,
                    record.side.as_str(),
                    reason.as_str(),
                    net,
                    record.fees,
                    record.hold_secs
                ),
                None => warn!(
                    "{} closed ({}) but exit fills were not reconciled",
                    symbol,
                    reason.as_str()
                ),
            }
            self.alerter.alert(&format!(
                "{symbol} trade closed ({}), net pnl {:?}",
                reason.as_str(),
                record.net_pnl
            ));
            if let Err(e) = self.trade_log.record(&record) {
                warn!("{} trade journal write failed: {:#}", symbol, e);
            }
        }

        self.cooldowns
            .start(symbol, now_ms, self.config.risk.cooldown_ms);
    }

    async fn reconcile(
        &self,
        placer: &OrderPlacer,
        symbol: &str,
        order_id: i64,
        start_ms: i64,
        end_ms: i64,
    ) -> OrderTradeStats {
        match placer.order_trade_stats(symbol, order_id, start_ms, end_ms).await {
            Ok(stats) => stats,
            Err(e) => {
                warn!("{} fill reconciliation for order {} failed: {:#}", symbol, order_id, e);
                OrderTradeStats::default()
            }
        }
    }

    // ============== Entry path ==============

    async fn try_enter(
        &mut self,
        symbol: &str,
        eval: &SignalEvaluation,
        snap: &MarketSnapshot,
        now: DateTime<Utc>,
    ) {
        let Some(direction) = eval.direction else {
            return;
        };
        let now_ms = now.timestamp_millis();

        if self.config.schedule.entries_halted(now) {
            debug!("{} signal ignored: entry window closed", symbol);
            return;
        }
        if self.drawdown.is_blocked() {
            info!("{} signal ignored: daily drawdown block active", symbol);
            return;
        }
        if self.cooldowns.in_cooldown(symbol, now_ms) {
            debug!(
                "{} signal ignored: cooling down for {}s",
                symbol,
                self.cooldowns.remaining_ms(symbol, now_ms) / 1000
            );
            return;
        }

        let report = check_entry_blockers(
            direction,
            snap.bbo.as_ref(),
            snap.funding.as_ref(),
            &self.config.blockers,
        );
        if !report.is_clear() {
            info!("{} signal blocked: {}", symbol, report.describe());
            return;
        }
        let Some(bbo) = &snap.bbo else {
            return;
        };
        if now_ms - bbo.event_time_ms > self.config.max_quote_age_ms {
            warn!(
                "{} signal ignored: quote is {}ms old",
                symbol,
                now_ms - bbo.event_time_ms
            );
            return;
        }

        let Some(placer) = self.placer.clone() else {
            info!(
                "[OBSERVE] {} would enter {} at ~{:.4} (ret {:.2}bps)",
                symbol,
                direction.as_str(),
                bbo.mid(),
                eval.ret_bps
            );
            return;
        };

        // Residual exposure on the venue means a previous teardown is
        // incomplete; never stack on top of it
        match placer.position_amt(symbol).await {
            Ok(amt) if amt != 0.0 => {
                warn!("{} signal ignored: residual exchange position {}", symbol, amt);
                return;
            }
            Err(e) => {
                warn!("{} entry skipped, position check failed: {:#}", symbol, e);
                return;
            }
            Ok(_) => {}
        }

        let Some(balance) = self.drawdown.day_start_balance() else {
            warn!("{} entry skipped: no balance observation yet", symbol);
            return;
        };
        let notional = self.config.default_notional(balance);
        let opening_loss = snap
            .funding
            .as_ref()
            .and_then(|f| opening_loss_bps(direction, bbo, f.mark_px))
            .unwrap_or(0.0);
        let funding_bps = snap.funding.as_ref().map(|f| f.funding_bps()).unwrap_or(0.0);
        let entry_send_time_ms = now_ms;

        match placer.submit_entry(symbol, direction, notional, bbo).await {
            Ok(EntryOutcome::Filled { order_id, qty, avg_px }) => {
                info!(
                    "🚀 {} entered {} {} @ {:.4} (order {})",
                    symbol,
                    direction.as_str(),
                    qty,
                    avg_px,
                    order_id
                );
                let armed = match placer
                    .arm_exit_triggers(symbol, direction, avg_px, opening_loss, funding_bps)
                    .await
                {
                    Ok(armed) => armed,
                    Err(e) => {
                        warn!("{} failed to arm exits: {:#}", symbol, e);
                        ArmedExits::default()
                    }
                };
                if !armed.complete() {
                    warn!(
                        "[EXIT_ARM_PARTIAL] {} only {} of 3 protective exits armed",
                        symbol,
                        armed.ids().len()
                    );
                    self.alerter.alert(&format!(
                        "{symbol} protective exits partially armed ({} of 3)",
                        armed.ids().len()
                    ));
                }
                let state = PositionState {
                    symbol: symbol.to_string(),
                    side: direction,
                    qty,
                    entry_vwap_px: avg_px,
                    entry_order_id: order_id,
                    entry_send_time_ms,
                    opened_time_ms: now_ms,
                    armed,
                    opening_loss_bps: opening_loss,
                    funding_bps_at_entry: funding_bps,
                };
                if let Err(e) = self.positions.open(state) {
                    warn!("{} position tracking failed: {:#}", symbol, e);
                }
            }
            Ok(EntryOutcome::NoFill) => {
                info!("{} IOC entry expired without filling", symbol);
            }
            Ok(EntryOutcome::Rejected { code, message }) => {
                warn!("{} entry rejected ({}): {}", symbol, code, message);
            }
            Err(e) => {
                warn!("{} entry failed: {:#}", symbol, e);
            }
        }
    }
}
