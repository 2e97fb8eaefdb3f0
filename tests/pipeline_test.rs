//! End-to-end wiring of the market cache, signal engine, blockers, and risk
//! gates, with no network involved.

use breakerbot::api::{MarketEvent, Side};
use breakerbot::execution::{plan_exit_levels, ExitConfig, RoundMode, SymbolFilters};
use breakerbot::market::{Bbo, FundingInfo, Kline, MarketCache};
use breakerbot::risk::{Cooldowns, DrawdownTracker};
use breakerbot::strategy::{
    check_entry_blockers, BlockerConfig, SignalConfig, SignalEngine, SignalReport,
};
use chrono::{TimeZone, Utc};

fn closed_kline(symbol: &str, start_min: i64, open: f64, close: f64, vol: f64) -> Kline {
    Kline {
        symbol: symbol.to_string(),
        event_time_ms: start_min * 60_000 + 59_999,
        start_time_ms: start_min * 60_000,
        close_time_ms: start_min * 60_000 + 59_999,
        interval: "1m".to_string(),
        open,
        high: open.max(close) * 1.001,
        low: open.min(close) * 0.999,
        close,
        base_vol: vol,
        quote_vol: vol * close,
        num_trades: 25,
        is_closed: true,
    }
}

#[test]
fn test_breakout_flows_from_candles_to_signal() {
    // 2-minute derived bars for the journal side, 3-bar signal windows
    let cache = MarketCache::new(2, 5000);
    let mut signals = SignalEngine::new(SignalConfig {
        breakout_mult: 1.3,
        vol_window: 3,
        volume_mult: 1.3,
        volume_window: 3,
    });

    fn feed(
        cache: &MarketCache,
        signals: &mut SignalEngine,
        minute: &mut i64,
        close: f64,
        vol: f64,
    ) -> Option<breakerbot::strategy::SignalEvaluation> {
        cache.update(MarketEvent::Kline(closed_kline("BTCUSDT", *minute, close, close, vol)));
        *minute += 1;
        let snap = cache.snapshot("BTCUSDT", *minute * 60_000, 1_000);
        let bar = snap.kline_1m.expect("latest candle in snapshot");
        assert!(bar.is_closed);
        match signals.on_bar(&bar) {
            SignalReport::Evaluated(eval) => Some(eval),
            _ => None,
        }
    }

    // Warmup: flat closes on steady volume, one evaluation per closed minute
    let mut minute = 0i64;
    for _ in 0..4 {
        let eval = feed(&cache, &mut signals, &mut minute, 100.0, 10.0);
        assert!(eval.is_none_or(|e| !e.triggered()));
    }

    // Breakout: +3% close on 10x volume
    let last = feed(&cache, &mut signals, &mut minute, 103.0, 100.0)
        .expect("breakout bar evaluated");
    assert!(last.breakout);
    assert!(last.volume_surge);
    assert_eq!(last.direction, Some(Side::Buy));
    assert!(last.triggered());

    // The cache kept deriving tumbling bars alongside
    assert_eq!(cache.derived_bar_count("BTCUSDT"), 2);
}

#[test]
fn test_blockers_veto_a_live_signal() {
    let config = BlockerConfig::default();
    let wide = Bbo {
        symbol: "BTCUSDT".to_string(),
        event_time_ms: 0,
        bid_px: 60000.0,
        bid_qty: 1.0,
        ask_px: 60012.0,
        ask_qty: 1.0,
    };
    let hot_funding = FundingInfo {
        symbol: "BTCUSDT".to_string(),
        event_time_ms: 0,
        mark_px: 60000.0,
        index_px: 60000.0,
        funding_rate: 0.0003,
        next_funding_time_ms: 0,
    };

    let report = check_entry_blockers(Side::Buy, Some(&wide), Some(&hot_funding), &config);
    assert!(!report.is_clear());
    // Both the spread and the funding rate exceed their limits
    assert!(report.blockers.len() >= 2);
}

#[test]
fn test_drawdown_block_survives_recovery_until_rollover() {
    let mut drawdown = DrawdownTracker::new(0.05);
    let day1 = |h| Utc.with_ymd_and_hms(2026, 8, 30, h, 0, 0).unwrap();

    drawdown.observe(day1(0), 1000.0);
    assert!(drawdown.observe(day1(8), 948.0));
    assert!(drawdown.observe(day1(12), 995.0));

    let day2 = Utc.with_ymd_and_hms(2026, 8, 31, 0, 0, 0).unwrap();
    assert!(!drawdown.observe(day2, 995.0));
    assert_eq!(drawdown.day_start_balance(), Some(995.0));
}

#[test]
fn test_cooldown_blocks_reentry_after_close() {
    let mut cooldowns = Cooldowns::new();
    let close_ms = 1_000_000;
    cooldowns.start("BTCUSDT", close_ms, 600_000);

    assert!(cooldowns.in_cooldown("BTCUSDT", close_ms + 599_999));
    assert!(!cooldowns.in_cooldown("BTCUSDT", close_ms + 600_000));
    assert!(!cooldowns.in_cooldown("ETHUSDT", close_ms));
}

#[test]
fn test_exit_levels_land_on_exchange_grid() {
    let filters = SymbolFilters {
        tick_size: Some(0.1),
        step_size: Some(0.001),
        min_qty: Some(0.001),
        max_qty: Some(500.0),
        min_notional: Some(5.0),
    };
    let levels = plan_exit_levels(Side::Buy, 60000.0, 0.3, 0.8, &ExitConfig::default());

    let tp = filters.round_price(levels.take_profit_px, RoundMode::Down);
    let sl = filters.round_price(levels.stop_loss_px, RoundMode::Down);
    let act = filters.round_price(levels.activation_px, RoundMode::Down);

    for px in [tp, sl, act] {
        let steps = px / 0.1;
        assert!((steps - steps.round()).abs() < 1e-6, "{px} off the 0.1 grid");
    }
    // Ordering survives rounding: stop < entry < activation < take-profit
    assert!(sl < 60000.0);
    assert!(act > 60000.0);
    assert!(tp > act);
}

#[test]
fn test_trade_recency_window_matches_snapshot() {
    use breakerbot::market::AggTrade;

    let cache = MarketCache::default();
    for (id, ms) in [(1, 1_000), (2, 98_700), (3, 99_400)] {
        cache.update(MarketEvent::AggTrade(AggTrade {
            symbol: "BTCUSDT".to_string(),
            event_time_ms: ms,
            trade_time_ms: ms,
            agg_id: id,
            price: 100.0,
            qty: 1.0,
            is_buyer_maker: false,
        }));
    }

    let snap = cache.snapshot("BTCUSDT", 99_500, 1_000);
    let ids: Vec<i64> = snap.trades_1s.iter().map(|t| t.agg_id).collect();
    assert_eq!(ids, vec![2, 3]);
}
