use std::collections::{HashMap, VecDeque};

use crate::api::Side;
use crate::market::types::Kline;

/// Volatility-breakout signal parameters
#[derive(Debug, Clone)]
pub struct SignalConfig {
    /// Return threshold multiplier applied to realized volatility
    pub breakout_mult: f64,
    /// Number of closed 1m bars in the realized-volatility window
    pub vol_window: usize,
    /// Volume surge multiplier applied to the trailing average volume
    pub volume_mult: f64,
    /// Number of closed 1m bars in the trailing volume average
    pub volume_window: usize,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            breakout_mult: 1.3,
            vol_window: 30,
            volume_mult: 1.3,
            volume_window: 30,
        }
    }
}

/// Rogers-Satchell single-bar variance. Zero when any OHLC value is not
/// positive, which keeps a bad bar from poisoning the window.
pub fn rs_var(open: f64, high: f64, low: f64, close: f64) -> f64 {
    if open <= 0.0 || high <= 0.0 || low <= 0.0 || close <= 0.0 {
        return 0.0;
    }
    (high / open).ln() * (high / close).ln() + (low / open).ln() * (low / close).ln()
}

/// Realized volatility in basis points from a window of per-bar variances
pub fn rs_vol_bps(vars: &VecDeque<f64>) -> f64 {
    if vars.is_empty() {
        return 0.0;
    }
    let mean = vars.iter().sum::<f64>() / vars.len() as f64;
    1e4 * mean.max(0.0).sqrt()
}

/// Full evaluation of one closed 1m bar
#[derive(Debug, Clone)]
pub struct SignalEvaluation {
    pub symbol: String,
    pub close_time_ms: i64,
    pub ret_bps: f64,
    pub rs_vol_bps: f64,
    pub threshold_bps: f64,
    pub bar_volume: f64,
    pub avg_volume: f64,
    pub breakout: bool,
    pub volume_surge: bool,
    pub direction: Option<Side>,
}

impl SignalEvaluation {
    /// Both indicators must agree before the engine considers an entry
    pub fn triggered(&self) -> bool {
        self.breakout && self.volume_surge && self.direction.is_some()
    }
}

/// Outcome of feeding one closed bar to the signal engine
#[derive(Debug, Clone)]
pub enum SignalReport {
    /// Same close time as the last processed bar; nothing to do
    Duplicate,
    /// First bar for this symbol establishes the return baseline
    FirstClose,
    /// Bar carried a non-positive OHLC value and was not evaluated
    MissingOhlcv,
    /// Windows not yet full
    WarmingUp { have: usize, need: usize },
    Evaluated(SignalEvaluation),
}

#[derive(Debug, Default)]
struct SignalState {
    rs_vars: VecDeque<f64>,
    volumes: VecDeque<f64>,
    prev_close: Option<f64>,
    last_close_time_ms: i64,
}

/// Per-symbol breakout detector fed one closed 1m bar per minute.
///
/// Each bar's variance and volume enter their windows before evaluation, so
/// the bar being judged is part of its own threshold and volume average.
pub struct SignalEngine {
    config: SignalConfig,
    states: HashMap<String, SignalState>,
}

impl SignalEngine {
    pub fn new(config: SignalConfig) -> Self {
        Self {
            config,
            states: HashMap::new(),
        }
    }

    pub fn on_bar(&mut self, bar: &Kline) -> SignalReport {
        let state = self.states.entry(bar.symbol.clone()).or_default();
        if bar.close_time_ms <= state.last_close_time_ms {
            return SignalReport::Duplicate;
        }
        state.last_close_time_ms = bar.close_time_ms;

        if bar.open <= 0.0 || bar.high <= 0.0 || bar.low <= 0.0 || bar.close <= 0.0 {
            return SignalReport::MissingOhlcv;
        }

        let prev_close = state.prev_close.replace(bar.close);

        state.rs_vars.push_back(rs_var(bar.open, bar.high, bar.low, bar.close));
        if state.rs_vars.len() > self.config.vol_window {
            state.rs_vars.pop_front();
        }
        state.volumes.push_back(bar.base_vol);
        if state.volumes.len() > self.config.volume_window {
            state.volumes.pop_front();
        }

        let Some(prev_close) = prev_close else {
            return SignalReport::FirstClose;
        };

        if state.rs_vars.len() < self.config.vol_window
            || state.volumes.len() < self.config.volume_window
        {
            return SignalReport::WarmingUp {
                have: state.rs_vars.len().min(state.volumes.len()),
                need: self.config.vol_window.max(self.config.volume_window),
            };
        }

        let ret_bps = 1e4 * (bar.close / prev_close - 1.0);
        let vol_bps = rs_vol_bps(&state.rs_vars);
        let threshold_bps = self.config.breakout_mult * vol_bps;
        let avg_volume = state.volumes.iter().sum::<f64>() / state.volumes.len() as f64;
        let breakout = ret_bps.abs() > threshold_bps;
        let volume_surge = bar.base_vol > self.config.volume_mult * avg_volume;
        let direction = if ret_bps > 0.0 {
            Some(Side::Buy)
        } else if ret_bps < 0.0 {
            Some(Side::Sell)
        } else {
            None
        };
        SignalReport::Evaluated(SignalEvaluation {
            symbol: bar.symbol.clone(),
            close_time_ms: bar.close_time_ms,
            ret_bps,
            rs_vol_bps: vol_bps,
            threshold_bps,
            bar_volume: bar.base_vol,
            avg_volume,
            breakout,
            volume_surge,
            direction,
        })
    }
}
