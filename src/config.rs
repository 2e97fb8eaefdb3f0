use std::env;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveTime, Utc};
use clap::Parser;

use crate::api::{DEFAULT_REST_URL, DEFAULT_WS_URL};
use crate::execution::ExitConfig;
use crate::strategy::{BlockerConfig, SignalConfig};

/// Automated perpetual-futures breakout engine
#[derive(Debug, Parser)]
#[command(name = "breakerbot", version, about)]
pub struct Cli {
    /// Symbols to trade, comma separated (e.g. BTCUSDT,ETHUSDT)
    #[arg(long, value_delimiter = ',', required = true)]
    pub symbols: Vec<String>,

    #[arg(long, default_value = DEFAULT_REST_URL)]
    pub rest_url: String,

    #[arg(long, default_value = DEFAULT_WS_URL)]
    pub ws_url: String,

    /// Return threshold multiplier on realized volatility
    #[arg(long, default_value_t = 1.3)]
    pub breakout_mult: f64,

    /// Closed 1m bars in the realized-volatility window
    #[arg(long, default_value_t = 30)]
    pub vol_window: usize,

    /// Volume surge multiplier on the trailing average
    #[arg(long, default_value_t = 1.3)]
    pub volume_mult: f64,

    /// Closed 1m bars in the trailing volume average
    #[arg(long, default_value_t = 30)]
    pub volume_window: usize,

    /// Widest acceptable bid/ask spread, in quote units
    #[arg(long, default_value_t = 0.2)]
    pub max_spread: f64,

    #[arg(long, default_value_t = 1.5)]
    pub max_funding_bps: f64,

    #[arg(long, default_value_t = 4.0)]
    pub taker_fee_bps: f64,

    #[arg(long, default_value_t = 20.0)]
    pub take_profit_bps: f64,

    #[arg(long, default_value_t = 12.0)]
    pub stop_loss_bps: f64,

    #[arg(long, default_value_t = 8.0)]
    pub trailing_activation_bps: f64,

    #[arg(long, default_value_t = 0.5)]
    pub breakeven_buffer_bps: f64,

    /// Trailing callback in bps; derived from the activation distance when
    /// omitted
    #[arg(long)]
    pub trailing_callback_bps: Option<f64>,

    #[arg(long, default_value_t = 4.0)]
    pub min_tp_gap_bps: f64,

    /// Margin balance over maintenance margin below which positions are
    /// force-closed
    #[arg(long, default_value_t = 1.2)]
    pub min_margin_multiple: f64,

    /// Daily drawdown from the intraday peak that blocks new entries, percent
    #[arg(long, default_value_t = 5.0)]
    pub max_daily_drawdown_pct: f64,

    /// Minutes to wait after a trade closes before re-entering the symbol
    #[arg(long, default_value_t = 10)]
    pub cooldown_mins: u64,

    #[arg(long, default_value_t = 25)]
    pub leverage: u32,

    /// Percent of the day-start balance committed as margin per trade
    #[arg(long, default_value_t = 1.0)]
    pub risk_pct: f64,

    /// UTC time after which no new entries are taken (HH:MM)
    #[arg(long, default_value = "23:00")]
    pub entry_halt: String,

    /// UTC time at which remaining positions are force-closed (HH:MM)
    #[arg(long, default_value = "23:50")]
    pub force_exit: String,

    /// Maximum quote age before entries are skipped, seconds
    #[arg(long, default_value_t = 10)]
    pub max_quote_age_secs: u64,

    /// Run the full pipeline without placing any orders
    #[arg(long, default_value_t = false)]
    pub observe: bool,

    #[arg(long, default_value = "trade_logs")]
    pub trade_log_dir: String,
}

/// Account-level risk limits
#[derive(Debug, Clone)]
pub struct RiskParams {
    pub min_margin_multiple: f64,
    pub max_daily_drawdown_frac: f64,
    pub cooldown_ms: i64,
    pub leverage: u32,
    pub risk_pct: f64,
}

/// Daily UTC schedule: entries halt first, then remaining positions are
/// flattened
#[derive(Debug, Clone, Copy)]
pub struct Schedule {
    pub entry_halt: NaiveTime,
    pub force_exit: NaiveTime,
}

impl Schedule {
    pub fn entries_halted(&self, now: DateTime<Utc>) -> bool {
        now.time() >= self.entry_halt
    }

    pub fn force_exit_due(&self, now: DateTime<Utc>) -> bool {
        now.time() >= self.force_exit
    }
}

/// Validated runtime configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub symbols: Vec<String>,
    pub rest_url: String,
    pub ws_url: String,
    pub signal: SignalConfig,
    pub blockers: BlockerConfig,
    pub exits: ExitConfig,
    pub risk: RiskParams,
    pub schedule: Schedule,
    pub max_quote_age_ms: i64,
    pub observe: bool,
    pub trade_log_dir: String,
}

pub fn parse_hhmm_utc(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .with_context(|| format!("invalid HH:MM time: {s:?}"))
}

impl AppConfig {
    pub fn from_cli(cli: Cli) -> Result<Self> {
        if cli.symbols.is_empty() {
            bail!("at least one symbol is required");
        }
        let symbols: Vec<String> = cli
            .symbols
            .iter()
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        if symbols.is_empty() {
            bail!("at least one symbol is required");
        }

        if cli.risk_pct <= 0.0 || cli.risk_pct > 100.0 {
            bail!("--risk-pct must be in (0, 100], got {}", cli.risk_pct);
        }
        if cli.leverage == 0 || cli.leverage > 125 {
            bail!("--leverage must be in 1..=125, got {}", cli.leverage);
        }
        if cli.max_daily_drawdown_pct <= 0.0 || cli.max_daily_drawdown_pct >= 100.0 {
            bail!(
                "--max-daily-drawdown-pct must be in (0, 100), got {}",
                cli.max_daily_drawdown_pct
            );
        }
        if cli.take_profit_bps <= 0.0 || cli.stop_loss_bps <= 0.0 {
            bail!("take-profit and stop-loss must be positive");
        }
        if cli.min_margin_multiple <= 1.0 {
            bail!(
                "--min-margin-multiple must exceed 1.0, got {}",
                cli.min_margin_multiple
            );
        }
        if cli.vol_window < 2 || cli.volume_window < 2 {
            bail!("signal windows must hold at least 2 bars");
        }

        let entry_halt = parse_hhmm_utc(&cli.entry_halt)?;
        let force_exit = parse_hhmm_utc(&cli.force_exit)?;
        if force_exit <= entry_halt {
            bail!(
                "--force-exit ({}) must come after --entry-halt ({})",
                cli.force_exit,
                cli.entry_halt
            );
        }

        Ok(AppConfig {
            symbols,
            rest_url: cli.rest_url,
            ws_url: cli.ws_url,
            signal: SignalConfig {
                breakout_mult: cli.breakout_mult,
                vol_window: cli.vol_window,
                volume_mult: cli.volume_mult,
                volume_window: cli.volume_window,
            },
            blockers: BlockerConfig {
                max_spread: cli.max_spread,
                max_funding_abs_bps: cli.max_funding_bps,
            },
            exits: ExitConfig {
                taker_fee_bps: cli.taker_fee_bps,
                take_profit_bps: cli.take_profit_bps,
                stop_loss_bps: cli.stop_loss_bps,
                trailing_activation_bps: cli.trailing_activation_bps,
                breakeven_buffer_bps: cli.breakeven_buffer_bps,
                trailing_callback_bps: cli.trailing_callback_bps,
                min_tp_gap_bps: cli.min_tp_gap_bps,
            },
            risk: RiskParams {
                min_margin_multiple: cli.min_margin_multiple,
                max_daily_drawdown_frac: cli.max_daily_drawdown_pct / 100.0,
                cooldown_ms: (cli.cooldown_mins as i64) * 60_000,
                leverage: cli.leverage,
                risk_pct: cli.risk_pct,
            },
            schedule: Schedule {
                entry_halt,
                force_exit,
            },
            max_quote_age_ms: (cli.max_quote_age_secs as i64) * 1000,
            observe: cli.observe,
            trade_log_dir: cli.trade_log_dir,
        })
    }

    /// Margin committed per trade times leverage, from the day-start balance
    pub fn default_notional(&self, day_start_balance: f64) -> f64 {
        day_start_balance * (self.risk.risk_pct / 100.0) * self.risk.leverage as f64
    }
}

/// Resolve a secret from the environment. The variable may hold either the
/// secret itself or a path to a file containing it.
pub fn read_secret(var: &str) -> Result<Option<String>> {
    match env::var(var) {
        Ok(value) => {
            let trimmed = value.trim().to_string();
            if trimmed.is_empty() {
                return Ok(None);
            }
            if Path::new(&trimmed).is_file() {
                let content = std::fs::read_to_string(&trimmed)
                    .with_context(|| format!("reading secret file for {var}"))?;
                Ok(Some(content.trim().to_string()))
            } else {
                Ok(Some(trimmed))
            }
        }
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn cli(extra: &[&str]) -> Cli {
        let mut args = vec!["breakerbot", "--symbols", "btcusdt,ethusdt"];
        args.extend_from_slice(extra);
        Cli::parse_from(args)
    }

    #[test]
    fn test_defaults_validate() {
        let config = AppConfig::from_cli(cli(&[])).unwrap();
        assert_eq!(config.symbols, vec!["BTCUSDT", "ETHUSDT"]);
        assert_eq!(config.signal.vol_window, 30);
        assert_eq!(config.risk.leverage, 25);
        assert_eq!(config.risk.cooldown_ms, 600_000);
        assert!((config.risk.max_daily_drawdown_frac - 0.05).abs() < 1e-12);
        assert_eq!(config.max_quote_age_ms, 10_000);
        assert!(!config.observe);
    }

    #[test]
    fn test_parse_hhmm() {
        assert_eq!(
            parse_hhmm_utc("23:50").unwrap(),
            NaiveTime::from_hms_opt(23, 50, 0).unwrap()
        );
        assert!(parse_hhmm_utc("25:00").is_err());
        assert!(parse_hhmm_utc("nope").is_err());
    }

    #[test]
    fn test_rejects_bad_risk_pct() {
        assert!(AppConfig::from_cli(cli(&["--risk-pct", "0"])).is_err());
        assert!(AppConfig::from_cli(cli(&["--risk-pct", "150"])).is_err());
    }

    #[test]
    fn test_rejects_inverted_schedule() {
        let result = AppConfig::from_cli(cli(&["--entry-halt", "23:50", "--force-exit", "23:00"]));
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_excess_leverage() {
        assert!(AppConfig::from_cli(cli(&["--leverage", "200"])).is_err());
    }

    #[test]
    fn test_default_notional() {
        let config = AppConfig::from_cli(cli(&[])).unwrap();
        // 1% of 1000 at 25x
        assert!((config.default_notional(1000.0) - 250.0).abs() < 1e-9);
    }

    #[test]
    fn test_schedule_gates() {
        let config = AppConfig::from_cli(cli(&[])).unwrap();
        let before = Utc.with_ymd_and_hms(2026, 8, 30, 22, 0, 0).unwrap();
        let halted = Utc.with_ymd_and_hms(2026, 8, 30, 23, 10, 0).unwrap();
        let cutoff = Utc.with_ymd_and_hms(2026, 8, 30, 23, 55, 0).unwrap();

        assert!(!config.schedule.entries_halted(before));
        assert!(config.schedule.entries_halted(halted));
        assert!(!config.schedule.force_exit_due(halted));
        assert!(config.schedule.force_exit_due(cutoff));
    }

    #[test]
    fn test_read_secret_inline_and_missing() {
        env::set_var("BREAKERBOT_TEST_SECRET", "s3cret");
        assert_eq!(
            read_secret("BREAKERBOT_TEST_SECRET").unwrap(),
            Some("s3cret".to_string())
        );
        env::remove_var("BREAKERBOT_TEST_SECRET");
        assert_eq!(read_secret("BREAKERBOT_TEST_SECRET").unwrap(), None);
    }

    #[test]
    fn test_read_secret_from_file() {
        let path = std::env::temp_dir().join(format!("secret_test_{}", std::process::id()));
        std::fs::write(&path, "file-secret\n").unwrap();
        env::set_var("BREAKERBOT_TEST_SECRET_FILE_VAR", path.to_str().unwrap());
        assert_eq!(
            read_secret("BREAKERBOT_TEST_SECRET_FILE_VAR").unwrap(),
            Some("file-secret".to_string())
        );
        env::remove_var("BREAKERBOT_TEST_SECRET_FILE_VAR");
        let _ = std::fs::remove_file(&path);
    }
}
