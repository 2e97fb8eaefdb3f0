use chrono::{DateTime, NaiveDate, Utc};
use tracing::{info, warn};

/// Intraday drawdown kill-switch.
///
/// Tracks the peak margin balance observed since the start of the UTC day.
/// Once the balance falls from that peak by more than the configured
/// fraction, new entries stay blocked for the rest of the day even if the
/// balance recovers. Rolls over at UTC midnight.
#[derive(Debug)]
pub struct DrawdownTracker {
    max_drawdown_frac: f64,
    day: Option<NaiveDate>,
    day_start_balance: Option<f64>,
    peak_balance: f64,
    blocked: bool,
}

impl DrawdownTracker {
    pub fn new(max_drawdown_frac: f64) -> Self {
        Self {
            max_drawdown_frac,
            day: None,
            day_start_balance: None,
            peak_balance: 0.0,
            blocked: false,
        }
    }

    /// Balance first observed this UTC day, used as the sizing base
    pub fn day_start_balance(&self) -> Option<f64> {
        self.day_start_balance
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    /// Feed one balance observation; returns true when entries are blocked
    pub fn observe(&mut self, now: DateTime<Utc>, balance: f64) -> bool {
        let today = now.date_naive();
        if self.day != Some(today) {
            if self.day.is_some() {
                info!("UTC day rollover, drawdown tracker reset");
            }
            self.day = Some(today);
            self.day_start_balance = Some(balance);
            self.peak_balance = balance;
            self.blocked = false;
        }

        if balance > self.peak_balance {
            self.peak_balance = balance;
        }

        if !self.blocked && self.peak_balance > 0.0 {
            let drawdown = (self.peak_balance - balance) / self.peak_balance;
            if drawdown >= self.max_drawdown_frac {
                warn!(
                    "Daily drawdown {:.2}% >= {:.2}% limit, blocking entries until UTC midnight",
                    drawdown * 100.0,
                    self.max_drawdown_frac * 100.0
                );
                self.blocked = true;
            }
        }

        self.blocked
    }
}
