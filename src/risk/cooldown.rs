use std::collections::HashMap;

/// Minimum spacing between forced-close attempts for one symbol
const FORCE_EXIT_THROTTLE_MS: i64 = 10_000;

/// Per-symbol timers: the post-trade entry cooldown and the forced-close
/// retry throttle.
#[derive(Debug, Default)]
pub struct Cooldowns {
    until_ms: HashMap<String, i64>,
    last_force_attempt_ms: HashMap<String, i64>,
}

impl Cooldowns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the entry cooldown after a position finalizes
    pub fn start(&mut self, symbol: &str, now_ms: i64, cooldown_ms: i64) {
        self.until_ms.insert(symbol.to_string(), now_ms + cooldown_ms);
    }

    pub fn in_cooldown(&self, symbol: &str, now_ms: i64) -> bool {
        self.until_ms
            .get(symbol)
            .is_some_and(|until| now_ms < *until)
    }

    /// Remaining cooldown for logging, zero when expired
    pub fn remaining_ms(&self, symbol: &str, now_ms: i64) -> i64 {
        self.until_ms
            .get(symbol)
            .map(|until| (until - now_ms).max(0))
            .unwrap_or(0)
    }

    /// Gate repeated forced-close attempts; records the attempt when allowed
    pub fn may_attempt_force_exit(&mut self, symbol: &str, now_ms: i64) -> bool {
        let allowed = self
            .last_force_attempt_ms
            .get(symbol)
            .is_none_or(|last| now_ms - last >= FORCE_EXIT_THROTTLE_MS);
        if allowed {
            self.last_force_attempt_ms.insert(symbol.to_string(), now_ms);
        }
        allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cooldown_window() {
        let mut cd = Cooldowns::new();
        assert!(!cd.in_cooldown("BTCUSDT", 0));

        cd.start("BTCUSDT", 1_000, 600_000);
        assert!(cd.in_cooldown("BTCUSDT", 1_000));
        assert!(cd.in_cooldown("BTCUSDT", 600_999));
        assert!(!cd.in_cooldown("BTCUSDT", 601_000));
        assert_eq!(cd.remaining_ms("BTCUSDT", 301_000), 300_000);
    }

    #[test]
    fn test_cooldowns_are_per_symbol() {
        let mut cd = Cooldowns::new();
        cd.start("BTCUSDT", 0, 600_000);
        assert!(cd.in_cooldown("BTCUSDT", 100));
        assert!(!cd.in_cooldown("ETHUSDT", 100));
    }

    #[test]
    fn test_force_exit_throttle() {
        let mut cd = Cooldowns::new();
        assert!(cd.may_attempt_force_exit("BTCUSDT", 0));
        assert!(!cd.may_attempt_force_exit("BTCUSDT", 5_000));
        assert!(cd.may_attempt_force_exit("BTCUSDT", 10_000));
        // Other symbols are unaffected
        assert!(cd.may_attempt_force_exit("ETHUSDT", 5_000));
    }
}
