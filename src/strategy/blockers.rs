use crate::api::Side;
use crate::market::types::{Bbo, FundingInfo};

/// Hard floor/cap on the dynamic opening-loss limit, in basis points
const OPENING_LOSS_FLOOR_BPS: f64 = 5.0;
const OPENING_LOSS_CAP_BPS: f64 = 10.0;

/// Microstructure limits applied after a signal fires and before any order
/// goes out
#[derive(Debug, Clone)]
pub struct BlockerConfig {
    /// Widest acceptable bid/ask spread, in quote units
    pub max_spread: f64,
    pub max_funding_abs_bps: f64,
}

impl Default for BlockerConfig {
    fn default() -> Self {
        Self {
            max_spread: 0.2,
            max_funding_abs_bps: 1.5,
        }
    }
}

/// One reason an otherwise-valid signal must not become an order
#[derive(Debug, Clone, PartialEq)]
pub enum Blocker {
    NoBbo,
    NoFunding,
    WideSpread { spread: f64, limit: f64 },
    ExtremeFunding { funding_bps: f64, limit_bps: f64 },
    CostlyEntry { opening_loss_bps: f64, limit_bps: f64 },
}

impl Blocker {
    pub fn describe(&self) -> String {
        match self {
            Blocker::NoBbo => "no book ticker".to_string(),
            Blocker::NoFunding => "no funding data".to_string(),
            Blocker::WideSpread { spread, limit } => {
                format!("spread {spread:.4} > {limit:.4}")
            }
            Blocker::ExtremeFunding { funding_bps, limit_bps } => {
                format!("|funding| {:.3}bps > {limit_bps:.3}bps", funding_bps.abs())
            }
            Blocker::CostlyEntry { opening_loss_bps, limit_bps } => {
                format!("opening loss {opening_loss_bps:.3}bps > {limit_bps:.3}bps")
            }
        }
    }
}

/// Result of the blocker pass; entry proceeds only when clear
#[derive(Debug, Clone, Default)]
pub struct BlockerReport {
    pub blockers: Vec<Blocker>,
}

impl BlockerReport {
    pub fn is_clear(&self) -> bool {
        self.blockers.is_empty()
    }

    pub fn describe(&self) -> String {
        self.blockers
            .iter()
            .map(Blocker::describe)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Immediate mark-to-market disadvantage of crossing the book, in signed
/// basis points of mark: buys fill at the ask and mark back to mark price,
/// sells fill at the bid. Negative when the touch is inside the mark.
pub fn opening_loss_bps(side: Side, bbo: &Bbo, mark_px: f64) -> Option<f64> {
    if mark_px <= 0.0 {
        return None;
    }
    let loss = match side {
        Side::Buy => bbo.ask_px - mark_px,
        Side::Sell => mark_px - bbo.bid_px,
    };
    Some(1e4 * loss / mark_px)
}

/// Dynamic cap on acceptable opening loss: twice the current spread, floored
/// and capped to fixed bounds
pub fn opening_loss_limit_bps(spread_bps: f64) -> f64 {
    OPENING_LOSS_CAP_BPS.min(OPENING_LOSS_FLOOR_BPS.max(2.0 * spread_bps))
}

pub fn check_entry_blockers(
    side: Side,
    bbo: Option<&Bbo>,
    funding: Option<&FundingInfo>,
    config: &BlockerConfig,
) -> BlockerReport {
    let mut report = BlockerReport::default();

    match bbo.and_then(|b| b.spread_bps().map(|s| (b, s))) {
        None => report.blockers.push(Blocker::NoBbo),
        Some((bbo, spread_bps)) => {
            // The spread limit is absolute; only the opening-loss cap below
            // works in basis points
            if bbo.spread() > config.max_spread {
                report.blockers.push(Blocker::WideSpread {
                    spread: bbo.spread(),
                    limit: config.max_spread,
                });
            }
            if let Some(loss_bps) =
                funding.and_then(|f| opening_loss_bps(side, bbo, f.mark_px))
            {
                let limit_bps = opening_loss_limit_bps(spread_bps);
                if loss_bps > limit_bps {
                    report.blockers.push(Blocker::CostlyEntry {
                        opening_loss_bps: loss_bps,
                        limit_bps,
                    });
                }
            }
        }
    }

    match funding {
        None => report.blockers.push(Blocker::NoFunding),
        Some(f) => {
            let funding_bps = f.funding_bps();
            if funding_bps.abs() > config.max_funding_abs_bps {
                report.blockers.push(Blocker::ExtremeFunding {
                    funding_bps,
                    limit_bps: config.max_funding_abs_bps,
                });
            }
        }
    }

    report
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

    fn funding(rate: f64) -> FundingInfo {
        FundingInfo {
            symbol: "BTCUSDT".to_string(),
            event_time_ms: 0,
            mark_px: 60000.0,
            index_px: 60000.0,
            funding_rate: rate,
            next_funding_time_ms: 0,
        }
    }

    #[test]
    fn test_clear_when_tight_and_calm() {
        // 0.1-unit spread, 1bps funding
        let report = check_entry_blockers(
            Side::Buy,
            Some(&bbo(60000.0, 60000.1)),
            Some(&funding(0.0001)),
            &BlockerConfig::default(),
        );
        assert!(report.is_clear(), "blockers: {}", report.describe());
    }

    #[test]
    fn test_wide_spread_blocks() {
        // 60000/60010 -> 10 quote units against the 0.2 limit
        let report = check_entry_blockers(
            Side::Buy,
            Some(&bbo(60000.0, 60010.0)),
            Some(&funding(0.0)),
            &BlockerConfig::default(),
        );
        assert!(report
            .blockers
            .iter()
            .any(|b| matches!(b, Blocker::WideSpread { .. })));
    }

    #[test]
    fn test_spread_limit_is_absolute_not_relative() {
        // 0.15 units on a 100-priced symbol is 15bps but still inside the
        // 0.2-unit limit
        let mut f = funding(0.0);
        f.mark_px = 100.075;
        let report = check_entry_blockers(
            Side::Buy,
            Some(&bbo(100.0, 100.15)),
            Some(&f),
            &BlockerConfig::default(),
        );
        assert!(
            !report
                .blockers
                .iter()
                .any(|b| matches!(b, Blocker::WideSpread { .. })),
            "blockers: {}",
            report.describe()
        );
    }

    #[test]
    fn test_extreme_funding_blocks_both_signs() {
        let config = BlockerConfig::default();
        for rate in [0.0002, -0.0002] {
            // 2bps beyond the 1.5bps limit
            let report = check_entry_blockers(
                Side::Buy,
                Some(&bbo(60000.0, 60000.1)),
                Some(&funding(rate)),
                &config,
            );
            assert!(report
                .blockers
                .iter()
                .any(|b| matches!(b, Blocker::ExtremeFunding { .. })));
        }
    }

    #[test]
    fn test_missing_data_blocks() {
        let report = check_entry_blockers(Side::Buy, None, None, &BlockerConfig::default());
        assert!(report.blockers.contains(&Blocker::NoBbo));
        assert!(report.blockers.contains(&Blocker::NoFunding));
    }

    #[test]
    fn test_opening_loss_is_signed_and_side_aware() {
        // Mark sits mid-book: buy pays half the spread, sell pays the other
        let b = bbo(59994.0, 60006.0);
        let buy = opening_loss_bps(Side::Buy, &b, 60000.0).unwrap();
        let sell = opening_loss_bps(Side::Sell, &b, 60000.0).unwrap();
        assert!((buy - 1.0).abs() < 1e-9);
        assert!((sell - 1.0).abs() < 1e-9);

        // Mark above the ask: buying is better than mark, loss goes negative
        let cheap_buy = opening_loss_bps(Side::Buy, &b, 60010.0).unwrap();
        assert!(cheap_buy < 0.0);

        assert_eq!(opening_loss_bps(Side::Buy, &b, 0.0), None);
    }

    #[test]
    fn test_costly_entry_blocks_when_mark_is_far() {
        // Tight book (cap floors at 5bps) but mark sits ~12.5bps below the
        // ask, so a buy is immediately under water past the cap
        let config = BlockerConfig {
            max_spread: 100.0,
            max_funding_abs_bps: 1.5,
        };
        let mut f = funding(0.0);
        f.mark_px = 59930.0;
        let b = bbo(59995.0, 60005.0);
        let report = check_entry_blockers(Side::Buy, Some(&b), Some(&f), &config);
        assert!(report
            .blockers
            .iter()
            .any(|b| matches!(b, Blocker::CostlyEntry { .. })));
    }

    #[test]
    fn test_opening_loss_limit_bounds() {
        // Tight spread: floor applies
        assert_eq!(opening_loss_limit_bps(0.5), 5.0);
        // Mid spread: 2x applies
        assert!((opening_loss_limit_bps(3.0) - 6.0).abs() < 1e-12);
        // Wide spread: cap applies
        assert_eq!(opening_loss_limit_bps(8.0), 10.0);
    }
}
