// Signal generation: volatility breakout detection and entry blockers
pub mod blockers;
pub mod breakout;

pub use blockers::{
    check_entry_blockers, opening_loss_bps, opening_loss_limit_bps, Blocker, BlockerConfig,
    BlockerReport,
};
pub use breakout::{rs_var, rs_vol_bps, SignalConfig, SignalEngine, SignalEvaluation, SignalReport};
