// Account-level protections: drawdown kill-switch, margin watchdog, cooldowns
pub mod cooldown;
pub mod drawdown;
pub mod margin;

pub use cooldown::Cooldowns;
pub use drawdown::DrawdownTracker;
pub use margin::{is_breached, safety_multiple};
