// Core modules
pub mod api;
pub mod config;
pub mod engine;
pub mod execution;
pub mod market;
pub mod risk;
pub mod strategy;

// Re-export commonly used types
pub use api::{GatewayError, MarketEvent, Side};
pub use market::{MarketCache, MarketSnapshot};

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
