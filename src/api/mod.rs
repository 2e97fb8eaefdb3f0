// Exchange gateway: typed REST + stream access to the futures venue
pub mod rest;
pub mod types;
pub mod ws;

pub use rest::{RestClient, DEFAULT_REST_URL};
pub use types::{
    AccountSummary, AccountTrade, ExchangeInfo, MarketEvent, NewOrderRequest, OrderAck,
    OrderStatus, OrderType, PositionRisk, Side, SymbolInfo, TimeInForce, WorkingType,
};
pub use ws::{combined_stream_url, spawn_market_stream, StreamHandle, DEFAULT_WS_URL};

use thiserror::Error;

/// Errors surfaced by the exchange gateway.
///
/// `Rejected` carries the venue's error code and is the caller's signal that
/// retrying the same request will not help; `Transport` failures may be
/// transient.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("exchange rejected request (code {code}): {message}")]
    Rejected { code: i64, message: String },

    #[error("malformed payload: {0}")]
    Payload(String),
}

impl GatewayError {
    pub fn is_rejection(&self) -> bool {
        matches!(self, GatewayError::Rejected { .. })
    }
}
