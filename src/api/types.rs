use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::market::types::{AggTrade, Bbo, FundingInfo, Kline, L2Depth};

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn is_long(&self) -> bool {
        matches!(self, Side::Buy)
    }

    /// Side implied by an exchange-reported signed position amount
    pub fn from_position_amt(amt: f64) -> Option<Side> {
        if amt > 0.0 {
            Some(Side::Buy)
        } else if amt < 0.0 {
            Some(Side::Sell)
        } else {
            None
        }
    }
}

/// Exchange order types used by this engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Limit,
    Market,
    TakeProfitMarket,
    StopMarket,
    TrailingStopMarket,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Limit => "LIMIT",
            OrderType::Market => "MARKET",
            OrderType::TakeProfitMarket => "TAKE_PROFIT_MARKET",
            OrderType::StopMarket => "STOP_MARKET",
            OrderType::TrailingStopMarket => "TRAILING_STOP_MARKET",
        }
    }
}

/// Trigger price basis for conditional orders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkingType {
    ContractPrice,
    MarkPrice,
}

impl WorkingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkingType::ContractPrice => "CONTRACT_PRICE",
            WorkingType::MarkPrice => "MARK_PRICE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeInForce {
    Ioc,
    Gtc,
}

impl TimeInForce {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeInForce::Ioc => "IOC",
            TimeInForce::Gtc => "GTC",
        }
    }
}

/// Tagged union of stream events; decoded once at the gateway boundary.
/// Downstream code matches on variants and never touches raw payload keys.
#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvent {
    Kline(Kline),
    BookTicker(Bbo),
    MarkPrice(FundingInfo),
    AggTrade(AggTrade),
    Depth(L2Depth),
}

// ============== Numeric coercion ==============
//
// The exchange mixes JSON numbers and numeric strings across endpoints.
// All coercion goes through these two helpers; nothing else in the crate
// parses wire numbers.

pub fn coerce_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

pub fn coerce_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .ok()
            .or_else(|| s.trim().parse::<f64>().ok().map(|f| f as i64)),
        _ => None,
    }
}

pub(crate) fn de_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    coerce_f64(&v).ok_or_else(|| serde::de::Error::custom(format!("expected number, got {v}")))
}

pub(crate) fn de_opt_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Option::<Value>::deserialize(deserializer)?;
    Ok(v.as_ref().and_then(coerce_f64))
}

// ============== REST payloads ==============

/// Everything `newOrder` accepts; optional fields are omitted from the wire
#[derive(Debug, Clone)]
pub struct NewOrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Option<f64>,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub time_in_force: Option<TimeInForce>,
    pub reduce_only: bool,
    pub activation_price: Option<f64>,
    pub callback_rate: Option<f64>,
    pub working_type: Option<WorkingType>,
    pub price_protect: bool,
}

impl NewOrderRequest {
    pub fn new(symbol: &str, side: Side, order_type: OrderType) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type,
            quantity: None,
            price: None,
            stop_price: None,
            time_in_force: None,
            reduce_only: false,
            activation_price: None,
            callback_rate: None,
            working_type: None,
            price_protect: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderAck {
    #[serde(rename = "orderId")]
    pub order_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderStatus {
    #[serde(rename = "orderId")]
    pub order_id: i64,
    pub status: String,
    #[serde(rename = "type", default)]
    pub order_type: String,
    #[serde(rename = "executedQty", deserialize_with = "de_f64", default)]
    pub executed_qty: f64,
    #[serde(rename = "avgPrice", deserialize_with = "de_opt_f64", default)]
    pub avg_price: Option<f64>,
    #[serde(rename = "updateTime", default)]
    pub update_time_ms: i64,
}

impl OrderStatus {
    pub fn is_filled(&self) -> bool {
        self.status == "FILLED"
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PositionRisk {
    pub symbol: String,
    #[serde(rename = "positionAmt", deserialize_with = "de_f64")]
    pub position_amt: f64,
    #[serde(rename = "entryPrice", deserialize_with = "de_opt_f64", default)]
    pub entry_price: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountSummary {
    #[serde(rename = "totalMarginBalance", deserialize_with = "de_opt_f64", default)]
    pub total_margin_balance: Option<f64>,
    #[serde(rename = "totalMaintMargin", deserialize_with = "de_opt_f64", default)]
    pub total_maint_margin: Option<f64>,
}

/// One account trade row (userTrades), used for fill reconciliation
#[derive(Debug, Clone, Deserialize)]
pub struct AccountTrade {
    #[serde(rename = "orderId")]
    pub order_id: i64,
    #[serde(deserialize_with = "de_f64")]
    pub price: f64,
    #[serde(deserialize_with = "de_f64")]
    pub qty: f64,
    #[serde(rename = "quoteQty", deserialize_with = "de_opt_f64", default)]
    pub quote_qty: Option<f64>,
    #[serde(deserialize_with = "de_opt_f64", default)]
    pub commission: Option<f64>,
    #[serde(rename = "time", default)]
    pub time_ms: i64,
}

// ============== exchangeInfo ==============

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeInfo {
    pub symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    #[serde(default)]
    pub filters: Vec<RawFilter>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawFilter {
    #[serde(rename = "filterType")]
    pub filter_type: String,
    #[serde(rename = "tickSize", deserialize_with = "de_opt_f64", default)]
    pub tick_size: Option<f64>,
    #[serde(rename = "stepSize", deserialize_with = "de_opt_f64", default)]
    pub step_size: Option<f64>,
    #[serde(rename = "minQty", deserialize_with = "de_opt_f64", default)]
    pub min_qty: Option<f64>,
    #[serde(rename = "maxQty", deserialize_with = "de_opt_f64", default)]
    pub max_qty: Option<f64>,
    #[serde(rename = "minNotional", deserialize_with = "de_opt_f64", default)]
    pub min_notional: Option<f64>,
    #[serde(deserialize_with = "de_opt_f64", default)]
    pub notional: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_side_helpers() {
        assert_eq!(Side::Buy.as_str(), "BUY");
        assert_eq!(Side::Sell.opposite(), Side::Buy);
        assert_eq!(Side::from_position_amt(0.5), Some(Side::Buy));
        assert_eq!(Side::from_position_amt(-0.5), Some(Side::Sell));
        assert_eq!(Side::from_position_amt(0.0), None);
    }

    #[test]
    fn test_coerce_f64() {
        assert_eq!(coerce_f64(&json!("1.25")), Some(1.25));
        assert_eq!(coerce_f64(&json!(1.25)), Some(1.25));
        assert_eq!(coerce_f64(&json!(" 2.0 ")), Some(2.0));
        assert_eq!(coerce_f64(&json!(null)), None);
        assert_eq!(coerce_f64(&json!("abc")), None);
        assert_eq!(coerce_f64(&json!([1])), None);
    }

    #[test]
    fn test_coerce_i64() {
        assert_eq!(coerce_i64(&json!("42")), Some(42));
        assert_eq!(coerce_i64(&json!(42)), Some(42));
        assert_eq!(coerce_i64(&json!("42.9")), Some(42));
        assert_eq!(coerce_i64(&json!(null)), None);
    }

    #[test]
    fn test_order_status_parses_string_fields() {
        let status: OrderStatus = serde_json::from_value(json!({
            "orderId": 123,
            "status": "FILLED",
            "type": "TAKE_PROFIT_MARKET",
            "executedQty": "0.500",
            "avgPrice": "25000.1",
            "updateTime": 1700000000000i64
        }))
        .unwrap();

        assert_eq!(status.order_id, 123);
        assert!(status.is_filled());
        assert_eq!(status.executed_qty, 0.5);
        assert_eq!(status.avg_price, Some(25000.1));
    }

    #[test]
    fn test_position_risk_parses() {
        let row: PositionRisk = serde_json::from_value(json!({
            "symbol": "BTCUSDT",
            "positionAmt": "-0.010",
            "entryPrice": "60000.0"
        }))
        .unwrap();
        assert_eq!(row.position_amt, -0.01);
        assert_eq!(Side::from_position_amt(row.position_amt), Some(Side::Sell));
    }

    #[test]
    fn test_exchange_info_filters() {
        let info: ExchangeInfo = serde_json::from_value(json!({
            "symbols": [{
                "symbol": "BTCUSDT",
                "filters": [
                    {"filterType": "PRICE_FILTER", "tickSize": "0.10"},
                    {"filterType": "LOT_SIZE", "stepSize": "0.001", "minQty": "0.001", "maxQty": "500"},
                    {"filterType": "MIN_NOTIONAL", "notional": "5"}
                ]
            }]
        }))
        .unwrap();

        assert_eq!(info.symbols.len(), 1);
        let filters = &info.symbols[0].filters;
        assert_eq!(filters[0].tick_size, Some(0.1));
        assert_eq!(filters[1].step_size, Some(0.001));
        assert_eq!(filters[2].notional, Some(5.0));
    }
}
