use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use serde_json::Value;
use sha2::Sha256;

use super::types::{
    coerce_f64, coerce_i64, AccountSummary, AccountTrade, ExchangeInfo, NewOrderRequest, OrderAck,
    OrderStatus, PositionRisk,
};
use super::GatewayError;
use crate::market::types::{AggTrade, Bbo, FundingInfo, Kline, L2Depth};

pub const DEFAULT_REST_URL: &str = "https://fapi.asterdex.com";
const DEFAULT_RECV_WINDOW_MS: u64 = 6000;

type HmacSha256 = Hmac<Sha256>;

/// Format a price/quantity for the wire: fixed decimals, trailing zeros trimmed
fn fmt_num(v: f64) -> String {
    let s = format!("{v:.8}");
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s.is_empty() {
        "0".to_string()
    } else {
        s.to_string()
    }
}

/// Some endpoints wrap their payload in a `data` envelope; peel it off
fn unwrap_data(v: Value) -> Value {
    match v {
        Value::Object(mut map) if map.contains_key("data") => map.remove("data").unwrap(),
        other => other,
    }
}

/// Signed REST client for the futures API
///
/// Public market-data endpoints work without credentials; order and account
/// endpoints require them.
#[derive(Clone)]
pub struct RestClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    api_secret: Option<String>,
    recv_window_ms: u64,
}

impl RestClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: None,
            api_secret: None,
            recv_window_ms: DEFAULT_RECV_WINDOW_MS,
        }
    }

    pub fn with_credentials(mut self, api_key: String, api_secret: String) -> Self {
        self.api_key = Some(api_key);
        self.api_secret = Some(api_secret);
        self
    }

    fn sign(&self, query: &str) -> Result<String, GatewayError> {
        let secret = self
            .api_secret
            .as_deref()
            .ok_or_else(|| GatewayError::Payload("missing API secret for signed request".into()))?;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| GatewayError::Payload(format!("hmac init failed: {e}")))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    async fn parse_response(resp: reqwest::Response) -> Result<Value, GatewayError> {
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            // Rejections come back as {"code": ..., "msg": ...}
            if let Ok(v) = serde_json::from_str::<Value>(&body) {
                let code = v.get("code").and_then(coerce_i64).unwrap_or(-1);
                let message = v
                    .get("msg")
                    .and_then(|m| m.as_str())
                    .unwrap_or(&body)
                    .to_string();
                return Err(GatewayError::Rejected { code, message });
            }
            return Err(GatewayError::Payload(format!(
                "HTTP {status}: {body}"
            )));
        }
        serde_json::from_str(&body)
            .map_err(|e| GatewayError::Payload(format!("bad JSON body: {e}")))
    }

    async fn get_public(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<Value, GatewayError> {
        let query: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query.join("&"))
        };
        let resp = self.client.get(&url).send().await?;
        Self::parse_response(resp).await.map(unwrap_data)
    }

    async fn send_signed(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<Value, GatewayError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| GatewayError::Payload("missing API key for signed request".into()))?;

        let mut parts: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
        parts.push(format!("timestamp={}", Utc::now().timestamp_millis()));
        parts.push(format!("recvWindow={}", self.recv_window_ms));
        let query = parts.join("&");
        let signature = self.sign(&query)?;
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);

        let resp = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", api_key)
            .send()
            .await?;
        Self::parse_response(resp).await.map(unwrap_data)
    }

    // ============== Public market data ==============

    pub async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Kline>, GatewayError> {
        let v = self
            .get_public(
                "/fapi/v1/klines",
                &[
                    ("symbol", symbol.to_string()),
                    ("interval", interval.to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;

        let rows = v
            .as_array()
            .ok_or_else(|| GatewayError::Payload("klines: expected array".into()))?;
        let now_ms = Utc::now().timestamp_millis();
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(k) = Self::kline_from_rest_row(symbol, interval, row, now_ms) {
                out.push(k);
            }
        }
        Ok(out)
    }

    fn kline_from_rest_row(symbol: &str, interval: &str, row: &Value, now_ms: i64) -> Option<Kline> {
        let cols = row.as_array()?;
        if cols.len() < 9 {
            return None;
        }
        let start_time_ms = coerce_i64(&cols[0])?;
        let close_time_ms = coerce_i64(&cols[6])?;
        Some(Kline {
            symbol: symbol.to_string(),
            event_time_ms: now_ms,
            start_time_ms,
            close_time_ms,
            interval: interval.to_string(),
            open: coerce_f64(&cols[1])?,
            high: coerce_f64(&cols[2])?,
            low: coerce_f64(&cols[3])?,
            close: coerce_f64(&cols[4])?,
            base_vol: coerce_f64(&cols[5])?,
            quote_vol: coerce_f64(&cols[7])?,
            num_trades: coerce_i64(&cols[8])?,
            is_closed: now_ms >= close_time_ms,
        })
    }

    pub async fn get_book_ticker(&self, symbol: &str) -> Result<Bbo, GatewayError> {
        let v = self
            .get_public("/fapi/v1/ticker/bookTicker", &[("symbol", symbol.to_string())])
            .await?;
        let bid_px = v.get("bidPrice").and_then(coerce_f64);
        let bid_qty = v.get("bidQty").and_then(coerce_f64);
        let ask_px = v.get("askPrice").and_then(coerce_f64);
        let ask_qty = v.get("askQty").and_then(coerce_f64);
        match (bid_px, bid_qty, ask_px, ask_qty) {
            (Some(bid_px), Some(bid_qty), Some(ask_px), Some(ask_qty)) => Ok(Bbo {
                symbol: symbol.to_string(),
                event_time_ms: v
                    .get("time")
                    .and_then(coerce_i64)
                    .unwrap_or_else(|| Utc::now().timestamp_millis()),
                bid_px,
                bid_qty,
                ask_px,
                ask_qty,
            }),
            _ => Err(GatewayError::Payload(format!("bookTicker: bad payload {v}"))),
        }
    }

    pub async fn get_mark_price(&self, symbol: &str) -> Result<FundingInfo, GatewayError> {
        let v = self
            .get_public("/fapi/v1/premiumIndex", &[("symbol", symbol.to_string())])
            .await?;
        let mark_px = v.get("markPrice").and_then(coerce_f64);
        let index_px = v.get("indexPrice").and_then(coerce_f64);
        let funding_rate = v.get("lastFundingRate").and_then(coerce_f64);
        let next_ft = v.get("nextFundingTime").and_then(coerce_i64);
        match (mark_px, index_px, funding_rate, next_ft) {
            (Some(mark_px), Some(index_px), Some(funding_rate), Some(next_funding_time_ms)) => {
                Ok(FundingInfo {
                    symbol: symbol.to_string(),
                    event_time_ms: v
                        .get("time")
                        .and_then(coerce_i64)
                        .unwrap_or_else(|| Utc::now().timestamp_millis()),
                    mark_px,
                    index_px,
                    funding_rate,
                    next_funding_time_ms,
                })
            }
            _ => Err(GatewayError::Payload(format!("premiumIndex: bad payload {v}"))),
        }
    }

    pub async fn get_agg_trades(
        &self,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<AggTrade>, GatewayError> {
        let v = self
            .get_public(
                "/fapi/v1/aggTrades",
                &[("symbol", symbol.to_string()), ("limit", limit.to_string())],
            )
            .await?;
        let rows = v
            .as_array()
            .ok_or_else(|| GatewayError::Payload("aggTrades: expected array".into()))?;

        let mut out = Vec::with_capacity(rows.len());
        for t in rows {
            let trade_ms = t.get("T").or_else(|| t.get("time")).and_then(coerce_i64);
            let price = t.get("p").or_else(|| t.get("price")).and_then(coerce_f64);
            let qty = t.get("q").or_else(|| t.get("qty")).and_then(coerce_f64);
            let agg_id = t.get("a").or_else(|| t.get("aggId")).and_then(coerce_i64);
            let maker = t.get("m").or_else(|| t.get("isBuyerMaker")).and_then(Value::as_bool);
            if let (Some(trade_ms), Some(price), Some(qty), Some(agg_id), Some(maker)) =
                (trade_ms, price, qty, agg_id, maker)
            {
                out.push(AggTrade {
                    symbol: symbol.to_string(),
                    event_time_ms: trade_ms,
                    trade_time_ms: trade_ms,
                    agg_id,
                    price,
                    qty,
                    is_buyer_maker: maker,
                });
            }
        }
        out.sort_by_key(|t| t.trade_time_ms);
        Ok(out)
    }

    pub async fn get_depth(&self, symbol: &str, limit: usize) -> Result<L2Depth, GatewayError> {
        let v = self
            .get_public(
                "/fapi/v1/depth",
                &[("symbol", symbol.to_string()), ("limit", limit.to_string())],
            )
            .await?;

        let parse_side = |side: &Value| -> Vec<(f64, f64)> {
            side.as_array()
                .map(|levels| {
                    levels
                        .iter()
                        .take(limit)
                        .filter_map(|level| {
                            let pair = level.as_array()?;
                            Some((coerce_f64(pair.first()?)?, coerce_f64(pair.get(1)?)?))
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        Ok(L2Depth {
            symbol: symbol.to_string(),
            event_time_ms: v
                .get("E")
                .or_else(|| v.get("T"))
                .and_then(coerce_i64)
                .unwrap_or_else(|| Utc::now().timestamp_millis()),
            bids: parse_side(v.get("bids").unwrap_or(&Value::Null)),
            asks: parse_side(v.get("asks").unwrap_or(&Value::Null)),
        })
    }

    pub async fn get_exchange_info(&self) -> Result<ExchangeInfo, GatewayError> {
        let v = self.get_public("/fapi/v1/exchangeInfo", &[]).await?;
        serde_json::from_value(v).map_err(|e| GatewayError::Payload(format!("exchangeInfo: {e}")))
    }

    // ============== Signed order/account endpoints ==============

    pub async fn new_order(&self, req: &NewOrderRequest) -> Result<OrderAck, GatewayError> {
        let mut params: Vec<(&str, String)> = vec![
            ("symbol", req.symbol.clone()),
            ("side", req.side.as_str().to_string()),
            ("type", req.order_type.as_str().to_string()),
        ];
        if let Some(q) = req.quantity {
            params.push(("quantity", fmt_num(q)));
        }
        if let Some(p) = req.price {
            params.push(("price", fmt_num(p)));
        }
        if let Some(sp) = req.stop_price {
            params.push(("stopPrice", fmt_num(sp)));
        }
        if let Some(tif) = req.time_in_force {
            params.push(("timeInForce", tif.as_str().to_string()));
        }
        if req.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }
        if let Some(ap) = req.activation_price {
            params.push(("activationPrice", fmt_num(ap)));
        }
        if let Some(cr) = req.callback_rate {
            params.push(("callbackRate", fmt_num(cr)));
        }
        if let Some(wt) = req.working_type {
            params.push(("workingType", wt.as_str().to_string()));
        }
        if req.price_protect {
            params.push(("priceProtect", "TRUE".to_string()));
        }

        let v = self
            .send_signed(Method::POST, "/fapi/v1/order", &params)
            .await?;
        serde_json::from_value(v).map_err(|e| GatewayError::Payload(format!("newOrder ack: {e}")))
    }

    pub async fn query_order(
        &self,
        symbol: &str,
        order_id: i64,
    ) -> Result<OrderStatus, GatewayError> {
        let v = self
            .send_signed(
                Method::GET,
                "/fapi/v1/order",
                &[
                    ("symbol", symbol.to_string()),
                    ("orderId", order_id.to_string()),
                ],
            )
            .await?;
        serde_json::from_value(v).map_err(|e| GatewayError::Payload(format!("queryOrder: {e}")))
    }

    pub async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<(), GatewayError> {
        self.send_signed(
            Method::DELETE,
            "/fapi/v1/order",
            &[
                ("symbol", symbol.to_string()),
                ("orderId", order_id.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn get_position_risk(
        &self,
        symbol: &str,
    ) -> Result<Vec<PositionRisk>, GatewayError> {
        let v = self
            .send_signed(
                Method::GET,
                "/fapi/v2/positionRisk",
                &[("symbol", symbol.to_string())],
            )
            .await?;
        let rows = match v {
            Value::Array(rows) => rows,
            Value::Object(_) => vec![v],
            other => {
                return Err(GatewayError::Payload(format!(
                    "positionRisk: unexpected payload {other}"
                )))
            }
        };
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            if let Ok(pr) = serde_json::from_value::<PositionRisk>(row) {
                out.push(pr);
            }
        }
        Ok(out)
    }

    pub async fn get_account(&self) -> Result<AccountSummary, GatewayError> {
        let v = self.send_signed(Method::GET, "/fapi/v2/account", &[]).await?;
        serde_json::from_value(v).map_err(|e| GatewayError::Payload(format!("account: {e}")))
    }

    pub async fn change_leverage(&self, symbol: &str, leverage: u32) -> Result<(), GatewayError> {
        self.send_signed(
            Method::POST,
            "/fapi/v1/leverage",
            &[
                ("symbol", symbol.to_string()),
                ("leverage", leverage.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn change_margin_type(
        &self,
        symbol: &str,
        margin_type: &str,
    ) -> Result<(), GatewayError> {
        self.send_signed(
            Method::POST,
            "/fapi/v1/marginType",
            &[
                ("symbol", symbol.to_string()),
                ("marginType", margin_type.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn get_account_trades(
        &self,
        symbol: &str,
        start_time_ms: i64,
        end_time_ms: i64,
    ) -> Result<Vec<AccountTrade>, GatewayError> {
        let v = self
            .send_signed(
                Method::GET,
                "/fapi/v1/userTrades",
                &[
                    ("symbol", symbol.to_string()),
                    ("startTime", start_time_ms.to_string()),
                    ("endTime", end_time_ms.to_string()),
                ],
            )
            .await?;
        let rows = v
            .as_array()
            .ok_or_else(|| GatewayError::Payload("userTrades: expected array".into()))?;
        Ok(rows
            .iter()
            .filter_map(|row| serde_json::from_value(row.clone()).ok())
            .collect())
    }
}
