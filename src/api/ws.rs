use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::types::{coerce_f64, coerce_i64, MarketEvent};
use crate::market::cache::MarketCache;
use crate::market::types::{AggTrade, Bbo, FundingInfo, Kline, L2Depth};

pub const DEFAULT_WS_URL: &str = "wss://fstream.asterdex.com";
const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const DEPTH_LEVELS: usize = 5;

/// Build the combined-stream URL subscribing every feed the engine consumes
/// for each symbol.
pub fn combined_stream_url(ws_base: &str, symbols: &[String]) -> String {
    let mut streams = Vec::with_capacity(symbols.len() * 5);
    for sym in symbols {
        let s = sym.to_lowercase();
        streams.push(format!("{s}@kline_1m"));
        streams.push(format!("{s}@bookTicker"));
        streams.push(format!("{s}@markPrice@1s"));
        streams.push(format!("{s}@aggTrade"));
        streams.push(format!("{s}@depth{DEPTH_LEVELS}@100ms"));
    }
    format!(
        "{}/stream?streams={}",
        ws_base.trim_end_matches('/'),
        streams.join("/")
    )
}

/// Decode one combined-stream frame into a typed event.
///
/// Returns None for frames the engine does not consume (subscription acks,
/// unknown event types, short payloads). This is the only place stream
/// payload keys are inspected.
pub fn decode_stream_event(frame: &Value) -> Option<MarketEvent> {
    // Combined streams wrap the payload: {"stream": "...", "data": {...}}
    let data = frame.get("data").unwrap_or(frame);
    let event_type = data.get("e")?.as_str()?;
    let symbol = data.get("s")?.as_str()?.to_string();
    let event_time_ms = data.get("E").and_then(coerce_i64).unwrap_or_default();

    match event_type {
        "kline" => {
            let k = data.get("k")?;
            Some(MarketEvent::Kline(Kline {
                symbol,
                event_time_ms,
                start_time_ms: k.get("t").and_then(coerce_i64)?,
                close_time_ms: k.get("T").and_then(coerce_i64)?,
                interval: k.get("i")?.as_str()?.to_string(),
                open: k.get("o").and_then(coerce_f64)?,
                high: k.get("h").and_then(coerce_f64)?,
                low: k.get("l").and_then(coerce_f64)?,
                close: k.get("c").and_then(coerce_f64)?,
                base_vol: k.get("v").and_then(coerce_f64)?,
                quote_vol: k.get("q").and_then(coerce_f64)?,
                num_trades: k.get("n").and_then(coerce_i64).unwrap_or(0),
                is_closed: k.get("x").and_then(Value::as_bool)?,
            }))
        }
        "bookTicker" => Some(MarketEvent::BookTicker(Bbo {
            symbol,
            event_time_ms,
            bid_px: data.get("b").and_then(coerce_f64)?,
            bid_qty: data.get("B").and_then(coerce_f64)?,
            ask_px: data.get("a").and_then(coerce_f64)?,
            ask_qty: data.get("A").and_then(coerce_f64)?,
        })),
        "markPriceUpdate" => Some(MarketEvent::MarkPrice(FundingInfo {
            symbol,
            event_time_ms,
            mark_px: data.get("p").and_then(coerce_f64)?,
            index_px: data.get("i").and_then(coerce_f64)?,
            funding_rate: data.get("r").and_then(coerce_f64)?,
            next_funding_time_ms: data.get("T").and_then(coerce_i64).unwrap_or(0),
        })),
        "aggTrade" => Some(MarketEvent::AggTrade(AggTrade {
            symbol,
            event_time_ms,
            trade_time_ms: data.get("T").and_then(coerce_i64)?,
            agg_id: data.get("a").and_then(coerce_i64)?,
            price: data.get("p").and_then(coerce_f64)?,
            qty: data.get("q").and_then(coerce_f64)?,
            is_buyer_maker: data.get("m").and_then(Value::as_bool)?,
        })),
        "depthUpdate" => {
            let parse_side = |key: &str| -> Vec<(f64, f64)> {
                data.get(key)
                    .and_then(Value::as_array)
                    .map(|levels| {
                        levels
                            .iter()
                            .take(DEPTH_LEVELS)
                            .filter_map(|level| {
                                let pair = level.as_array()?;
                                Some((coerce_f64(pair.first()?)?, coerce_f64(pair.get(1)?)?))
                            })
                            .collect()
                    })
                    .unwrap_or_default()
            };
            Some(MarketEvent::Depth(L2Depth {
                symbol,
                event_time_ms,
                bids: parse_side("b"),
                asks: parse_side("a"),
            }))
        }
        _ => None,
    }
}

/// Handle to the background stream ingestion task.
///
/// Shutdown happens in two steps so the control loop can stop consuming
/// before the socket closes: `prepare_shutdown` suppresses reconnects, then
/// `shutdown` sends a close frame and waits for the task to finish.
pub struct StreamHandle {
    shutting_down: Arc<AtomicBool>,
    stop: Arc<Notify>,
    task: JoinHandle<()>,
}

impl StreamHandle {
    /// Suppress reconnect attempts; the current connection keeps feeding the
    /// cache until `shutdown` is called.
    pub fn prepare_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    /// Close the socket and wait for the ingestion task to exit
    pub async fn shutdown(self, timeout: Duration) {
        self.prepare_shutdown();
        self.stop.notify_waiters();
        if tokio::time::timeout(timeout, self.task).await.is_err() {
            warn!("Stream task did not exit within {:?}", timeout);
        }
    }
}

/// Spawn the market stream ingestion task. Reconnects with a fixed delay
/// until shutdown is requested.
pub fn spawn_market_stream(
    ws_base: &str,
    symbols: &[String],
    cache: Arc<MarketCache>,
) -> StreamHandle {
    let url = combined_stream_url(ws_base, symbols);
    let shutting_down = Arc::new(AtomicBool::new(false));
    let stop = Arc::new(Notify::new());

    let flag = shutting_down.clone();
    let stop_signal = stop.clone();
    let task = tokio::spawn(async move {
        loop {
            match connect_async(url.as_str()).await {
                Ok((ws, _)) => {
                    info!("Market stream connected");
                    run_connection(ws, &cache, &stop_signal).await;
                }
                Err(e) => {
                    warn!("Market stream connect failed: {}", e);
                }
            }
            if flag.load(Ordering::SeqCst) {
                info!("Market stream task exiting");
                return;
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    });

    StreamHandle {
        shutting_down,
        stop,
        task,
    }
}

async fn run_connection<S>(
    mut ws: tokio_tungstenite::WebSocketStream<S>,
    cache: &MarketCache,
    stop: &Notify,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            _ = stop.notified() => {
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "shutdown".into(),
                };
                if let Err(e) = ws.send(Message::Close(Some(frame))).await {
                    debug!("Close frame send failed: {}", e);
                }
                // Drain until the peer acknowledges or the stream ends
                let drain = async {
                    while let Some(msg) = ws.next().await {
                        if matches!(msg, Ok(Message::Close(_)) | Err(_)) {
                            break;
                        }
                    }
                };
                let _ = tokio::time::timeout(Duration::from_secs(2), drain).await;
                return;
            }
            msg = ws.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<Value>(&text) {
                            Ok(frame) => {
                                if let Some(event) = decode_stream_event(&frame) {
                                    cache.update(event);
                                }
                            }
                            Err(e) => debug!("Undecodable stream frame: {}", e),
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if ws.send(Message::Pong(payload)).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        warn!("Market stream disconnected");
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Market stream read error: {}", e);
                        return;
                    }
                }
            }
        }
    }
}
