use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use breakerbot::api::{MarketEvent, RestClient};
use breakerbot::config::{read_secret, AppConfig, Cli};
use breakerbot::engine::ControlLoop;
use breakerbot::execution::{OrderPlacer, TracingAlerter};
use breakerbot::market::{Kline, MarketCache};

#[tokio::main]
async fn main() -> breakerbot::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_cli(Cli::parse())?;
    info!("🤖 breakerbot starting for {:?}", config.symbols);

    let public_rest = RestClient::new(&config.rest_url);
    let cache = Arc::new(MarketCache::default());

    let seeded_candles = seed_market_data(&public_rest, cache.as_ref(), &config).await;

    let stream = breakerbot::api::spawn_market_stream(&config.ws_url, &config.symbols, cache.clone());

    let placer = build_placer(&config).await?;
    match &placer {
        Some(_) => info!("💰 Trading enabled"),
        None => info!("👀 Observe mode: no orders will be placed"),
    }

    let mut engine = ControlLoop::new(config, cache, placer, Box::new(TracingAlerter));
    engine.prime_signals(&seeded_candles);
    let stop = engine.stop_handle();

    tokio::select! {
        _ = engine.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("🛑 Shutdown signal received");
            stop.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    // Keep the stream feeding the cache while open positions are flattened,
    // then close the socket
    stream.prepare_shutdown();
    engine.flatten_all().await;
    stream.shutdown(Duration::from_secs(5)).await;
    info!("👋 Shutdown complete");
    Ok(())
}

/// Warm the cache over REST and collect the closed candles so the signal
/// windows can be primed. Failures are logged and skipped; the stream
/// backfills soon enough.
async fn seed_market_data(rest: &RestClient, cache: &MarketCache, config: &AppConfig) -> Vec<Kline> {
    let window = config.signal.vol_window.max(config.signal.volume_window);
    let kline_limit = (window + 2).min(1000);
    let mut seeded = Vec::new();

    for symbol in &config.symbols {
        match rest.get_klines(symbol, "1m", kline_limit).await {
            Ok(klines) => {
                let n = klines.len();
                for k in klines.into_iter().filter(|k| k.is_closed) {
                    cache.update(MarketEvent::Kline(k.clone()));
                    seeded.push(k);
                }
                info!("{} seeded {} 1m candles over REST", symbol, n);
            }
            Err(e) => warn!("{} kline seed failed: {}", symbol, e),
        }
        match rest.get_book_ticker(symbol).await {
            Ok(bbo) => cache.update(MarketEvent::BookTicker(bbo)),
            Err(e) => warn!("{} book ticker seed failed: {}", symbol, e),
        }
        match rest.get_mark_price(symbol).await {
            Ok(funding) => cache.update(MarketEvent::MarkPrice(funding)),
            Err(e) => warn!("{} mark price seed failed: {}", symbol, e),
        }
        match rest.get_depth(symbol, 5).await {
            Ok(depth) => cache.update(MarketEvent::Depth(depth)),
            Err(e) => warn!("{} depth seed failed: {}", symbol, e),
        }
        match rest.get_agg_trades(symbol, 100).await {
            Ok(trades) => {
                for t in trades {
                    cache.update(MarketEvent::AggTrade(t));
                }
            }
            Err(e) => warn!("{} trade seed failed: {}", symbol, e),
        }
    }
    seeded
}

/// Build the order placer when credentials are present and observe mode is
/// off; otherwise run without one
async fn build_placer(config: &AppConfig) -> breakerbot::Result<Option<Arc<OrderPlacer>>> {
    if config.observe {
        return Ok(None);
    }
    let api_key = read_secret("ORDER_API_KEY")?;
    let api_secret = read_secret("ORDER_SECRET_KEY")?;
    let (Some(api_key), Some(api_secret)) = (api_key, api_secret) else {
        warn!("ORDER_API_KEY / ORDER_SECRET_KEY not set, falling back to observe mode");
        return Ok(None);
    };

    let rest = RestClient::new(&config.rest_url).with_credentials(api_key, api_secret);
    let placer = Arc::new(OrderPlacer::new(rest, config.exits.clone()));
    for symbol in &config.symbols {
        if let Err(e) = placer.ensure_risk_setup(symbol, config.risk.leverage).await {
            error!("{} leverage/margin setup failed: {:#}", symbol, e);
        }
    }
    Ok(Some(placer))
}
