use env_logger::Builder;
use log::{error, info, warn, LevelFilter};
use pricewatch::alerts::AlertEngine;
use pricewatch::api::binance::ws::BinanceClient;
use pricewatch::cache::{MemoryCache, PriceCache, RedisCache};
use pricewatch::config::Config;
use pricewatch::error::PriceWatchError;
use pricewatch::server::AlertServer;
use pricewatch::shutdown;
use std::error::Error;
use std::io::Write;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    // Configure logger
    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter_module("pricewatch", LevelFilter::Debug)
        .parse_default_env()
        .format(|buf, record| {
            let ts = chrono::Local::now().format("%H:%M:%S%.3f");
            writeln!(
                buf,
                "[{} {:<5} {}] {}",
                ts,
                record.level(),
                record.target(),
                record.args()
            )
        })
        .target(env_logger::Target::Stderr)
        .init();

    info!("Starting price alert monitor...");

    let config = Config::from_env()?;
    config.validate()?;
    info!(
        "Watching {} at {}% threshold",
        config.symbols.join(","),
        config.alert_threshold_pct
    );

    let (trigger, shutdown) = shutdown::channel();
    tokio::spawn(shutdown::wait_for_signal(trigger));

    let cache: Arc<dyn PriceCache> = match &config.redis_addr {
        Some(addr) => {
            info!("Using redis price cache at {} (db {})", addr, config.redis_db);
            Arc::new(RedisCache::new(
                addr,
                config.redis_password.clone(),
                config.redis_db,
            )?)
        }
        None => {
            info!("Using in-memory price cache");
            Arc::new(MemoryCache::new())
        }
    };
    let client = BinanceClient::new(config.binance_ws_url.clone());
    let engine = AlertEngine::new(cache, config.alert_threshold_pct)?;
    let server = Arc::new(AlertServer::new());
    let listener = TcpListener::bind(&config.listen_addr).await?;

    let (prices, price_errors) = client.stream_tickers(&config.symbols, shutdown.clone());
    let (alerts, alert_errors) = engine.start(prices, shutdown.clone());

    let broadcast_handle = tokio::spawn({
        let server = Arc::clone(&server);
        let shutdown = shutdown.clone();
        async move { server.run_broadcast(alerts, shutdown).await }
    });
    tokio::spawn(log_errors("binance", price_errors));
    tokio::spawn(log_errors("alerts", alert_errors));

    if let Err(e) = server.run(listener, shutdown).await {
        error!("ws server error: {}", e);
    }
    if let Err(e) = broadcast_handle.await {
        error!("broadcast task failed: {}", e);
    }

    info!("Shutdown complete");
    Ok(())
}

async fn log_errors(source: &'static str, mut errors: mpsc::Receiver<PriceWatchError>) {
    while let Some(e) = errors.recv().await {
        warn!("{} error: {}", source, e);
    }
}
