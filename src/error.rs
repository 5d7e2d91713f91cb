use crate::cache::CacheError;
use crate::shutdown::Shutdown;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum PriceWatchError {
    #[error("WebSocket error: {0}")]
    WebsocketError(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("binance: dial failed: {0}")]
    DialError(#[source] tokio_tungstenite::tungstenite::Error),

    #[error("binance: decode failed: {0}")]
    DecodeError(String),

    #[error("binance: connection closed by exchange")]
    FeedClosed,

    #[error("binance: at least one symbol required")]
    NoSymbols,

    #[error("alerts: cache read failed: {0}")]
    CacheRead(#[source] CacheError),

    #[error("alerts: cache write failed: {0}")]
    CacheWrite(#[source] CacheError),

    #[error("config error: {0}")]
    ConfigError(String),
}

/// Publishes a non-fatal error on a side channel. Gives up if shutdown fires first.
pub async fn report(
    errors: &mpsc::Sender<PriceWatchError>,
    error: PriceWatchError,
    shutdown: &mut Shutdown,
) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = errors.send(error) => {}
    }
}
