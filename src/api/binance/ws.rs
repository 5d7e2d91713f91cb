use crate::api::binance::backoff::Backoff;
use crate::error::{report, PriceWatchError};
use crate::shutdown::Shutdown;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::{Stream, StreamExt};
use log::{debug, info, warn};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::Message;

pub const BINANCE_WS_URL: &str = "wss://stream.binance.com:9443";

const CHANNEL_CAPACITY: usize = 32;

/// One normalized ticker update.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceEvent {
    pub symbol: String,
    pub price: f64,
    pub raw_price: String,
    pub event_time: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct CombinedStreamMessage {
    data: TickerData,
}

#[derive(Debug, Deserialize)]
struct TickerData {
    #[serde(rename = "s")]
    symbol: Option<String>,
    #[serde(rename = "c")]
    close: Option<WireValue>,
    #[serde(rename = "E")]
    event_time: Option<WireValue>,
}

/// Binance sends some numeric fields as strings and others as JSON numbers.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireValue {
    Text(String),
    Number(serde_json::Number),
}

/// Decodes one combined-stream ticker envelope.
pub fn decode_ticker(payload: &[u8]) -> Result<PriceEvent, PriceWatchError> {
    let message: CombinedStreamMessage = serde_json::from_slice(payload)?;
    let data = message.data;

    let symbol = data
        .symbol
        .filter(|s| !s.is_empty())
        .ok_or_else(|| PriceWatchError::DecodeError("missing symbol".into()))?;
    let (price, raw_price) = parse_price(
        data.close
            .ok_or_else(|| PriceWatchError::DecodeError("missing close price".into()))?,
    )?;
    let millis = parse_event_time(
        data.event_time
            .ok_or_else(|| PriceWatchError::DecodeError("missing event time".into()))?,
    )?;
    let event_time = Utc.timestamp_millis_opt(millis).single().ok_or_else(|| {
        PriceWatchError::DecodeError(format!("event time out of range: {}", millis))
    })?;

    Ok(PriceEvent {
        symbol,
        price,
        raw_price,
        event_time,
    })
}

fn parse_price(value: WireValue) -> Result<(f64, String), PriceWatchError> {
    let (price, raw) = match value {
        WireValue::Text(raw) => {
            let price = raw.trim().parse::<f64>().map_err(|e| {
                PriceWatchError::DecodeError(format!("invalid price string {:?}: {}", raw, e))
            })?;
            (price, raw)
        }
        WireValue::Number(number) => {
            let price = number.as_f64().ok_or_else(|| {
                PriceWatchError::DecodeError(format!("unsupported price payload: {}", number))
            })?;
            (price, number.to_string())
        }
    };

    if !price.is_finite() {
        return Err(PriceWatchError::DecodeError(format!(
            "non-finite price: {}",
            raw
        )));
    }
    Ok((price, raw))
}

fn parse_event_time(value: WireValue) -> Result<i64, PriceWatchError> {
    match value {
        WireValue::Number(number) => number.as_i64().ok_or_else(|| {
            PriceWatchError::DecodeError(format!("unsupported event time payload: {}", number))
        }),
        WireValue::Text(raw) => raw.trim().parse::<i64>().map_err(|e| {
            PriceWatchError::DecodeError(format!("invalid event time string {:?}: {}", raw, e))
        }),
    }
}

/// Long-lived ticker client for the Binance combined stream endpoint.
#[derive(Debug, Clone)]
pub struct BinanceClient {
    base_url: String,
    backoff: Backoff,
    capacity: usize,
}

impl BinanceClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            backoff: Backoff::default(),
            capacity: CHANNEL_CAPACITY,
        }
    }

    /// Sets the buffer size of the event and error channels. When the event buffer
    /// is full the reader stops pulling frames off the socket.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff = Backoff::new(base, max);
        self
    }

    pub fn stream_url(&self, symbols: &[String]) -> String {
        let streams = symbols
            .iter()
            .map(|s| format!("{}@ticker", s.to_lowercase()))
            .collect::<Vec<_>>()
            .join("/");
        format!("{}/stream?streams={}", self.base_url, streams)
    }

    /// Streams price events for `symbols` until `shutdown` fires, reconnecting forever
    /// on failure. Both returned channels close when the stream stops.
    pub fn stream_tickers(
        &self,
        symbols: &[String],
        shutdown: Shutdown,
    ) -> (
        mpsc::Receiver<PriceEvent>,
        mpsc::Receiver<PriceWatchError>,
    ) {
        let (event_tx, event_rx) = mpsc::channel(self.capacity);
        let (error_tx, error_rx) = mpsc::channel(self.capacity);

        let url = self.stream_url(symbols);
        let no_symbols = symbols.is_empty();
        let backoff = self.backoff.clone();

        tokio::spawn(async move {
            if no_symbols {
                // Subscribing to nothing is a caller bug, not something to retry.
                let _ = error_tx.send(PriceWatchError::NoSymbols).await;
                return;
            }
            run_stream(url, backoff, event_tx, error_tx, shutdown).await;
        });

        (event_rx, error_rx)
    }
}

async fn run_stream(
    url: String,
    mut backoff: Backoff,
    events: mpsc::Sender<PriceEvent>,
    errors: mpsc::Sender<PriceWatchError>,
    mut shutdown: Shutdown,
) {
    loop {
        if shutdown.is_triggered() {
            break;
        }

        info!("Connecting to Binance WebSocket: {}", url);
        let dialed = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = connect_async(url.as_str()) => result,
        };

        match dialed {
            Ok((ws_stream, _)) => {
                info!("Successfully connected to WebSocket");
                backoff.reset();
                match read_loop(ws_stream, &events, &mut shutdown).await {
                    Ok(()) => break,
                    Err(e) => {
                        warn!("Binance connection dropped: {}", e);
                        report(&errors, e, &mut shutdown).await;
                    }
                }
            }
            Err(e) => report(&errors, PriceWatchError::DialError(e), &mut shutdown).await,
        }

        let delay = backoff.next_delay();
        debug!("Reconnecting to Binance in {:?}", delay);
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    info!("Binance ticker stream stopped");
}

/// Forwards decoded events until the connection fails. `Ok(())` means the client
/// should stop altogether: shutdown fired or nobody is listening any more.
async fn read_loop<S>(
    mut ws_stream: S,
    events: &mpsc::Sender<PriceEvent>,
    shutdown: &mut Shutdown,
) -> Result<(), PriceWatchError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            message = ws_stream.next() => message,
        };

        let event = match message {
            Some(Ok(Message::Text(text))) => decode_ticker(text.as_bytes())?,
            Some(Ok(Message::Binary(payload))) => decode_ticker(&payload)?,
            Some(Ok(Message::Close(_))) | None => return Err(PriceWatchError::FeedClosed),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        };

        debug!("{}: Price = {}", event.symbol, event.raw_price);

        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            sent = events.send(event) => {
                if sent.is_err() {
                    info!("Price event consumer went away");
                    return Ok(());
                }
            }
        }
    }
}
