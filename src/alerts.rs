use crate::api::binance::ws::PriceEvent;
use crate::cache::{PriceCache, Snapshot};
use crate::error::{report, PriceWatchError};
use crate::shutdown::Shutdown;
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

const CHANNEL_CAPACITY: usize = 32;

/// A price move at or beyond the configured threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub symbol: String,
    pub old_price: f64,
    pub new_price: f64,
    pub change: f64,
    pub change_pct: f64,
    pub occurred_at: DateTime<Utc>,
    pub observation: DateTime<Utc>,
}

/// Absolute and percentage change from `old` to `new`, if the move is alertable.
/// A zero `old` price never alerts.
pub fn price_move(old: f64, new: f64, threshold: f64) -> Option<(f64, f64)> {
    if old == 0.0 {
        return None;
    }
    let change = new - old;
    let change_pct = (change / old) * 100.0;
    if change_pct.abs() < threshold {
        return None;
    }
    Some((change, change_pct))
}

pub struct AlertEngine {
    cache: Arc<dyn PriceCache>,
    threshold: f64,
    capacity: usize,
}

impl AlertEngine {
    pub fn new(cache: Arc<dyn PriceCache>, threshold: f64) -> Result<Self, PriceWatchError> {
        if !threshold.is_finite() || threshold < 0.0 {
            return Err(PriceWatchError::ConfigError(format!(
                "alert threshold must be a non-negative number, got {}",
                threshold
            )));
        }
        Ok(Self {
            cache,
            threshold,
            capacity: CHANNEL_CAPACITY,
        })
    }

    /// Sets the buffer size of the alert and error channels. A full buffer stalls
    /// processing until the consumer catches up.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Runs one price event through the cache and the threshold check.
    ///
    /// The cache write happens even when the read failed or no alert fires, so the
    /// next event always compares against the latest price. Cache failures come back
    /// alongside the result instead of aborting.
    pub async fn process(&self, event: &PriceEvent) -> (Option<Alert>, Vec<PriceWatchError>) {
        let mut errors = Vec::new();

        let previous = match self.cache.get_price(&event.symbol).await {
            Ok(previous) => previous,
            Err(e) => {
                errors.push(PriceWatchError::CacheRead(e));
                None
            }
        };

        let symbol = event.symbol.to_uppercase();
        let snapshot = Snapshot {
            symbol: symbol.clone(),
            price: event.price,
            updated_at: event.event_time,
        };
        if let Err(e) = self.cache.set_price(snapshot).await {
            errors.push(PriceWatchError::CacheWrite(e));
        }

        let alert = previous.and_then(|previous| {
            let (change, change_pct) = price_move(previous.price, event.price, self.threshold)?;
            Some(Alert {
                symbol,
                old_price: previous.price,
                new_price: event.price,
                change,
                change_pct,
                occurred_at: Utc::now(),
                observation: event.event_time,
            })
        });

        (alert, errors)
    }

    /// Consumes `prices` on a background task. The alert channel closes when the
    /// input closes or shutdown fires.
    pub fn start(
        self,
        mut prices: mpsc::Receiver<PriceEvent>,
        mut shutdown: Shutdown,
    ) -> (mpsc::Receiver<Alert>, mpsc::Receiver<PriceWatchError>) {
        let (alert_tx, alert_rx) = mpsc::channel(self.capacity);
        let (error_tx, error_rx) = mpsc::channel(self.capacity);

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = prices.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };

                let (alert, errors) = self.process(&event).await;
                for error in errors {
                    report(&error_tx, error, &mut shutdown).await;
                }

                if let Some(alert) = alert {
                    info!(
                        "ALERT: {} moved {:+.4}% ({} -> {})",
                        alert.symbol, alert.change_pct, alert.old_price, alert.new_price
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        sent = alert_tx.send(alert) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            debug!("Alert engine stopped");
        });

        (alert_rx, error_rx)
    }
}
