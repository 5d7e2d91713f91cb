use crate::api::binance::ws::BINANCE_WS_URL;
use crate::error::PriceWatchError;
use std::env;

const DEFAULT_SYMBOL: &str = "BTCUSDT";
const DEFAULT_THRESHOLD_PCT: f64 = 1.0;
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

/// Runtime configuration, read once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub symbols: Vec<String>,
    pub alert_threshold_pct: f64,
    pub listen_addr: String,
    pub binance_ws_url: String,
    /// Redis `host:port`. Unset keeps prices in process memory.
    pub redis_addr: Option<String>,
    pub redis_password: Option<String>,
    pub redis_db: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            symbols: vec![DEFAULT_SYMBOL.to_string()],
            alert_threshold_pct: DEFAULT_THRESHOLD_PCT,
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            binance_ws_url: BINANCE_WS_URL.to_string(),
            redis_addr: None,
            redis_password: None,
            redis_db: 0,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, PriceWatchError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from `lookup`, falling back to defaults for unset or blank keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, PriceWatchError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut config = Self::default();

        if let Some(symbols) = value("BINANCE_SYMBOLS") {
            config.symbols = split_csv(&symbols);
        }
        if let Some(threshold) = value("ALERT_THRESHOLD_PCT") {
            config.alert_threshold_pct = threshold.parse().map_err(|e| {
                PriceWatchError::ConfigError(format!("invalid ALERT_THRESHOLD_PCT: {}", e))
            })?;
        }
        if let Some(addr) = value("INTERNAL_WS_ADDR") {
            config.listen_addr = addr;
        }
        if let Some(url) = value("BINANCE_WS_URL") {
            config.binance_ws_url = url;
        }
        config.redis_addr = value("REDIS_ADDR");
        // Passwords are taken verbatim.
        config.redis_password = lookup("REDIS_PASSWORD").filter(|v| !v.is_empty());
        if let Some(db) = value("REDIS_DB") {
            config.redis_db = db.parse().map_err(|e| {
                PriceWatchError::ConfigError(format!("invalid REDIS_DB: {}", e))
            })?;
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PriceWatchError> {
        if self.symbols.is_empty() {
            return Err(PriceWatchError::NoSymbols);
        }
        if !self.alert_threshold_pct.is_finite() || self.alert_threshold_pct < 0.0 {
            return Err(PriceWatchError::ConfigError(format!(
                "ALERT_THRESHOLD_PCT must be non-negative, got {}",
                self.alert_threshold_pct
            )));
        }
        if self.listen_addr.is_empty() {
            return Err(PriceWatchError::ConfigError(
                "INTERNAL_WS_ADDR must not be empty".into(),
            ));
        }
        Ok(())
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}
