//! Latest-price storage used by the alert engine.
//!
//! The engine only depends on [`PriceCache`]; any key/value store offering per-key
//! atomic get and set can back it.

mod memory;
mod redis;

pub use self::redis::RedisCache;
pub use memory::MemoryCache;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const PRICE_KEY_PREFIX: &str = "price:";

/// Last known price for a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub symbol: String,
    pub price: f64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    #[error("cache codec failed: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

#[async_trait]
pub trait PriceCache: Send + Sync {
    /// Returns `Ok(None)` for a symbol that was never written.
    async fn get_price(&self, symbol: &str) -> Result<Option<Snapshot>, CacheError>;

    /// Unconditionally replaces the snapshot stored for `snapshot.symbol`.
    async fn set_price(&self, snapshot: Snapshot) -> Result<(), CacheError>;
}

/// Storage key for a symbol, case-insensitive.
pub fn price_key(symbol: &str) -> String {
    format!("{}{}", PRICE_KEY_PREFIX, symbol.to_uppercase())
}
