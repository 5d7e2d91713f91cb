use super::{price_key, CacheError, PriceCache, Snapshot};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

/// In-process string store holding JSON-encoded snapshots, keyed like a remote
/// key/value backend would be.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PriceCache for MemoryCache {
    async fn get_price(&self, symbol: &str) -> Result<Option<Snapshot>, CacheError> {
        let payload = {
            let entries = self
                .entries
                .read()
                .map_err(|_| CacheError::Unavailable("price store lock poisoned".into()))?;
            match entries.get(&price_key(symbol)) {
                Some(payload) => payload.clone(),
                None => return Ok(None),
            }
        };

        Ok(Some(serde_json::from_str(&payload)?))
    }

    async fn set_price(&self, snapshot: Snapshot) -> Result<(), CacheError> {
        let key = price_key(&snapshot.symbol);
        let payload = serde_json::to_string(&snapshot)?;

        let mut entries = self
            .entries
            .write()
            .map_err(|_| CacheError::Unavailable("price store lock poisoned".into()))?;
        entries.insert(key, payload);
        Ok(())
    }
}
