use super::{price_key, CacheError, PriceCache, Snapshot};
use async_trait::async_trait;
use log::info;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, ConnectionInfo, IntoConnectionInfo, RedisResult};
use tokio::sync::Mutex;

/// Redis-backed price store. Snapshots are stored as JSON strings under
/// [`price_key`].
///
/// The connection is opened on first use and reopened by the connection manager
/// after failures, so an unreachable server surfaces as per-call errors rather
/// than a startup failure.
pub struct RedisCache {
    client: redis::Client,
    connection: Mutex<Option<ConnectionManager>>,
}

impl RedisCache {
    /// `addr` is `host:port`. An empty password means no authentication.
    pub fn new(addr: &str, password: Option<String>, db: i64) -> Result<Self, CacheError> {
        let client = redis::Client::open(connection_info(addr, password, db)?)?;
        Ok(Self {
            client,
            connection: Mutex::new(None),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, CacheError> {
        let mut slot = self.connection.lock().await;
        if let Some(connection) = slot.as_ref() {
            return Ok(connection.clone());
        }
        let connection = ConnectionManager::new(self.client.clone()).await?;
        info!("Connected to redis at {}", self.client.get_connection_info().addr);
        *slot = Some(connection.clone());
        Ok(connection)
    }
}

#[async_trait]
impl PriceCache for RedisCache {
    async fn get_price(&self, symbol: &str) -> Result<Option<Snapshot>, CacheError> {
        let mut connection = self.connection().await?;
        let payload: Option<String> = connection.get(price_key(symbol)).await?;
        match payload {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn set_price(&self, snapshot: Snapshot) -> Result<(), CacheError> {
        let payload = serde_json::to_string(&snapshot)?;
        let mut connection = self.connection().await?;
        connection
            .set::<_, _, ()>(price_key(&snapshot.symbol), payload)
            .await?;
        Ok(())
    }
}

fn connection_info(addr: &str, password: Option<String>, db: i64) -> RedisResult<ConnectionInfo> {
    let mut info = format!("redis://{}/{}", addr, db).into_connection_info()?;
    info.redis.password = password.filter(|p| !p.is_empty());
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use redis::ConnectionAddr;

    #[test]
    fn builds_connection_info() {
        let info = connection_info("localhost:6380", Some("s3cret".into()), 2).unwrap();
        assert_eq!(info.addr, ConnectionAddr::Tcp("localhost".into(), 6380));
        assert_eq!(info.redis.db, 2);
        assert_eq!(info.redis.password.as_deref(), Some("s3cret"));

        let open = connection_info("cache:6379", Some(String::new()), 0).unwrap();
        assert_eq!(open.redis.password, None);
    }

    #[test]
    fn rejects_unparseable_address() {
        assert!(RedisCache::new("localhost:notaport", None, 0).is_err());
    }

    #[tokio::test]
    #[ignore = "needs a redis server on localhost:6379"]
    async fn round_trips_through_local_redis() {
        let cache = RedisCache::new("localhost:6379", None, 0).unwrap();
        let snapshot = Snapshot {
            symbol: "TESTUSDT".into(),
            price: 42.5,
            updated_at: Utc.timestamp_millis_opt(1_000).unwrap(),
        };
        cache.set_price(snapshot.clone()).await.unwrap();
        assert_eq!(cache.get_price("testusdt").await.unwrap(), Some(snapshot));
    }
}
