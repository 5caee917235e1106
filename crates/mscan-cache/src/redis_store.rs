//! Redis-backed cache store.

use async_trait::async_trait;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::CacheResult;
use crate::store::CacheStore;

/// Store using `SET key value EX ttl` / `GET key`. Expiry is native to Redis.
pub struct RedisStore {
    client: redis::Client,
    prefix: String,
}

impl RedisStore {
    /// Create a new Redis store.
    pub fn new(redis_url: &str) -> CacheResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            prefix: "mscan:".to_string(),
        })
    }

    /// Override the namespace prepended to every key.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> CacheResult<Option<Arc<Vec<u8>>>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let value: Option<Vec<u8>> = conn.get(self.full_key(key)).await?;
        Ok(value.map(Arc::new))
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CacheResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let secs = ttl.as_secs().max(1);
        debug!(key = %key, ttl_secs = secs, bytes = value.len(), "Writing cache entry to Redis");
        conn.set_ex::<_, _, ()>(self.full_key(key), value, secs).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.del::<_, ()>(self.full_key(key)).await?;
        Ok(())
    }

    async fn ping(&self) -> CacheResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
    }

    #[test]
    fn test_key_prefix() {
        let store = RedisStore::new("redis://localhost:6379")
            .unwrap()
            .with_prefix("test:");
        assert_eq!(store.full_key("embed:abc"), "test:embed:abc");
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_redis_roundtrip() {
        let store = RedisStore::new(&redis_url()).unwrap().with_prefix("mscan-test:");
        store
            .put("result:abc", b"{}".to_vec(), Duration::from_secs(5))
            .await
            .unwrap();
        let value = store.get("result:abc").await.unwrap().unwrap();
        assert_eq!(value.as_slice(), b"{}");
        store.delete("result:abc").await.unwrap();
        assert!(store.get("result:abc").await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_redis_ping() {
        let store = RedisStore::new(&redis_url()).unwrap();
        store.ping().await.unwrap();
    }
}
