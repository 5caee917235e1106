//! Backing stores for the content cache.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::error::CacheResult;

/// Byte-level key/value store with TTL expiry.
///
/// Implementations must treat an expired entry exactly like a missing one.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> CacheResult<Option<Arc<Vec<u8>>>>;

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CacheResult<()>;

    async fn delete(&self, key: &str) -> CacheResult<()>;

    /// Reachability check used by the readiness probe.
    async fn ping(&self) -> CacheResult<()>;

    /// Drop expired entries. Stores with native expiry return 0.
    async fn purge_expired(&self) -> usize {
        0
    }

    /// Backend name for logs and stats.
    fn backend(&self) -> &'static str;
}

struct Entry {
    value: Arc<Vec<u8>>,
    expires_at: Instant,
}

/// In-process store backed by a sharded concurrent map.
///
/// Readers of one key never contend with writers of another.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries, expired ones included until swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> CacheResult<Option<Arc<Vec<u8>>>> {
        let now = Instant::now();
        let hit = match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        if hit {
            // Lazily evict; a concurrent put may have refreshed the entry.
            self.entries.remove_if(key, |_, e| e.expires_at <= now);
        }
        Ok(None)
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CacheResult<()> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Arc::new(value),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn ping(&self) -> CacheResult<()> {
        Ok(())
    }

    async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at > now);
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            debug!(purged, remaining = self.entries.len(), "Purged expired cache entries");
        }
        purged
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
