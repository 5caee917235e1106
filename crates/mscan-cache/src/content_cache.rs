//! Content cache with single-flight `get_or_compute`.
//!
//! ```text
//! worker A ─┐
//! worker B ─┼──► get_or_compute(embed:H) ──► one compute ──► store.put
//! worker C ─┘          │                         │
//!                      └──── all receive ◄───────┘
//! ```
//!
//! The in-flight registry maps a rendered key to a watch channel owned by the
//! leader. Followers wait on the channel; if the leader is dropped before
//! publishing, the channel closes and one follower becomes the new leader.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

use mscan_models::CacheKey;

use crate::config::{CacheBackend, CacheConfig};
use crate::error::{CacheError, CacheResult};
use crate::redis_store::RedisStore;
use crate::store::{CacheStore, MemoryStore};

type Outcome = Result<Arc<Vec<u8>>, Arc<dyn Any + Send + Sync>>;

struct Flight {
    tx: watch::Sender<Option<Outcome>>,
}

enum Role {
    Leader(Arc<Flight>),
    Follower(watch::Receiver<Option<Outcome>>),
}

/// Removes the leader's registry entry on every exit path, including drop.
struct FlightGuard<'a> {
    in_flight: &'a DashMap<String, Arc<Flight>>,
    key: String,
    flight: Arc<Flight>,
}

impl FlightGuard<'_> {
    fn publish(&self, outcome: Outcome) {
        self.flight.tx.send_replace(Some(outcome));
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight
            .remove_if(&self.key, |_, f| Arc::ptr_eq(f, &self.flight));
    }
}

/// Counter snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub backend: &'static str,
    pub hits: u64,
    pub misses: u64,
    /// Callers that waited on another caller's computation
    pub coalesced: u64,
    pub computations: u64,
    /// Backing store calls that failed or timed out
    pub store_errors: u64,
    pub in_flight: usize,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    computations: AtomicU64,
    store_errors: AtomicU64,
}

/// Content-addressed cache shared by all worker slots.
pub struct ContentCache {
    store: Arc<dyn CacheStore>,
    in_flight: DashMap<String, Arc<Flight>>,
    embed_ttl: Duration,
    result_ttl: Duration,
    store_timeout: Duration,
    counters: Counters,
}

impl ContentCache {
    /// Create a cache over an existing store.
    pub fn new(store: Arc<dyn CacheStore>, config: &CacheConfig) -> Self {
        Self {
            store,
            in_flight: DashMap::new(),
            embed_ttl: config.embed_ttl,
            result_ttl: config.result_ttl,
            store_timeout: config.store_timeout,
            counters: Counters::default(),
        }
    }

    /// Build the configured backend.
    pub fn from_config(config: &CacheConfig) -> CacheResult<Self> {
        let store: Arc<dyn CacheStore> = match &config.backend {
            CacheBackend::Memory => Arc::new(MemoryStore::new()),
            CacheBackend::Redis { url } => Arc::new(RedisStore::new(url)?),
        };
        Ok(Self::new(store, config))
    }

    /// In-memory cache with default settings.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), &CacheConfig::default())
    }

    /// Configured TTL for a key family.
    pub fn ttl_for(&self, key: &CacheKey) -> Duration {
        match key {
            CacheKey::Embedding(_) => self.embed_ttl,
            CacheKey::Result(_) => self.result_ttl,
        }
    }

    /// Read a value. Expired, undecodable and unreachable entries are misses.
    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let rendered = key.render();
        let value = self.lookup(&rendered).await;
        if value.is_some() {
            self.record_hit(key);
        } else {
            self.record_miss(key);
        }
        value
    }

    /// Write a value. Failures are logged and swallowed.
    pub async fn put<T: Serialize>(&self, key: &CacheKey, value: &T, ttl: Duration) {
        match serde_json::to_vec(value) {
            Ok(bytes) => {
                self.store_bytes(&key.render(), bytes, ttl).await;
            }
            Err(e) => warn!(key = %key, error = %e, "Failed to encode cache value"),
        }
    }

    /// Remove a key.
    pub async fn invalidate(&self, key: &CacheKey) {
        let rendered = key.render();
        match tokio::time::timeout(self.store_timeout, self.store.delete(&rendered)).await {
            Ok(Ok(())) => debug!(key = %rendered, "Cache entry invalidated"),
            Ok(Err(e)) => self.record_store_error(&rendered, &e),
            Err(_) => self.record_store_error(&rendered, &CacheError::unavailable("timed out")),
        }
    }

    /// Return the cached value, or run `compute` exactly once across all
    /// concurrent callers for the same key and share its outcome.
    ///
    /// Only successful values are written back. An error reaches every caller
    /// that was waiting on this computation.
    pub async fn get_or_compute<T, E, F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        compute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let rendered = key.render();
        let mut compute = Some(compute);

        loop {
            if let Some(value) = self.lookup::<T>(&rendered).await {
                self.record_hit(key);
                return Ok(value);
            }

            match self.join(&rendered) {
                Role::Leader(flight) => {
                    let guard = FlightGuard {
                        in_flight: &self.in_flight,
                        key: rendered.clone(),
                        flight,
                    };

                    // A previous leader may have finished between our lookup
                    // and registration.
                    if let Some(value) = self.lookup::<T>(&rendered).await {
                        self.record_hit(key);
                        if let Ok(bytes) = serde_json::to_vec(&value) {
                            guard.publish(Ok(Arc::new(bytes)));
                        }
                        return Ok(value);
                    }

                    self.record_miss(key);
                    let Some(compute) = compute.take() else {
                        // Unreachable: a caller leads at most once.
                        continue;
                    };
                    return self.lead(&guard, key, ttl, compute).await;
                }
                Role::Follower(mut rx) => {
                    self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("mscan_cache_coalesced_total", "family" => family(key))
                        .increment(1);
                    debug!(key = %rendered, "Waiting on in-flight computation");

                    let outcome = match rx.wait_for(|v| v.is_some()).await {
                        Ok(v) => v.clone(),
                        Err(_) => {
                            debug!(key = %rendered, "Leader dropped; retrying");
                            continue;
                        }
                    };

                    match outcome {
                        Some(Ok(bytes)) => match serde_json::from_slice::<T>(&bytes) {
                            Ok(value) => return Ok(value),
                            Err(e) => {
                                warn!(key = %rendered, error = %e, "Shared value did not decode");
                            }
                        },
                        Some(Err(err)) => {
                            if let Some(e) = err.downcast_ref::<E>() {
                                return Err(e.clone());
                            }
                        }
                        None => continue,
                    }

                    // Leader's outcome is unusable for this caller's types.
                    if let Some(compute) = compute.take() {
                        self.counters.computations.fetch_add(1, Ordering::Relaxed);
                        return compute().await;
                    }
                }
            }
        }
    }

    async fn lead<T, E, F, Fut>(
        &self,
        guard: &FlightGuard<'_>,
        key: &CacheKey,
        ttl: Duration,
        compute: F,
    ) -> Result<T, E>
    where
        T: Serialize,
        E: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.counters.computations.fetch_add(1, Ordering::Relaxed);
        match compute().await {
            Ok(value) => {
                match serde_json::to_vec(&value) {
                    Ok(bytes) => {
                        let bytes = Arc::new(bytes);
                        self.store_bytes(&guard.key, bytes.as_ref().clone(), ttl)
                            .await;
                        guard.publish(Ok(bytes));
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "Failed to encode computed value");
                    }
                }
                Ok(value)
            }
            Err(e) => {
                guard.publish(Err(Arc::new(e.clone())));
                Err(e)
            }
        }
    }

    fn join(&self, key: &str) -> Role {
        match self.in_flight.entry(key.to_string()) {
            Entry::Occupied(entry) => Role::Follower(entry.get().tx.subscribe()),
            Entry::Vacant(entry) => {
                let (tx, _rx) = watch::channel(None);
                let flight = Arc::new(Flight { tx });
                entry.insert(flight.clone());
                Role::Leader(flight)
            }
        }
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = match tokio::time::timeout(self.store_timeout, self.store.get(key)).await {
            Ok(Ok(bytes)) => bytes?,
            Ok(Err(e)) => {
                self.record_store_error(key, &e);
                return None;
            }
            Err(_) => {
                self.record_store_error(key, &CacheError::unavailable("read timed out"));
                return None;
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = %key, error = %e, "Discarding undecodable cache entry");
                None
            }
        }
    }

    async fn store_bytes(&self, key: &str, bytes: Vec<u8>, ttl: Duration) {
        match tokio::time::timeout(self.store_timeout, self.store.put(key, bytes, ttl)).await {
            Ok(Ok(())) => debug!(key = %key, ttl_secs = ttl.as_secs(), "Cache entry stored"),
            Ok(Err(e)) => self.record_store_error(key, &e),
            Err(_) => self.record_store_error(key, &CacheError::unavailable("write timed out")),
        }
    }

    /// Drop expired entries from stores without native expiry.
    pub async fn purge_expired(&self) -> usize {
        self.store.purge_expired().await
    }

    /// Reachability of the backing store.
    pub async fn ping(&self) -> CacheResult<()> {
        match tokio::time::timeout(self.store_timeout, self.store.ping()).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::unavailable("ping timed out")),
        }
    }

    /// Number of computations currently in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            backend: self.store.backend(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            computations: self.counters.computations.load(Ordering::Relaxed),
            store_errors: self.counters.store_errors.load(Ordering::Relaxed),
            in_flight: self.in_flight.len(),
        }
    }

    fn record_hit(&self, key: &CacheKey) {
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("mscan_cache_hits_total", "family" => family(key)).increment(1);
        debug!(key = %key, "Cache HIT");
    }

    fn record_miss(&self, key: &CacheKey) {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("mscan_cache_misses_total", "family" => family(key)).increment(1);
        debug!(key = %key, "Cache MISS");
    }

    fn record_store_error(&self, key: &str, error: &CacheError) {
        self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("mscan_cache_unavailable_total").increment(1);
        warn!(
            key = %key,
            backend = self.store.backend(),
            error = %error,
            "Cache store unavailable; continuing without cache"
        );
    }
}

fn family(key: &CacheKey) -> &'static str {
    match key {
        CacheKey::Embedding(_) => "embed",
        CacheKey::Result(_) => "result",
    }
}
