//! Content-addressed cache for the MediaScan analysis core.
//!
//! Provides:
//! - A pluggable backing store (in-memory or Redis) with TTL-only expiry
//! - `ContentCache::get_or_compute`, which coalesces concurrent misses for the
//!   same key into a single computation
//! - Degraded operation: store failures read as misses and writes are dropped

pub mod config;
pub mod content_cache;
pub mod error;
pub mod redis_store;
pub mod store;

pub use config::{CacheBackend, CacheConfig};
pub use content_cache::{CacheStats, ContentCache};
pub use error::{CacheError, CacheResult};
pub use redis_store::RedisStore;
pub use store::{CacheStore, MemoryStore};
