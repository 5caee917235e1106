//! Cache configuration.

use std::time::Duration;

/// Which backing store the cache uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheBackend {
    Memory,
    Redis { url: String },
}

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub backend: CacheBackend,

    /// TTL for `embed:*` entries
    pub embed_ttl: Duration,

    /// TTL for `result:*` entries
    pub result_ttl: Duration,

    /// Interval of the expired-entry sweep (in-memory backend only)
    pub sweep_interval: Duration,

    /// Timeout applied to every backing store call
    pub store_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Memory,
            embed_ttl: Duration::from_secs(24 * 3600),
            result_ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
            store_timeout: Duration::from_secs(2),
        }
    }
}

impl CacheConfig {
    /// Load from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let backend = match std::env::var("CACHE_BACKEND").ok().as_deref() {
            Some("redis") => CacheBackend::Redis {
                url: std::env::var("REDIS_URL")
                    .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            },
            _ => CacheBackend::Memory,
        };

        Self {
            backend,
            embed_ttl: env_secs("CACHE_EMBED_TTL_SECS").unwrap_or(defaults.embed_ttl),
            result_ttl: env_secs("CACHE_RESULT_TTL_SECS").unwrap_or(defaults.result_ttl),
            sweep_interval: env_secs("CACHE_SWEEP_INTERVAL_SECS")
                .unwrap_or(defaults.sweep_interval),
            store_timeout: std::env::var("CACHE_STORE_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.store_timeout),
        }
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.backend, CacheBackend::Memory);
        assert_eq!(config.embed_ttl, Duration::from_secs(86_400));
        assert_eq!(config.result_ttl, Duration::from_secs(3_600));
    }
}
