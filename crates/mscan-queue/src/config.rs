//! Dispatcher and broadcaster configuration.

use mscan_models::DEFAULT_MAX_RETRIES;

/// Submission settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Submissions allowed per caller per minute (also the burst size)
    pub rate_limit_per_minute: u32,
    /// Retry ceiling stamped on new jobs
    pub max_retries: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            rate_limit_per_minute: 10,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl DispatcherConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            rate_limit_per_minute: std::env::var("RATE_LIMIT_PER_MINUTE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            max_retries: std::env::var("JOB_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MAX_RETRIES),
        }
    }
}

/// Fan-out settings.
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Per-connection outbound buffer capacity
    pub outbound_buffer: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self { outbound_buffer: 64 }
    }
}

impl BroadcastConfig {
    pub fn from_env() -> Self {
        Self {
            outbound_buffer: std::env::var("OUTBOUND_BUFFER_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(64),
        }
    }
}
