//! Worker configuration.

use std::time::Duration;
use tracing::warn;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Requested execution slots
    pub worker_slots: usize,
    /// Compute resource tokens (e.g. one per GPU-capable slot)
    pub resource_tokens: usize,
    /// Maximum duration of a single stage
    pub stage_timeout: Duration,
    /// Graceful shutdown timeout for in-flight jobs
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_slots: 4,
            resource_tokens: 4,
            stage_timeout: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            worker_slots: positive_count("WORKER_SLOTS", 4),
            resource_tokens: positive_count("WORKER_RESOURCE_TOKENS", 4),
            stage_timeout: Duration::from_secs(
                std::env::var("WORKER_STAGE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(300),
            ),
            shutdown_timeout: Duration::from_secs(
                std::env::var("WORKER_SHUTDOWN_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
        }
    }

    /// Slots actually started: never more than there are tokens.
    pub fn effective_slots(&self) -> usize {
        self.worker_slots.min(self.resource_tokens).max(1)
    }
}

/// Read a count that must be at least one; zero falls back to `default`.
fn positive_count(key: &str, default: usize) -> usize {
    match std::env::var(key).ok().map(|s| s.parse::<usize>()) {
        Some(Ok(0)) => {
            warn!(key, default, "Zero is not a usable count, falling back to default");
            default
        }
        Some(Ok(n)) => n,
        _ => default,
    }
}
