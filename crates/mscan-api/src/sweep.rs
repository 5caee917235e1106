//! Background sweepers.
//!
//! - `CacheSweeper` evicts expired cache entries on a fixed interval.
//! - `RetentionSweeper` deletes terminal jobs past their retention window
//!   and drops their broadcast state.
//! - `RateLimitSweeper` forgets limiter state for idle callers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use mscan_cache::ContentCache;
use mscan_queue::{Dispatcher, JobStore, StatusBroadcaster};

use crate::metrics;

/// Periodic purge of expired cache entries.
pub struct CacheSweeper {
    cache: Arc<ContentCache>,
    every: Duration,
}

impl CacheSweeper {
    pub fn new(cache: Arc<ContentCache>, every: Duration) -> Self {
        Self { cache, every }
    }

    pub async fn sweep_once(&self) -> usize {
        let purged = self.cache.purge_expired().await;
        if purged > 0 {
            debug!(purged, "Purged expired cache entries");
            metrics::record_cache_expired(purged);
        }
        purged
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting cache sweeper (interval: {:?})", self.every);
        let mut ticker = interval(self.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_once().await;
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}

/// Deletes terminal jobs older than the retention window.
pub struct RetentionSweeper {
    store: Arc<JobStore>,
    broadcaster: Arc<StatusBroadcaster>,
    retention: Duration,
    every: Duration,
}

impl RetentionSweeper {
    pub fn new(
        store: Arc<JobStore>,
        broadcaster: Arc<StatusBroadcaster>,
        retention: Duration,
        every: Duration,
    ) -> Self {
        Self {
            store,
            broadcaster,
            retention,
            every,
        }
    }

    pub fn sweep_once(&self) -> usize {
        let Ok(retention) = chrono::Duration::from_std(self.retention) else {
            return 0;
        };
        let cutoff = Utc::now() - retention;
        let purged = self.store.purge_terminal_before(cutoff);
        for job_id in &purged {
            self.broadcaster.forget(job_id);
        }
        if !purged.is_empty() {
            info!(purged = purged.len(), "Deleted expired terminal jobs");
            metrics::record_jobs_purged(purged.len());
        }
        purged.len()
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting retention sweeper (retention: {:?}, interval: {:?})",
            self.retention, self.every
        );
        let mut ticker = interval(self.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_once();
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}

/// Periodic pruning of per-caller rate limiter state.
pub struct RateLimitSweeper {
    dispatcher: Arc<Dispatcher>,
    every: Duration,
}

impl RateLimitSweeper {
    pub fn new(dispatcher: Arc<Dispatcher>, every: Duration) -> Self {
        Self { dispatcher, every }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.dispatcher.prune_rate_limits(),
                _ = shutdown.changed() => break,
            }
        }
    }
}
