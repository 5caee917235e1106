//! API configuration.

use std::time::Duration;

use mscan_cache::CacheConfig;
use mscan_detector::DetectorConfig;
use mscan_queue::{BroadcastConfig, DispatcherConfig};
use mscan_worker::{RetryConfig, WorkerConfig};

use crate::gateway::GatewayConfig;

/// Server configuration, including every component the binary wires up.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// CORS origins
    pub cors_origins: Vec<String>,
    /// Max request body size
    pub max_body_size: usize,
    /// Environment (development/production)
    pub environment: String,
    /// Serve `/metrics`
    pub metrics_enabled: bool,
    /// Hint returned to pollers while a job is live
    pub poll_after: Duration,
    /// Terminal jobs older than this are deleted. `None` keeps them forever.
    pub job_retention: Option<Duration>,
    /// How often the retention sweep runs
    pub retention_sweep_interval: Duration,
    pub gateway: GatewayConfig,
    pub worker: WorkerConfig,
    pub retry: RetryConfig,
    pub dispatcher: DispatcherConfig,
    pub broadcast: BroadcastConfig,
    pub cache: CacheConfig,
    pub detector: DetectorConfig,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            cors_origins: vec!["*".to_string()],
            max_body_size: 64 * 1024,
            environment: "development".to_string(),
            metrics_enabled: true,
            poll_after: Duration::from_millis(5000),
            job_retention: Some(Duration::from_secs(86_400)),
            retention_sweep_interval: Duration::from_secs(300),
            gateway: GatewayConfig::default(),
            worker: WorkerConfig::default(),
            retry: RetryConfig::default(),
            dispatcher: DispatcherConfig::default(),
            broadcast: BroadcastConfig::default(),
            cache: CacheConfig::default(),
            detector: DetectorConfig::default(),
        }
    }
}

impl ApiConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("API_HOST").unwrap_or(defaults.host),
            port: env_parse("API_PORT").unwrap_or(defaults.port),
            cors_origins: std::env::var("CORS_ORIGINS")
                .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or(defaults.cors_origins),
            max_body_size: env_parse("MAX_BODY_SIZE").unwrap_or(defaults.max_body_size),
            environment: std::env::var("ENVIRONMENT").unwrap_or(defaults.environment),
            metrics_enabled: std::env::var("METRICS_ENABLED")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.metrics_enabled),
            poll_after: env_parse("POLL_AFTER_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_after),
            job_retention: match env_parse::<u64>("JOB_RETENTION_SECS") {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => defaults.job_retention,
            },
            retention_sweep_interval: env_parse("RETENTION_SWEEP_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.retention_sweep_interval),
            gateway: GatewayConfig::from_env(),
            worker: WorkerConfig::from_env(),
            retry: RetryConfig::from_env(),
            dispatcher: DispatcherConfig::from_env(),
            broadcast: BroadcastConfig::from_env(),
            cache: CacheConfig::from_env(),
            detector: DetectorConfig::from_env(),
        }
    }

    /// Check if running in production mode.
    pub fn is_production(&self) -> bool {
        self.environment.to_lowercase() == "production"
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}
