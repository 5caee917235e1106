//! Axum HTTP/WS gateway for the MediaScan analysis core.
//!
//! This crate provides:
//! - Job submission, status polling and cancellation over REST
//! - The streaming status protocol over WebSocket
//! - Health, readiness and stats endpoints
//! - Prometheus metrics and background sweepers

pub mod config;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod sweep;
pub mod ws;

pub use config::ApiConfig;
pub use error::{ApiError, ApiResult};
pub use gateway::{Gateway, GatewayConfig, Heartbeat, HeartbeatAction};
pub use routes::create_router;
pub use state::AppState;
pub use sweep::{CacheSweeper, RateLimitSweeper, RetentionSweeper};
