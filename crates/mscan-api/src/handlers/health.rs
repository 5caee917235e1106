//! Health check handlers.

use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Serialize;

use crate::state::AppState;

/// Health response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: String,
}

/// Health check endpoint (liveness probe).
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

/// Readiness check response.
#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub checks: ReadinessChecks,
}

#[derive(Serialize)]
pub struct ReadinessChecks {
    pub cache: CheckStatus,
    pub detector: DetectorCheck,
    pub workers: WorkerCheck,
}

#[derive(Serialize)]
pub struct CheckStatus {
    pub status: String,
    pub backend: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

#[derive(Serialize)]
pub struct DetectorCheck {
    pub status: String,
    pub name: String,
}

#[derive(Serialize)]
pub struct WorkerCheck {
    pub queue_depth: usize,
    pub busy_slots: usize,
    pub available_tokens: usize,
}

/// Readiness check endpoint (readiness probe).
///
/// An unreachable cache store only degrades the service, since jobs compute
/// through it. An unhealthy detector makes the service unready.
pub async fn ready(
    State(state): State<AppState>,
) -> Result<Json<ReadinessResponse>, (StatusCode, Json<ReadinessResponse>)> {
    let backend = state.cache.stats().backend.to_string();
    let start = Instant::now();
    let (ping, detector_ok) = tokio::join!(state.cache.ping(), state.detector.health_check());

    let cache = match ping {
        Ok(()) => CheckStatus {
            status: "ok".to_string(),
            backend,
            error: None,
            latency_ms: Some(start.elapsed().as_millis() as u64),
        },
        Err(e) => CheckStatus {
            status: "degraded".to_string(),
            backend,
            error: Some(e.to_string()),
            latency_ms: None,
        },
    };
    let detector = DetectorCheck {
        status: if detector_ok { "ok" } else { "error" }.to_string(),
        name: state.detector.name().to_string(),
    };

    let stats = state.executor.stats();
    let workers = WorkerCheck {
        queue_depth: state.queue.len(),
        busy_slots: stats.busy_slots,
        available_tokens: stats.available_tokens,
    };

    let status = match (detector_ok, cache.status == "ok") {
        (false, _) => "unavailable",
        (true, false) => "degraded",
        (true, true) => "ready",
    };
    let response = ReadinessResponse {
        status: status.to_string(),
        checks: ReadinessChecks {
            cache,
            detector,
            workers,
        },
    };

    if detector_ok {
        Ok(Json(response))
    } else {
        Err((StatusCode::SERVICE_UNAVAILABLE, Json(response)))
    }
}
