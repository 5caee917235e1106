//! Job submission, polling and cancellation.

use std::net::SocketAddr;

use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use mscan_cache::CacheStats;
use mscan_models::{Job, JobError, JobId, JobStatus, Stage};
use mscan_queue::{BroadcastStats, JobCounts, SubmitRequest};
use mscan_worker::ExecutorStats;

use crate::error::{ApiError, ApiResult};
use crate::middleware::resolve_caller;
use crate::state::AppState;

/// Response for an accepted submission.
#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub job_id: JobId,
    pub status: JobStatus,
}

/// Job status, as returned to pollers.
#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job_id: JobId,
    pub status: JobStatus,
    pub stage: Stage,
    pub progress_pct: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,
    pub retry_count: u32,
    pub updated_at: DateTime<Utc>,
    /// Set while cancellation of a processing job is pending.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub cancel_requested: bool,
    /// Suggested delay before the next poll; absent once terminal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_after_ms: Option<u64>,
}

impl JobStatusResponse {
    fn from_job(job: Job, poll_after_ms: u64) -> Self {
        let poll_after_ms = (!job.is_terminal()).then_some(poll_after_ms);
        Self {
            job_id: job.id,
            status: job.status,
            stage: job.stage,
            progress_pct: job.progress_pct,
            error: job.error,
            result_ref: job.result_ref,
            retry_count: job.retry_count,
            updated_at: job.updated_at,
            cancel_requested: job.cancel_requested,
            poll_after_ms,
        }
    }
}

/// Service-wide counters.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub queue_depth: usize,
    pub workers: ExecutorStats,
    pub jobs: JobCounts,
    pub broadcast: BroadcastStats,
    pub cache: CacheStats,
}

/// `POST /api/jobs`
pub async fn submit_job(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let Json(request) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let caller = resolve_caller(&headers, connect_info.as_ref());

    let job = state.dispatcher.submit(&caller, request)?;
    info!(job_id = %job.id, caller = %caller, content_hash = %job.content_hash, "Job accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id: job.id,
            status: job.status,
        }),
    ))
}

/// `GET /api/jobs/:job_id`
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobStatusResponse>> {
    let job = state
        .dispatcher
        .get_status(&JobId::from_string(job_id))?;
    Ok(Json(JobStatusResponse::from_job(
        job,
        state.config.poll_after.as_millis() as u64,
    )))
}

/// `DELETE /api/jobs/:job_id`
///
/// Queued jobs are cancelled at once; processing jobs stop at their next
/// stage boundary and report `cancel_requested` until then.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobStatusResponse>> {
    let job = state.dispatcher.cancel(&JobId::from_string(job_id))?;
    info!(job_id = %job.id, status = %job.status, "Cancellation requested");
    Ok(Json(JobStatusResponse::from_job(
        job,
        state.config.poll_after.as_millis() as u64,
    )))
}

/// `GET /api/stats`
pub async fn get_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        queue_depth: state.queue.len(),
        workers: state.executor.stats(),
        jobs: state.store.counts(),
        broadcast: state.broadcaster.stats(),
        cache: state.cache.stats(),
    })
}
