//! Job definitions and the status lifecycle.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::cache_key::ContentHash;
use crate::error::{JobError, JobStateError};

/// Default retry ceiling for a job.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one streaming client connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(format!("conn-{}", Uuid::new_v4()))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job processing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker slot (or for a retry backoff to elapse)
    #[default]
    Queued,
    /// Claimed by a worker slot
    Processing,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Cancelled by a caller
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Check if this is a terminal state (no more updates expected).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Named phase of job processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Queued,
    Preprocessing,
    FrameExtraction,
    FeatureAnalysis,
    Inference,
    Postprocessing,
    Finalizing,
    /// Waiting for a retry backoff to elapse.
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl Stage {
    /// Stages the worker walks through, in order.
    pub const PIPELINE: [Stage; 6] = [
        Stage::Preprocessing,
        Stage::FrameExtraction,
        Stage::FeatureAnalysis,
        Stage::Inference,
        Stage::Postprocessing,
        Stage::Finalizing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Queued => "queued",
            Stage::Preprocessing => "preprocessing",
            Stage::FrameExtraction => "frame_extraction",
            Stage::FeatureAnalysis => "feature_analysis",
            Stage::Inference => "inference",
            Stage::Postprocessing => "postprocessing",
            Stage::Finalizing => "finalizing",
            Stage::Retrying => "retrying",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
            Stage::Cancelled => "cancelled",
        }
    }

    /// Progress reported when a job enters this stage.
    ///
    /// `Finalizing` stays below 100 so that 100.0 is reserved for `completed`.
    pub fn progress_pct(&self) -> Option<f64> {
        match self {
            Stage::Preprocessing => Some(10.0),
            Stage::FrameExtraction => Some(25.0),
            Stage::FeatureAnalysis => Some(45.0),
            Stage::Inference => Some(75.0),
            Stage::Postprocessing => Some(90.0),
            Stage::Finalizing => Some(95.0),
            Stage::Completed => Some(100.0),
            _ => None,
        }
    }

    /// Whether the worker may enter this stage while processing.
    pub fn is_pipeline_stage(&self) -> bool {
        Self::PIPELINE.contains(self)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One submitted unit of analysis work.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,

    /// Opaque handle to the media (never the bytes)
    pub input_ref: String,

    /// Digest used for cache lookups and dedup
    pub content_hash: ContentHash,

    /// Identity the submission was charged to
    pub caller_id: String,

    pub status: JobStatus,

    pub stage: Stage,

    /// Progress (0.0-100.0)
    pub progress_pct: f64,

    /// Number of retry attempts already scheduled
    #[serde(default)]
    pub retry_count: u32,

    /// Maximum retries allowed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Last recorded error (the terminal one once failed)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,

    /// Handle to the finalized result
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,

    /// Set when a caller asked to cancel while the job was processing
    #[serde(default)]
    pub cancel_requested: bool,

    /// Sequence number for event ordering (monotonically increasing)
    #[serde(default)]
    pub event_seq: u64,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Job {
    /// Create a new queued job.
    pub fn new(
        input_ref: impl Into<String>,
        content_hash: ContentHash,
        caller_id: impl Into<String>,
        max_retries: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            input_ref: input_ref.into(),
            content_hash,
            caller_id: caller_id.into(),
            status: JobStatus::Queued,
            stage: Stage::Queued,
            progress_pct: 0.0,
            retry_count: 0,
            max_retries,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            error: None,
            result_ref: None,
            cancel_requested: false,
            event_seq: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn ensure_live(&self) -> Result<(), JobStateError> {
        if self.is_terminal() {
            Err(JobStateError::Terminal(self.status))
        } else {
            Ok(())
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.event_seq += 1;
    }

    /// Move a queued job into processing.
    pub fn claim(&mut self) -> Result<(), JobStateError> {
        self.ensure_live()?;
        if self.status != JobStatus::Queued {
            return Err(JobStateError::InvalidTransition {
                from: self.status,
                to: JobStatus::Processing,
            });
        }
        self.status = JobStatus::Processing;
        // The backoff is over; the next stage entry sets the real stage.
        if self.stage == Stage::Retrying {
            self.stage = Stage::Queued;
        }
        self.started_at.get_or_insert_with(Utc::now);
        self.touch();
        Ok(())
    }

    /// Enter a pipeline stage. Progress never moves backwards, so a retried
    /// job keeps the furthest progress it reached.
    pub fn enter_stage(&mut self, stage: Stage) -> Result<(), JobStateError> {
        self.ensure_live()?;
        if self.status != JobStatus::Processing || !stage.is_pipeline_stage() {
            return Err(JobStateError::InvalidTransition {
                from: self.status,
                to: JobStatus::Processing,
            });
        }
        let pct = stage.progress_pct().unwrap_or(self.progress_pct);
        self.stage = stage;
        self.progress_pct = self.progress_pct.max(pct);
        self.touch();
        Ok(())
    }

    /// Put a processing job back into the queue after a transient failure.
    pub fn schedule_retry(&mut self, error: JobError) -> Result<(), JobStateError> {
        self.ensure_live()?;
        if self.status != JobStatus::Processing || self.retry_count >= self.max_retries {
            return Err(JobStateError::InvalidTransition {
                from: self.status,
                to: JobStatus::Queued,
            });
        }
        self.status = JobStatus::Queued;
        self.stage = Stage::Retrying;
        self.retry_count += 1;
        self.error = Some(error);
        self.touch();
        Ok(())
    }

    /// Mark job as completed.
    pub fn complete(&mut self, result_ref: impl Into<String>) -> Result<(), JobStateError> {
        self.ensure_live()?;
        if self.status != JobStatus::Processing {
            return Err(JobStateError::InvalidTransition {
                from: self.status,
                to: JobStatus::Completed,
            });
        }
        let now = Utc::now();
        self.status = JobStatus::Completed;
        self.stage = Stage::Completed;
        self.progress_pct = 100.0;
        self.result_ref = Some(result_ref.into());
        self.error = None;
        self.completed_at = Some(now);
        self.touch();
        Ok(())
    }

    /// Mark job as failed.
    pub fn fail(&mut self, error: JobError) -> Result<(), JobStateError> {
        self.ensure_live()?;
        self.status = JobStatus::Failed;
        self.stage = Stage::Failed;
        self.error = Some(error);
        self.completed_at = Some(Utc::now());
        self.touch();
        Ok(())
    }

    /// Mark job as cancelled.
    pub fn cancel(&mut self) -> Result<(), JobStateError> {
        self.ensure_live()?;
        self.status = JobStatus::Cancelled;
        self.stage = Stage::Cancelled;
        self.completed_at = Some(Utc::now());
        self.touch();
        Ok(())
    }

    /// Record a cancellation request for a processing job.
    pub fn request_cancel(&mut self) -> Result<(), JobStateError> {
        self.ensure_live()?;
        self.cancel_requested = true;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn job() -> Job {
        Job::new("s3://bucket/a.mp4", ContentHash::of_bytes(b"a"), "caller", 3)
    }

    #[test]
    fn test_job_creation() {
        let job = job();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.stage, Stage::Queued);
        assert_eq!(job.progress_pct, 0.0);
        assert_eq!(job.retry_count, 0);
        assert!(!job.is_terminal());
    }

    #[test]
    fn test_job_state_transitions() {
        let mut job = job();
        job.claim().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.started_at.is_some());

        for stage in Stage::PIPELINE {
            job.enter_stage(stage).unwrap();
        }
        assert_eq!(job.progress_pct, 95.0);

        job.complete("result:abc").unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress_pct, 100.0);
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_terminal_job_rejects_mutation() {
        let mut job = job();
        job.cancel().unwrap();
        assert_eq!(
            job.claim(),
            Err(JobStateError::Terminal(JobStatus::Cancelled))
        );
        assert!(job.fail(JobError::permanent("x")).is_err());
        assert!(job.request_cancel().is_err());
    }

    #[test]
    fn test_progress_never_decreases_across_retry() {
        let mut job = job();
        job.claim().unwrap();
        job.enter_stage(Stage::FeatureAnalysis).unwrap();
        job.schedule_retry(JobError::transient("timeout")).unwrap();
        assert_eq!(job.stage, Stage::Retrying);
        assert_eq!(job.retry_count, 1);

        job.claim().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.stage, Stage::Queued);
        job.enter_stage(Stage::Preprocessing).unwrap();
        assert_eq!(job.progress_pct, 45.0);
        assert_eq!(job.stage, Stage::Preprocessing);
    }

    #[test]
    fn test_retry_ceiling() {
        let mut job = job();
        for _ in 0..3 {
            job.claim().unwrap();
            job.schedule_retry(JobError::transient("boom")).unwrap();
        }
        job.claim().unwrap();
        assert!(job.schedule_retry(JobError::transient("boom")).is_err());
        assert_eq!(job.retry_count, 3);
    }

    #[test]
    fn test_event_seq_increments() {
        let mut job = job();
        let before = job.event_seq;
        job.claim().unwrap();
        job.enter_stage(Stage::Preprocessing).unwrap();
        assert_eq!(job.event_seq, before + 2);
    }

    #[test]
    fn test_completed_clears_error() {
        let mut job = job();
        job.claim().unwrap();
        job.schedule_retry(JobError::transient("timeout")).unwrap();
        job.claim().unwrap();
        job.complete("result:x").unwrap();
        assert!(job.error.is_none());

        let mut failed = self::job();
        failed.fail(JobError::permanent("bad input")).unwrap();
        assert_eq!(failed.error.unwrap().kind, ErrorKind::PermanentWorker);
        assert!(failed.progress_pct < 100.0);
    }
}
