//! Status events published on every job transition.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::JobError;
use crate::job::{Job, JobId, JobStatus, Stage};

/// Immutable snapshot of a job transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StatusEvent {
    pub job_id: JobId,
    pub status: JobStatus,
    pub stage: Stage,
    pub progress_pct: f64,
    pub timestamp: DateTime<Utc>,
    /// Per-job sequence number, strictly increasing.
    pub seq: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,
}

impl StatusEvent {
    /// Capture the current state of a job.
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            status: job.status,
            stage: job.stage,
            progress_pct: job.progress_pct,
            timestamp: job.updated_at,
            seq: job.event_seq,
            // Errors only travel on failed/retrying events.
            error: match (job.status, job.stage) {
                (JobStatus::Failed, _) | (_, Stage::Retrying) => job.error.clone(),
                _ => None,
            },
            result_ref: job.result_ref.clone(),
        }
    }

    /// Terminal events (`completed`, `failed`, `cancelled`) are never dropped.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_key::ContentHash;

    #[test]
    fn test_event_from_queued_job() {
        let job = Job::new("file:///tmp/a.mp4", ContentHash::of_bytes(b"a"), "c", 3);
        let event = StatusEvent::from_job(&job);
        assert_eq!(event.status, JobStatus::Queued);
        assert_eq!(event.progress_pct, 0.0);
        assert!(event.error.is_none());
        assert!(!event.is_terminal());
    }

    #[test]
    fn test_retrying_event_carries_error() {
        let mut job = Job::new("k", ContentHash::of_bytes(b"a"), "c", 3);
        job.claim().unwrap();
        job.schedule_retry(JobError::transient("detector timed out"))
            .unwrap();
        let event = StatusEvent::from_job(&job);
        assert_eq!(event.stage, Stage::Retrying);
        assert_eq!(event.status, JobStatus::Queued);
        assert_eq!(event.error.unwrap().message, "detector timed out");
        assert_eq!(event.seq, 2);
    }
}
