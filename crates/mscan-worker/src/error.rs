//! Worker error types.

use thiserror::Error;

use mscan_detector::DetectorError;
use mscan_models::{ErrorKind, JobError, Stage};
use mscan_queue::QueueError;

pub type WorkerResult<T> = Result<T, WorkerError>;

/// Failure of one job attempt.
///
/// Cloneable so one computation's error can be shared with every job
/// waiting on the same cache key.
#[derive(Debug, Clone, Error)]
pub enum WorkerError {
    #[error("Stage {stage} timed out after {secs}s")]
    StageTimeout { stage: Stage, secs: u64 },

    #[error("Detector unavailable: {0}")]
    DetectorUnavailable(String),

    #[error("Detector rejected input: {0}")]
    InvalidInput(String),

    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("Worker panicked: {0}")]
    Panicked(String),

    #[error("Job cancelled")]
    Cancelled,

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

impl WorkerError {
    pub fn resource_unavailable(msg: impl Into<String>) -> Self {
        Self::ResourceUnavailable(msg.into())
    }

    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WorkerError::StageTimeout { .. }
                | WorkerError::DetectorUnavailable(_)
                | WorkerError::ResourceUnavailable(_)
                | WorkerError::Panicked(_)
        )
    }

    /// Errors where another attempt cannot help.
    pub fn is_permanent_failure(&self) -> bool {
        matches!(self, WorkerError::InvalidInput(_) | WorkerError::Queue(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkerError::Cancelled => ErrorKind::Cancelled,
            e if e.is_retryable() => ErrorKind::TransientWorker,
            _ => ErrorKind::PermanentWorker,
        }
    }

    /// Record form stored on the job.
    pub fn to_job_error(&self) -> JobError {
        JobError::new(self.kind(), self.to_string())
    }
}

impl From<DetectorError> for WorkerError {
    fn from(e: DetectorError) -> Self {
        if e.is_retryable() {
            WorkerError::DetectorUnavailable(e.to_string())
        } else {
            WorkerError::InvalidInput(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let timeout = WorkerError::StageTimeout {
            stage: Stage::Inference,
            secs: 300,
        };
        assert!(timeout.is_retryable());
        assert_eq!(timeout.kind(), ErrorKind::TransientWorker);
        assert_eq!(timeout.to_string(), "Stage inference timed out after 300s");

        let rejected: WorkerError = DetectorError::invalid_input("corrupt").into();
        assert!(rejected.is_permanent_failure());
        assert_eq!(rejected.to_job_error().kind, ErrorKind::PermanentWorker);

        let unavailable: WorkerError = DetectorError::Timeout(30).into();
        assert!(unavailable.is_retryable());
        assert_eq!(WorkerError::Cancelled.kind(), ErrorKind::Cancelled);
    }
}
