//! Queue error types.

use thiserror::Error;

use mscan_models::{ErrorKind, JobStateError, JobStatus};

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Clone, Error)]
pub enum QueueError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Rate limit exceeded for caller {caller}")]
    RateLimited { caller: String, retry_after_secs: u64 },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job {job_id} is already {status}")]
    AlreadyTerminal { job_id: String, status: JobStatus },

    #[error("Invalid state: {0}")]
    InvalidState(#[from] JobStateError),
}

impl QueueError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(job_id: impl ToString) -> Self {
        Self::JobNotFound(job_id.to_string())
    }

    /// Taxonomy entry for submission-side errors.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            QueueError::Validation(_) => Some(ErrorKind::Validation),
            QueueError::RateLimited { .. } => Some(ErrorKind::RateLimited),
            _ => None,
        }
    }
}
