//! Error taxonomy shared by every component.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::job::JobStatus;

/// Classification of an error, recorded on jobs and sent to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed submission; never retried.
    Validation,
    /// Submission rejected by the per-caller limiter.
    RateLimited,
    /// Timeout or temporary unavailability; retried with backoff.
    TransientWorker,
    /// The detector rejected the input; terminal.
    PermanentWorker,
    /// Cache backing store unreachable. Logged only.
    CacheUnavailable,
    /// Client connection dropped. Gateway-side only.
    ConnectionLost,
    /// Job was cancelled by a caller.
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::TransientWorker => "transient_worker",
            ErrorKind::PermanentWorker => "permanent_worker",
            ErrorKind::CacheUnavailable => "cache_unavailable",
            ErrorKind::ConnectionLost => "connection_lost",
            ErrorKind::Cancelled => "cancelled",
        }
    }

    /// Whether a job failing with this kind may be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::TransientWorker | ErrorKind::CacheUnavailable)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error stored on a job record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct JobError {
    pub kind: ErrorKind,
    /// Human-readable message suitable for end users.
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransientWorker, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermanentWorker, message)
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Rejected job state transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobStateError {
    #[error("job is terminal ({0}) and cannot be modified")]
    Terminal(JobStatus),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
}
