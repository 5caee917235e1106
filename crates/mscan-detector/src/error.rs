//! Detector error types.

use thiserror::Error;

pub type DetectorResult<T> = Result<T, DetectorError>;

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("Detector unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Timeout after {0} seconds")]
    Timeout(u64),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DetectorError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::ServiceUnavailable(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Temporary conditions; the same request may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DetectorError::ServiceUnavailable(_)
                | DetectorError::Timeout(_)
                | DetectorError::Network(_)
                | DetectorError::InvalidResponse(_)
        )
    }

    /// The input itself is unprocessable.
    pub fn is_permanent_failure(&self) -> bool {
        !self.is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(DetectorError::Timeout(30).is_retryable());
        assert!(DetectorError::unavailable("503").is_retryable());
        assert!(DetectorError::invalid_input("corrupt container").is_permanent_failure());
        assert!(DetectorError::Rejected("unsupported codec".into()).is_permanent_failure());
    }
}
