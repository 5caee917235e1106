//! Structured job logging utilities.

use tracing::{error, info, warn, Span};

use mscan_models::{JobId, Stage};

/// Job logger giving every lifecycle line the same job/attempt context.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    attempt: u32,
}

impl JobLogger {
    /// `attempt` is 1-based.
    pub fn new(job_id: &JobId, attempt: u32) -> Self {
        Self {
            job_id: job_id.to_string(),
            attempt,
        }
    }

    pub fn log_start(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            attempt = self.attempt,
            "Job started: {}", message
        );
    }

    pub fn log_stage(&self, stage: Stage, progress_pct: f64) {
        info!(
            job_id = %self.job_id,
            attempt = self.attempt,
            stage = %stage,
            progress_pct,
            "Job stage"
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            job_id = %self.job_id,
            attempt = self.attempt,
            "Job warning: {}", message
        );
    }

    pub fn log_error(&self, message: &str) {
        error!(
            job_id = %self.job_id,
            attempt = self.attempt,
            "Job error: {}", message
        );
    }

    pub fn log_completion(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            attempt = self.attempt,
            "Job completed: {}", message
        );
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Span wrapping one attempt.
    pub fn create_span(&self) -> Span {
        tracing::info_span!("job", job_id = %self.job_id, attempt = self.attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_logger_creation() {
        let job_id = JobId::new();
        let logger = JobLogger::new(&job_id, 2);

        assert_eq!(logger.job_id(), job_id.to_string());
        assert_eq!(logger.attempt(), 2);
    }
}
