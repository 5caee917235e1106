//! Retry decisions with exponential backoff.
//!
//! `RetryController::decide` is a pure function of the job and the error;
//! `handle_failure` applies the decision to the store and queue.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use mscan_models::{Job, JobId, JobStatus, Stage};
use mscan_queue::{JobStore, WorkQueue};

use crate::error::{WorkerError, WorkerResult};

/// Backoff configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first retry; doubles with each further attempt.
    pub base_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryConfig {
    pub fn from_env() -> Self {
        Self {
            base_delay: std::env::var("RETRY_BASE_DELAY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(Duration::from_secs(60)),
            max_delay: std::env::var("RETRY_MAX_DELAY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(Duration::from_secs(300)),
        }
    }

    /// Set the base delay for exponential backoff.
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Set the maximum delay.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay before retry number `retry_count + 1`.
    pub fn delay_for_attempt(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Outcome of a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryAction {
    /// Re-enqueue after `delay`; `attempt` is the new `retry_count`.
    Retry { delay: Duration, attempt: u32 },
    /// Terminal failure.
    Fail { reason: FailReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    Permanent,
    RetriesExhausted,
}

/// Applies retry policy to failed jobs.
pub struct RetryController {
    store: Arc<JobStore>,
    queue: Arc<WorkQueue>,
    config: RetryConfig,
}

impl RetryController {
    pub fn new(store: Arc<JobStore>, queue: Arc<WorkQueue>, config: RetryConfig) -> Self {
        Self {
            store,
            queue,
            config,
        }
    }

    /// Decide what to do with a failed attempt.
    pub fn decide(&self, job: &Job, error: &WorkerError) -> RetryAction {
        if !error.is_retryable() {
            return RetryAction::Fail {
                reason: FailReason::Permanent,
            };
        }
        if job.retry_count >= job.max_retries {
            return RetryAction::Fail {
                reason: FailReason::RetriesExhausted,
            };
        }
        RetryAction::Retry {
            delay: self.config.delay_for_attempt(job.retry_count),
            attempt: job.retry_count + 1,
        }
    }

    /// Record the failure and either fail the job or schedule its retry.
    ///
    /// The `retrying` event is published before this returns; the job id is
    /// re-enqueued once the delay has elapsed.
    pub fn handle_failure(&self, job_id: &JobId, error: &WorkerError) -> WorkerResult<RetryAction> {
        let (action, job) = self.store.update(job_id, |job| {
            let action = self.decide(job, error);
            match &action {
                RetryAction::Retry { .. } => job.schedule_retry(error.to_job_error())?,
                RetryAction::Fail { reason } => {
                    let mut record = error.to_job_error();
                    if *reason == FailReason::RetriesExhausted {
                        record.message = format!(
                            "Failed after {} retries: {}",
                            job.max_retries, record.message
                        );
                    }
                    job.fail(record)?
                }
            }
            Ok(action)
        })?;

        match &action {
            RetryAction::Retry { delay, attempt } => {
                metrics::counter!("mscan_jobs_retried_total").increment(1);
                info!(
                    job_id = %job_id,
                    attempt = *attempt,
                    max_retries = job.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Job will be retried"
                );
                self.schedule_requeue(job_id.clone(), *delay);
            }
            RetryAction::Fail { reason } => {
                metrics::counter!("mscan_jobs_failed_total").increment(1);
                warn!(
                    job_id = %job_id,
                    retry_count = job.retry_count,
                    reason = ?reason,
                    error = %error,
                    "Job failed"
                );
            }
        }
        Ok(action)
    }

    fn schedule_requeue(&self, job_id: JobId, delay: Duration) {
        let store = self.store.clone();
        let queue = self.queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match store.get(&job_id) {
                Some(job) if job.status == JobStatus::Queued && job.stage == Stage::Retrying => {
                    debug!(job_id = %job_id, "Re-enqueueing job after backoff");
                    queue.push(job_id);
                }
                _ => debug!(job_id = %job_id, "Skipping re-enqueue; job no longer waiting"),
            }
        });
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mscan_models::{ContentHash, ErrorKind};

    fn controller(base: Duration) -> (RetryController, Arc<JobStore>, Arc<WorkQueue>) {
        let store = Arc::new(JobStore::default());
        let queue = Arc::new(WorkQueue::new());
        let controller = RetryController::new(
            store.clone(),
            queue.clone(),
            RetryConfig::default().with_base_delay(base),
        );
        (controller, store, queue)
    }

    fn processing_job(store: &JobStore) -> Job {
        let job = store.insert(Job::new("k", ContentHash::of_bytes(b"k"), "c", 3));
        store.claim(&job.id).unwrap().unwrap()
    }

    fn timeout() -> WorkerError {
        WorkerError::StageTimeout {
            stage: Stage::Inference,
            secs: 300,
        }
    }

    #[test]
    fn test_delay_calculation() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(60));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(120));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(240));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(300));
        assert_eq!(config.delay_for_attempt(40), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_decide() {
        let (controller, store, _) = controller(Duration::from_secs(60));
        let mut job = processing_job(&store);

        assert_eq!(
            controller.decide(&job, &timeout()),
            RetryAction::Retry {
                delay: Duration::from_secs(60),
                attempt: 1
            }
        );
        assert_eq!(
            controller.decide(&job, &WorkerError::InvalidInput("corrupt".into())),
            RetryAction::Fail {
                reason: FailReason::Permanent
            }
        );

        job.retry_count = job.max_retries;
        assert_eq!(
            controller.decide(&job, &timeout()),
            RetryAction::Fail {
                reason: FailReason::RetriesExhausted
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_requeues_after_delay() {
        let (controller, store, queue) = controller(Duration::from_secs(60));
        let job = processing_job(&store);

        controller.handle_failure(&job.id, &timeout()).unwrap();
        let snapshot = store.get(&job.id).unwrap();
        assert_eq!(snapshot.status, JobStatus::Queued);
        assert_eq!(snapshot.stage, Stage::Retrying);
        assert_eq!(snapshot.retry_count, 1);
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_during_backoff_is_not_requeued() {
        let (controller, store, queue) = controller(Duration::from_secs(60));
        let job = processing_job(&store);

        controller.handle_failure(&job.id, &timeout()).unwrap();
        store.update(&job.id, |j| j.cancel()).unwrap();

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_job() {
        let (controller, store, _) = controller(Duration::from_millis(1));
        let job = processing_job(&store);

        for _ in 0..3 {
            controller.handle_failure(&job.id, &timeout()).unwrap();
            store.claim(&job.id).unwrap().unwrap();
        }
        let action = controller.handle_failure(&job.id, &timeout()).unwrap();
        assert!(matches!(action, RetryAction::Fail { .. }));

        let failed = store.get(&job.id).unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.retry_count, failed.max_retries);
        let error = failed.error.unwrap();
        assert_eq!(error.kind, ErrorKind::TransientWorker);
        assert!(error.message.starts_with("Failed after 3 retries"));
    }
}
