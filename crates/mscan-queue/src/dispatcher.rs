//! Job submission, cancellation and status lookup.

use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use serde::Deserialize;
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::{debug, info, warn};

use mscan_models::{validate_input_ref, ContentHash, Job, JobId, JobStatus};

use crate::config::DispatcherConfig;
use crate::error::{QueueError, QueueResult};
use crate::queue::WorkQueue;
use crate::store::JobStore;

/// Derives the content hash for a submission that did not supply one.
pub trait ContentHasher: Send + Sync {
    fn hash(&self, input_ref: &str) -> ContentHash;
}

/// SHA-256 over the reference string.
pub struct Sha256Hasher;

impl ContentHasher for Sha256Hasher {
    fn hash(&self, input_ref: &str) -> ContentHash {
        ContentHash::of_bytes(input_ref.trim().as_bytes())
    }
}

/// A submission.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub input_ref: String,
    /// Precomputed digest of the media bytes
    #[serde(default)]
    pub content_hash: Option<String>,
}

impl SubmitRequest {
    pub fn new(input_ref: impl Into<String>) -> Self {
        Self {
            input_ref: input_ref.into(),
            content_hash: None,
        }
    }

    pub fn with_content_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }
}

/// Entry point for new work.
pub struct Dispatcher {
    store: Arc<JobStore>,
    queue: Arc<WorkQueue>,
    limiter: DefaultKeyedRateLimiter<String>,
    hasher: Arc<dyn ContentHasher>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(store: Arc<JobStore>, queue: Arc<WorkQueue>, config: DispatcherConfig) -> Self {
        let per_minute = NonZeroU32::new(config.rate_limit_per_minute).unwrap_or(NonZeroU32::MIN);
        Self {
            store,
            queue,
            limiter: RateLimiter::keyed(Quota::per_minute(per_minute)),
            hasher: Arc::new(Sha256Hasher),
            config,
        }
    }

    /// Replace the content hasher.
    pub fn with_hasher(mut self, hasher: Arc<dyn ContentHasher>) -> Self {
        self.hasher = hasher;
        self
    }

    /// Validate, rate-limit, record and enqueue a job. Never blocks on
    /// processing.
    pub fn submit(&self, caller: &str, request: SubmitRequest) -> QueueResult<Job> {
        validate_input_ref(&request.input_ref).map_err(|e| {
            metrics::counter!("mscan_jobs_rejected_total", "reason" => "validation").increment(1);
            QueueError::validation(e.to_string())
        })?;

        let content_hash = match request.content_hash.as_deref() {
            Some(raw) => ContentHash::parse(raw).ok_or_else(|| {
                metrics::counter!("mscan_jobs_rejected_total", "reason" => "validation")
                    .increment(1);
                QueueError::validation("content_hash must be a 64-character hex digest")
            })?,
            None => self.hasher.hash(&request.input_ref),
        };

        if let Err(not_until) = self.limiter.check_key(&caller.to_string()) {
            let wait = not_until.wait_time_from(DefaultClock::default().now());
            warn!(caller = %caller, retry_after_secs = wait.as_secs(), "Submission rate limited");
            metrics::counter!("mscan_jobs_rejected_total", "reason" => "rate_limited")
                .increment(1);
            return Err(QueueError::RateLimited {
                caller: caller.to_string(),
                retry_after_secs: wait.as_secs().max(1),
            });
        }

        let job = Job::new(
            request.input_ref.trim(),
            content_hash,
            caller,
            self.config.max_retries,
        );
        let job = self.store.insert(job);
        self.queue.push(job.id.clone());

        metrics::counter!("mscan_jobs_submitted_total").increment(1);
        info!(
            job_id = %job.id,
            caller = %caller,
            content_hash = %job.content_hash,
            "Job submitted"
        );
        Ok(job)
    }

    /// Cancel a job. Queued jobs are cancelled immediately; processing jobs
    /// are flagged and finalized by their worker at the next stage boundary.
    pub fn cancel(&self, job_id: &JobId) -> QueueResult<Job> {
        let current = self
            .store
            .get(job_id)
            .ok_or_else(|| QueueError::not_found(job_id))?;
        if current.is_terminal() {
            return Err(QueueError::AlreadyTerminal {
                job_id: job_id.to_string(),
                status: current.status,
            });
        }

        let (_, job) = self
            .store
            .update(job_id, |job| match job.status {
                JobStatus::Queued => job.cancel(),
                _ => job.request_cancel(),
            })
            .map_err(|e| match e {
                QueueError::InvalidState(_) => QueueError::AlreadyTerminal {
                    job_id: job_id.to_string(),
                    status: self
                        .store
                        .get(job_id)
                        .map(|j| j.status)
                        .unwrap_or(JobStatus::Cancelled),
                },
                other => other,
            })?;

        if job.status == JobStatus::Cancelled {
            self.queue.remove(job_id);
            metrics::counter!("mscan_jobs_cancelled_total").increment(1);
            info!(job_id = %job_id, "Queued job cancelled");
        } else {
            debug!(job_id = %job_id, stage = %job.stage, "Cancellation requested");
        }
        Ok(job)
    }

    /// Polling contract: current snapshot of a job.
    pub fn get_status(&self, job_id: &JobId) -> QueueResult<Job> {
        self.store
            .get(job_id)
            .ok_or_else(|| QueueError::not_found(job_id))
    }

    /// Drop limiter state for idle callers.
    pub fn prune_rate_limits(&self) {
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn dispatcher() -> (Dispatcher, Arc<JobStore>, Arc<WorkQueue>) {
        let store = Arc::new(JobStore::default());
        let queue = Arc::new(WorkQueue::new());
        let dispatcher = Dispatcher::new(store.clone(), queue.clone(), DispatcherConfig::default());
        (dispatcher, store, queue)
    }

    #[test]
    fn test_submit_creates_queued_job() {
        let (dispatcher, store, queue) = dispatcher();
        let start = Instant::now();
        let job = dispatcher
            .submit("alice", SubmitRequest::new("s3://media/a.mp4"))
            .unwrap();
        assert!(start.elapsed() < Duration::from_millis(50));
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.caller_id, "alice");
        assert!(store.contains(&job.id));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_validation_errors_are_not_queued() {
        let (dispatcher, store, _) = dispatcher();
        let err = dispatcher.submit("alice", SubmitRequest::new("")).unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));

        let err = dispatcher
            .submit("alice", SubmitRequest::new("a.mp4").with_content_hash("nothex"))
            .unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_eleventh_submission_rate_limited() {
        let (dispatcher, store, _) = dispatcher();
        for i in 0..10 {
            dispatcher
                .submit("alice", SubmitRequest::new(format!("uploads/{}.mp4", i)))
                .unwrap();
        }
        let err = dispatcher
            .submit("alice", SubmitRequest::new("uploads/10.mp4"))
            .unwrap_err();
        assert!(matches!(err, QueueError::RateLimited { .. }));
        assert_eq!(store.len(), 10);

        // Other callers have their own bucket.
        assert!(dispatcher.submit("bob", SubmitRequest::new("uploads/x.mp4")).is_ok());
    }

    #[test]
    fn test_identical_content_shares_hash() {
        let (dispatcher, _, _) = dispatcher();
        let a = dispatcher.submit("alice", SubmitRequest::new("uploads/same.mp4")).unwrap();
        let b = dispatcher.submit("bob", SubmitRequest::new("uploads/same.mp4")).unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(a.content_hash, b.content_hash);
    }

    #[test]
    fn test_supplied_hash_overrides_hasher() {
        struct Fixed;
        impl ContentHasher for Fixed {
            fn hash(&self, _input_ref: &str) -> ContentHash {
                ContentHash::of_bytes(b"fixed")
            }
        }

        let (dispatcher, _, _) = dispatcher();
        let dispatcher = dispatcher.with_hasher(Arc::new(Fixed));
        let a = dispatcher.submit("alice", SubmitRequest::new("a.mp4")).unwrap();
        let b = dispatcher.submit("alice", SubmitRequest::new("b.mp4")).unwrap();
        assert_eq!(a.content_hash, ContentHash::of_bytes(b"fixed"));
        assert_eq!(a.content_hash, b.content_hash);

        let digest = "AB".repeat(32);
        let c = dispatcher
            .submit("alice", SubmitRequest::new("c.mp4").with_content_hash(digest))
            .unwrap();
        assert_eq!(c.content_hash.as_str(), "ab".repeat(32));
    }

    #[test]
    fn test_cancel_queued_job() {
        let (dispatcher, _, queue) = dispatcher();
        let job = dispatcher.submit("alice", SubmitRequest::new("a.mp4")).unwrap();
        let cancelled = dispatcher.cancel(&job.id).unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(queue.is_empty());

        let err = dispatcher.cancel(&job.id).unwrap_err();
        assert!(matches!(err, QueueError::AlreadyTerminal { .. }));
    }

    #[test]
    fn test_cancel_processing_job_is_cooperative() {
        let (dispatcher, store, queue) = dispatcher();
        let job = dispatcher.submit("alice", SubmitRequest::new("a.mp4")).unwrap();
        queue.try_pop();
        store.claim(&job.id).unwrap();

        let flagged = dispatcher.cancel(&job.id).unwrap();
        assert_eq!(flagged.status, JobStatus::Processing);
        assert!(store.cancel_requested(&job.id));
    }

    #[test]
    fn test_get_status_unknown() {
        let (dispatcher, _, _) = dispatcher();
        assert!(matches!(
            dispatcher.get_status(&JobId::new()),
            Err(QueueError::JobNotFound(_))
        ));
    }
}
