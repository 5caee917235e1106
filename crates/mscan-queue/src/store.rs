//! Authoritative job records.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use mscan_models::{Job, JobId, JobStateError, JobStatus, StatusEvent};

use crate::error::{QueueError, QueueResult};
use crate::progress::{EventSink, NullSink};

/// Job counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// In-memory job store.
///
/// Every mutation that advances a job's `event_seq` publishes a
/// `StatusEvent` while the record is still locked, so events for one job
/// reach the sink in transition order.
pub struct JobStore {
    jobs: DashMap<JobId, Job>,
    sink: Arc<dyn EventSink>,
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new(Arc::new(NullSink))
    }
}

impl JobStore {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            jobs: DashMap::new(),
            sink,
        }
    }

    /// Insert a new job and publish its initial event.
    pub fn insert(&self, job: Job) -> Job {
        let snapshot = job.clone();
        let entry = self.jobs.entry(job.id.clone()).insert(job);
        self.sink.publish(StatusEvent::from_job(entry.value()));
        snapshot
    }

    /// Snapshot of a job.
    pub fn get(&self, id: &JobId) -> Option<Job> {
        self.jobs.get(id).map(|j| j.clone())
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.jobs.contains_key(id)
    }

    /// Apply a transition atomically and return its result with the updated
    /// snapshot.
    pub fn update<R>(
        &self,
        id: &JobId,
        f: impl FnOnce(&mut Job) -> Result<R, JobStateError>,
    ) -> QueueResult<(R, Job)> {
        let mut entry = self.jobs.get_mut(id).ok_or_else(|| QueueError::not_found(id))?;
        let job = entry.value_mut();
        let seq_before = job.event_seq;
        let result = f(job)?;
        if job.event_seq != seq_before {
            self.sink.publish(StatusEvent::from_job(job));
        }
        Ok((result, job.clone()))
    }

    /// Claim a queued job for processing. Returns `None` if the job is no
    /// longer queued (cancelled, or already claimed).
    pub fn claim(&self, id: &JobId) -> QueueResult<Option<Job>> {
        let (claimed, job) = self.update(id, |job| {
            if job.status == JobStatus::Queued {
                job.claim().map(|_| true)
            } else {
                Ok(false)
            }
        })?;
        Ok(claimed.then_some(job))
    }

    /// Whether a caller asked to cancel this job.
    pub fn cancel_requested(&self, id: &JobId) -> bool {
        self.jobs
            .get(id)
            .map(|j| j.cancel_requested)
            .unwrap_or(false)
    }

    pub fn counts(&self) -> JobCounts {
        let mut counts = JobCounts::default();
        for job in self.jobs.iter() {
            match job.status {
                JobStatus::Queued => counts.queued += 1,
                JobStatus::Processing => counts.processing += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
                JobStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Delete terminal jobs last updated before `cutoff`.
    pub fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Vec<JobId> {
        let expired: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|j| j.is_terminal() && j.updated_at < cutoff)
            .map(|j| j.id.clone())
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for id in expired {
            if self
                .jobs
                .remove_if(&id, |_, j| j.is_terminal() && j.updated_at < cutoff)
                .is_some()
            {
                removed.push(id);
            }
        }
        if !removed.is_empty() {
            debug!(removed = removed.len(), "Purged expired terminal jobs");
        }
        removed
    }
}
