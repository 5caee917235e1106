//! Job executor.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, error, info, warn, Instrument};

use mscan_models::JobId;
use mscan_queue::{JobStore, WorkQueue};

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::pipeline::{PipelineOutcome, StagePipeline};
use crate::resources::ResourcePool;
use crate::retry::RetryController;

/// Slot usage snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutorStats {
    pub slots: usize,
    pub busy_slots: usize,
    pub resource_tokens: usize,
    pub available_tokens: usize,
}

/// Fixed pool of slots that pull job ids from the work queue.
pub struct JobExecutor {
    config: WorkerConfig,
    store: Arc<JobStore>,
    queue: Arc<WorkQueue>,
    pipeline: Arc<StagePipeline>,
    retry: Arc<RetryController>,
    resources: ResourcePool,
    busy: AtomicUsize,
    /// Job tasks in flight, aborted if shutdown times out.
    running: Mutex<HashMap<JobId, AbortHandle>>,
    shutdown: watch::Sender<bool>,
}

impl JobExecutor {
    pub fn new(
        config: WorkerConfig,
        store: Arc<JobStore>,
        queue: Arc<WorkQueue>,
        pipeline: Arc<StagePipeline>,
        retry: Arc<RetryController>,
    ) -> Self {
        let resources = ResourcePool::new(config.resource_tokens);
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            store,
            queue,
            pipeline,
            retry,
            resources,
            busy: AtomicUsize::new(0),
            running: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    /// Run all slots until shutdown is signalled, then wait (bounded) for
    /// in-flight jobs.
    pub async fn run(self: Arc<Self>) -> WorkerResult<()> {
        if self.resources.total() == 0 {
            error!("No resource tokens configured; refusing to start job executor");
            return Err(WorkerError::resource_unavailable("no resource tokens configured"));
        }
        let slots = self.config.effective_slots();
        info!(
            slots,
            resource_tokens = self.resources.total(),
            stage_timeout_secs = self.config.stage_timeout.as_secs(),
            "Starting job executor"
        );

        let mut set = JoinSet::new();
        for slot in 0..slots {
            let executor = Arc::clone(&self);
            set.spawn(async move { executor.slot_loop(slot).await });
        }

        let mut shutdown_rx = self.shutdown.subscribe();
        while !*shutdown_rx.borrow() {
            if shutdown_rx.changed().await.is_err() {
                break;
            }
        }

        info!("Shutdown signal received, waiting for in-flight jobs...");
        let drained = tokio::time::timeout(self.config.shutdown_timeout, async {
            while set.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                busy_slots = self.busy.load(Ordering::Relaxed),
                "Shutdown timeout elapsed with jobs still running"
            );
            set.abort_all();
            while set.join_next().await.is_some() {}

            let running: Vec<(JobId, AbortHandle)> = self
                .running
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .drain()
                .collect();
            for (job_id, task) in running {
                warn!(job_id = %job_id, "Aborting job task at shutdown");
                task.abort();
            }
        }

        info!("Job executor stopped");
        Ok(())
    }

    async fn slot_loop(&self, slot: usize) {
        let mut shutdown_rx = self.shutdown.subscribe();
        debug!(slot, "Worker slot started");

        while let Some(job_id) = self.queue.pop(&mut shutdown_rx).await {
            let token = match self.resources.acquire().await {
                Ok(token) => token,
                Err(e) => {
                    error!(slot, error = %e, "Resource pool unavailable, re-queueing job");
                    self.queue.push(job_id);
                    break;
                }
            };

            let job = match self.store.claim(&job_id) {
                Ok(Some(job)) => job,
                Ok(None) => {
                    debug!(job_id = %job_id, "Job no longer queued, skipping");
                    continue;
                }
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Failed to claim job");
                    continue;
                }
            };

            self.busy.fetch_add(1, Ordering::Relaxed);
            metrics::gauge!("mscan_worker_busy_slots").increment(1.0);

            let logger = JobLogger::new(&job.id, job.retry_count + 1);
            let pipeline = Arc::clone(&self.pipeline);
            let started = Instant::now();

            // The token moves into the task so it is released however the
            // task ends.
            let handle = tokio::spawn(
                async move {
                    let _token = token;
                    pipeline.run(&job).await
                }
                .instrument(logger.create_span()),
            );

            self.running
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(job_id.clone(), handle.abort_handle());
            let joined = handle.await;
            self.running
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&job_id);

            let result = match joined {
                Ok(result) => result,
                Err(e) if e.is_panic() => {
                    logger.log_error("worker task panicked");
                    Err(WorkerError::Panicked(format!("job task panicked: {}", e)))
                }
                Err(e) => Err(WorkerError::Panicked(e.to_string())),
            };

            self.finish(&job_id, result, &logger, started.elapsed());
            self.busy.fetch_sub(1, Ordering::Relaxed);
            metrics::gauge!("mscan_worker_busy_slots").decrement(1.0);
        }

        debug!(slot, "Worker slot stopped");
    }

    fn finish(
        &self,
        job_id: &JobId,
        result: WorkerResult<PipelineOutcome>,
        logger: &JobLogger,
        elapsed: Duration,
    ) {
        metrics::histogram!("mscan_job_duration_seconds").record(elapsed.as_secs_f64());

        let outcome = match result {
            Ok(PipelineOutcome::Completed {
                result_ref,
                cache_hit,
            }) => self
                .store
                .update(job_id, |job| job.complete(result_ref))
                .map(|_| {
                    metrics::counter!("mscan_jobs_completed_total").increment(1);
                    logger.log_completion(if cache_hit { "served from cache" } else { "analyzed" });
                }),
            // A failure after a cancel request still ends as cancelled.
            Err(e) if matches!(e, WorkerError::Cancelled) || self.store.cancel_requested(job_id) => {
                self.store.update(job_id, |job| job.cancel()).map(|_| {
                    metrics::counter!("mscan_jobs_cancelled_total").increment(1);
                    logger.log_warning("cancelled at stage boundary");
                })
            }
            Err(e) => {
                logger.log_error(&e.to_string());
                match self.retry.handle_failure(job_id, &e) {
                    Ok(_) => Ok(()),
                    Err(WorkerError::Queue(q)) => Err(q),
                    Err(other) => {
                        error!(job_id = %job_id, error = %other, "Retry handling failed");
                        Ok(())
                    }
                }
            }
        };

        if let Err(e) = outcome {
            // Job was removed or finalized concurrently.
            warn!(job_id = %job_id, error = %e, "Could not record job outcome");
        }
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn resources(&self) -> &ResourcePool {
        &self.resources
    }

    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            slots: self.config.effective_slots(),
            busy_slots: self.busy.load(Ordering::Relaxed),
            resource_tokens: self.resources.total(),
            available_tokens: self.resources.available(),
        }
    }
}
