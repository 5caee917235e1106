//! Per-job stage machine.
//!
//! ```text
//! result:{hash} hit ───────────────────────────────────────────────┐
//!                                                                  ▼
//! preprocessing → [embed:{hash}] frame_extraction → feature_analysis
//!               → [result:{hash}] inference → postprocessing → finalizing
//! ```
//!
//! Bracketed keys wrap the stages after them in `get_or_compute`, so
//! concurrent jobs with identical content share one computation and later
//! jobs skip it entirely. Cancellation is checked at every stage boundary.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mscan_cache::ContentCache;
use mscan_detector::{Artifact, Detector, StageRequest};
use mscan_models::{CacheKey, ContentHash, Job, JobId, Stage};
use mscan_queue::JobStore;

use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;

/// Finalized result, cached under `result:{content_hash}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub content_hash: ContentHash,
    pub detection: Artifact,
}

/// How an attempt ended without error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed { result_ref: String, cache_hit: bool },
}

/// Runs one job attempt through the stages.
pub struct StagePipeline {
    detector: Arc<dyn Detector>,
    cache: Arc<ContentCache>,
    store: Arc<JobStore>,
    stage_timeout: Duration,
}

impl StagePipeline {
    pub fn new(
        detector: Arc<dyn Detector>,
        cache: Arc<ContentCache>,
        store: Arc<JobStore>,
        stage_timeout: Duration,
    ) -> Self {
        Self {
            detector,
            cache,
            store,
            stage_timeout,
        }
    }

    /// Run a claimed job. Returns `Err(WorkerError::Cancelled)` when a
    /// cancellation request was observed at a stage boundary.
    pub async fn run(&self, job: &Job) -> WorkerResult<PipelineOutcome> {
        let logger = JobLogger::new(&job.id, job.retry_count + 1);
        let result_key = CacheKey::result(&job.content_hash);

        if self.cache.get::<AnalysisReport>(&result_key).await.is_some() {
            logger.log_start("result cache hit, skipping analysis");
            self.checkpoint(&job.id)?;
            self.enter(job, Stage::Finalizing, &logger)?;
            return Ok(PipelineOutcome::Completed {
                result_ref: result_key.render(),
                cache_hit: true,
            });
        }

        logger.log_start(job.input_ref.as_str());
        self.checkpoint(&job.id)?;
        self.enter(job, Stage::Preprocessing, &logger)?;
        let prepared = self.call(job, Stage::Preprocessing, Artifact::empty()).await?;

        self.checkpoint(&job.id)?;
        let embedding = self.embedding(job, prepared, &logger).await?;

        self.checkpoint(&job.id)?;
        self.report(job, embedding, &logger).await?;

        self.checkpoint(&job.id)?;
        self.enter(job, Stage::Finalizing, &logger)?;
        Ok(PipelineOutcome::Completed {
            result_ref: result_key.render(),
            cache_hit: false,
        })
    }

    /// frame_extraction + feature_analysis, shared through `embed:{hash}`.
    async fn embedding(
        &self,
        job: &Job,
        prepared: Artifact,
        logger: &JobLogger,
    ) -> WorkerResult<Artifact> {
        let key = CacheKey::embedding(&job.content_hash);
        let ttl = self.cache.ttl_for(&key);

        loop {
            let prepared = prepared.clone();
            let result = self
                .cache
                .get_or_compute(&key, ttl, || async move {
                    self.enter(job, Stage::FrameExtraction, logger)?;
                    let frames = self.call(job, Stage::FrameExtraction, prepared).await?;
                    self.checkpoint(&job.id)?;
                    self.enter(job, Stage::FeatureAnalysis, logger)?;
                    self.call(job, Stage::FeatureAnalysis, frames).await
                })
                .await;

            match result {
                // Another job led this computation and was cancelled.
                Err(WorkerError::Cancelled) if !self.store.cancel_requested(&job.id) => continue,
                other => return other,
            }
        }
    }

    /// inference + postprocessing, shared through `result:{hash}`.
    async fn report(
        &self,
        job: &Job,
        embedding: Artifact,
        logger: &JobLogger,
    ) -> WorkerResult<AnalysisReport> {
        let key = CacheKey::result(&job.content_hash);
        let ttl = self.cache.ttl_for(&key);

        loop {
            let embedding = embedding.clone();
            let result = self
                .cache
                .get_or_compute(&key, ttl, || async move {
                    self.enter(job, Stage::Inference, logger)?;
                    let scores = self.call(job, Stage::Inference, embedding).await?;
                    self.checkpoint(&job.id)?;
                    self.enter(job, Stage::Postprocessing, logger)?;
                    let detection = self.call(job, Stage::Postprocessing, scores).await?;
                    Ok(AnalysisReport {
                        content_hash: job.content_hash.clone(),
                        detection,
                    })
                })
                .await;

            match result {
                Err(WorkerError::Cancelled) if !self.store.cancel_requested(&job.id) => continue,
                other => return other,
            }
        }
    }

    fn checkpoint(&self, job_id: &JobId) -> WorkerResult<()> {
        if self.store.cancel_requested(job_id) {
            Err(WorkerError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn enter(&self, job: &Job, stage: Stage, logger: &JobLogger) -> WorkerResult<()> {
        let (_, snapshot) = self.store.update(&job.id, |j| j.enter_stage(stage))?;
        logger.log_stage(stage, snapshot.progress_pct);
        Ok(())
    }

    async fn call(&self, job: &Job, stage: Stage, input: Artifact) -> WorkerResult<Artifact> {
        let request = StageRequest::new(&job.id, stage, job.input_ref.as_str(), &job.content_hash)
            .with_input(input);
        let started = Instant::now();

        let result = tokio::time::timeout(self.stage_timeout, self.detector.detect(request)).await;
        metrics::histogram!("mscan_stage_duration_seconds", "stage" => stage.as_str())
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(Ok(output)) => Ok(output.artifact),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(WorkerError::StageTimeout {
                stage,
                secs: self.stage_timeout.as_secs(),
            }),
        }
    }
}
