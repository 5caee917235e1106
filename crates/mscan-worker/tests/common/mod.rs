//! Shared harness for end-to-end worker scenarios.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use mscan_cache::ContentCache;
use mscan_detector::{Artifact, Detector, DetectorError, DetectorResult, StageOutput, StageRequest};
use mscan_models::{Job, JobId, JobStatus, Stage, StatusEvent};
use mscan_queue::{
    BroadcastConfig, Dispatcher, DispatcherConfig, EventSink, JobStore, StatusBroadcaster,
    WorkQueue,
};
use mscan_worker::{JobExecutor, RetryConfig, RetryController, StagePipeline, WorkerConfig, WorkerResult};

/// Scripted failure for the next call to a stage.
#[derive(Debug, Clone)]
pub enum Failure {
    Timeout,
    Reject,
    Panic,
    Hang(Duration),
}

struct Gate {
    stage: Stage,
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

/// Detector double that records calls and follows a script.
#[derive(Default)]
pub struct ScriptedDetector {
    calls: Mutex<Vec<(JobId, Stage)>>,
    failures: Mutex<HashMap<Stage, VecDeque<Failure>>>,
    delays: Mutex<HashMap<Stage, Duration>>,
    gate: Mutex<Option<Gate>>,
}

impl ScriptedDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(self, stage: Stage, failure: Failure) -> Self {
        self.failures
            .lock()
            .unwrap()
            .entry(stage)
            .or_default()
            .push_back(failure);
        self
    }

    pub fn fail_times(mut self, stage: Stage, failure: Failure, times: usize) -> Self {
        for _ in 0..times {
            self = self.fail_next(stage, failure.clone());
        }
        self
    }

    pub fn delay(self, stage: Stage, delay: Duration) -> Self {
        self.delays.lock().unwrap().insert(stage, delay);
        self
    }

    /// Block calls to `stage` until released. Returns (entered, release).
    pub fn gate(&self, stage: Stage) -> (Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(Gate {
            stage,
            entered: entered.clone(),
            release: release.clone(),
        });
        (entered, release)
    }

    pub fn calls_for_stage(&self, stage: Stage) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, s)| *s == stage)
            .count()
    }

    pub fn calls_for_job(&self, job_id: &JobId) -> Vec<Stage> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == job_id)
            .map(|(_, s)| *s)
            .collect()
    }
}

#[async_trait]
impl Detector for ScriptedDetector {
    async fn detect(&self, request: StageRequest) -> DetectorResult<StageOutput> {
        self.calls
            .lock()
            .unwrap()
            .push((request.job_id.clone(), request.stage));

        let gate = self
            .gate
            .lock()
            .unwrap()
            .as_ref()
            .filter(|g| g.stage == request.stage)
            .map(|g| (g.entered.clone(), g.release.clone()));
        if let Some((entered, release)) = gate {
            entered.notify_one();
            release.notified().await;
        }

        let failure = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&request.stage)
            .and_then(|q| q.pop_front());
        match failure {
            Some(Failure::Timeout) => return Err(DetectorError::Timeout(30)),
            Some(Failure::Reject) => {
                return Err(DetectorError::invalid_input("unsupported container"))
            }
            Some(Failure::Panic) => panic!("detector crashed"),
            Some(Failure::Hang(d)) => tokio::time::sleep(d).await,
            None => {}
        }

        let delay = self.delays.lock().unwrap().get(&request.stage).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        Ok(StageOutput::new(Artifact::new(serde_json::json!({
            "stage": request.stage,
            "content_hash": request.content_hash,
        }))))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Records every published event with its arrival time, then forwards it.
pub struct EventLog {
    events: Mutex<Vec<(Instant, StatusEvent)>>,
    inner: Arc<StatusBroadcaster>,
}

impl EventLog {
    pub fn for_job(&self, job_id: &JobId) -> Vec<(Instant, StatusEvent)> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, e)| &e.job_id == job_id)
            .cloned()
            .collect()
    }
}

impl EventSink for EventLog {
    fn publish(&self, event: StatusEvent) {
        self.events
            .lock()
            .unwrap()
            .push((Instant::now(), event.clone()));
        self.inner.publish(event);
    }
}

pub struct HarnessConfig {
    pub worker: WorkerConfig,
    pub retry: RetryConfig,
    pub dispatcher: DispatcherConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            worker: WorkerConfig {
                worker_slots: 4,
                resource_tokens: 4,
                stage_timeout: Duration::from_secs(5),
                shutdown_timeout: Duration::from_secs(2),
            },
            retry: RetryConfig::default()
                .with_base_delay(Duration::from_millis(100))
                .with_max_delay(Duration::from_millis(400)),
            dispatcher: DispatcherConfig {
                rate_limit_per_minute: 1000,
                max_retries: 3,
            },
        }
    }
}

pub struct Harness {
    pub store: Arc<JobStore>,
    pub queue: Arc<WorkQueue>,
    pub dispatcher: Dispatcher,
    pub broadcaster: Arc<StatusBroadcaster>,
    pub events: Arc<EventLog>,
    pub cache: Arc<ContentCache>,
    pub detector: Arc<ScriptedDetector>,
    pub executor: Arc<JobExecutor>,
    pub handle: JoinHandle<WorkerResult<()>>,
}

impl Harness {
    pub fn start(detector: ScriptedDetector) -> Self {
        Self::start_with(detector, HarnessConfig::default())
    }

    pub fn start_with(detector: ScriptedDetector, config: HarnessConfig) -> Self {
        let broadcaster = Arc::new(StatusBroadcaster::new(BroadcastConfig::default()));
        let events = Arc::new(EventLog {
            events: Mutex::new(Vec::new()),
            inner: broadcaster.clone(),
        });
        let store = Arc::new(JobStore::new(events.clone()));
        let queue = Arc::new(WorkQueue::new());
        let cache = Arc::new(ContentCache::in_memory());
        let detector = Arc::new(detector);

        let dispatcher = Dispatcher::new(store.clone(), queue.clone(), config.dispatcher);
        let pipeline = Arc::new(StagePipeline::new(
            detector.clone(),
            cache.clone(),
            store.clone(),
            config.worker.stage_timeout,
        ));
        let retry = Arc::new(RetryController::new(
            store.clone(),
            queue.clone(),
            config.retry,
        ));
        let executor = Arc::new(JobExecutor::new(
            config.worker,
            store.clone(),
            queue.clone(),
            pipeline,
            retry,
        ));
        let handle = tokio::spawn(executor.clone().run());

        Self {
            store,
            queue,
            dispatcher,
            broadcaster,
            events,
            cache,
            detector,
            executor,
            handle,
        }
    }

    /// Poll until the job reaches `status`.
    pub async fn wait_for(&self, job_id: &JobId, status: JobStatus) -> Job {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(job) = self.store.get(job_id) {
                if job.status == status {
                    return job;
                }
                if job.is_terminal() {
                    panic!("job ended {} while waiting for {}: {:?}", job.status, status, job.error);
                }
            }
            if Instant::now() > deadline {
                panic!("timed out waiting for {} on {}", status, job_id);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn stop(self) {
        self.executor.shutdown();
        self.handle.await.unwrap().unwrap();
    }
}
