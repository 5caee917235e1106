//! Application state.

use std::sync::Arc;

use mscan_cache::ContentCache;
use mscan_detector::Detector;
use mscan_queue::{Dispatcher, JobStore, StatusBroadcaster, WorkQueue};
use mscan_worker::{JobExecutor, RetryController, StagePipeline};

use crate::config::ApiConfig;
use crate::gateway::Gateway;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub store: Arc<JobStore>,
    pub queue: Arc<WorkQueue>,
    pub dispatcher: Arc<Dispatcher>,
    pub broadcaster: Arc<StatusBroadcaster>,
    pub cache: Arc<ContentCache>,
    pub detector: Arc<dyn Detector>,
    pub executor: Arc<JobExecutor>,
    pub gateway: Arc<Gateway>,
}

impl AppState {
    /// Wire every component together. Nothing is spawned; the caller runs
    /// `executor` and the sweepers.
    pub fn new(config: ApiConfig, cache: ContentCache, detector: Arc<dyn Detector>) -> Self {
        let broadcaster = Arc::new(StatusBroadcaster::new(config.broadcast.clone()));
        let store = Arc::new(JobStore::new(broadcaster.clone()));
        let queue = Arc::new(WorkQueue::new());
        let cache = Arc::new(cache);

        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            queue.clone(),
            config.dispatcher.clone(),
        ));
        let pipeline = Arc::new(StagePipeline::new(
            detector.clone(),
            cache.clone(),
            store.clone(),
            config.worker.stage_timeout,
        ));
        let retry = Arc::new(RetryController::new(
            store.clone(),
            queue.clone(),
            config.retry.clone(),
        ));
        let executor = Arc::new(JobExecutor::new(
            config.worker.clone(),
            store.clone(),
            queue.clone(),
            pipeline,
            retry,
        ));
        let gateway = Arc::new(Gateway::new(
            store.clone(),
            broadcaster.clone(),
            config.gateway.clone(),
        ));

        Self {
            config,
            store,
            queue,
            dispatcher,
            broadcaster,
            cache,
            detector,
            executor,
            gateway,
        }
    }
}
