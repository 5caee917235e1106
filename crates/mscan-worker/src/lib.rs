//! Analysis worker pool.
//!
//! This crate provides:
//! - `JobExecutor`: fixed pool of slots pulling from the work queue
//! - `StagePipeline`: the per-job stage machine with cache lookups
//! - `RetryController`: explicit retry/fail decisions with backoff
//! - `ResourcePool`: compute tokens held for the duration of a job

pub mod config;
pub mod error;
pub mod executor;
pub mod logging;
pub mod pipeline;
pub mod resources;
pub mod retry;

pub use config::WorkerConfig;
pub use error::{WorkerError, WorkerResult};
pub use executor::{ExecutorStats, JobExecutor};
pub use logging::JobLogger;
pub use pipeline::{AnalysisReport, PipelineOutcome, StagePipeline};
pub use resources::{ResourcePool, ResourceToken};
pub use retry::{RetryAction, RetryConfig, RetryController};
