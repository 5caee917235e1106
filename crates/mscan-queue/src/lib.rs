//! In-process job orchestration primitives.
//!
//! This crate provides:
//! - `JobStore`: authoritative job records with atomic transitions
//! - `WorkQueue`: cancellable MPMC queue of job ids
//! - `Dispatcher`: validated, rate-limited submission and cancellation
//! - `StatusBroadcaster`: per-connection fan-out of status events

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod progress;
pub mod queue;
pub mod store;

pub use config::{BroadcastConfig, DispatcherConfig};
pub use dispatcher::{ContentHasher, Dispatcher, Sha256Hasher, SubmitRequest};
pub use error::{QueueError, QueueResult};
pub use progress::{BroadcastStats, EventSink, NullSink, Outbox, StatusBroadcaster};
pub use queue::WorkQueue;
pub use store::{JobCounts, JobStore};
