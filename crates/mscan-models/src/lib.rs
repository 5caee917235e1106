//! Shared data models for the MediaScan analysis core.
//!
//! This crate provides Serde-serializable types for:
//! - Jobs, their status lifecycle and processing stages
//! - Status events fanned out to subscribers
//! - The streaming protocol spoken over WebSocket
//! - Content hashes and cache keys
//! - The error taxonomy recorded on failed jobs

pub mod cache_key;
pub mod error;
pub mod event;
pub mod input;
pub mod job;
pub mod ws;

pub use cache_key::{CacheKey, ContentHash};
pub use error::{ErrorKind, JobError, JobStateError};
pub use event::StatusEvent;
pub use input::{validate_input_ref, InputRefError, MAX_INPUT_REF_LENGTH};
pub use job::{ConnectionId, Job, JobId, JobStatus, Stage, DEFAULT_MAX_RETRIES};
pub use ws::{ClientMessage, ServerMessage};
