//! Detector collaborator for the MediaScan analysis core.
//!
//! The inference ensemble is external. This crate defines the seam the worker
//! calls through (`Detector`) and ships one adapter, an HTTP client for the
//! inference service.

pub mod client;
pub mod error;
pub mod types;

pub use client::{DetectorConfig, HttpDetector};
pub use error::{DetectorError, DetectorResult};
pub use types::{Artifact, Detector, StageOutput, StageRequest};
