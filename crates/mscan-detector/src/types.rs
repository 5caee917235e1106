//! Detector seam and request/response types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use mscan_models::{ContentHash, JobId, Stage};

use crate::error::DetectorResult;

/// Opaque stage payload (frames, embeddings, scores). The core never
/// inspects it; it only caches and forwards it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Artifact(pub serde_json::Value);

impl Artifact {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn empty() -> Self {
        Self(serde_json::Value::Null)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_null()
    }
}

/// Input for one detector stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRequest {
    pub job_id: JobId,
    pub stage: Stage,
    pub input_ref: String,
    pub content_hash: ContentHash,
    /// Output of the previous stage, when the stage consumes one
    #[serde(default, skip_serializing_if = "Artifact::is_empty")]
    pub input: Artifact,
}

impl StageRequest {
    pub fn new(
        job_id: &JobId,
        stage: Stage,
        input_ref: impl Into<String>,
        content_hash: &ContentHash,
    ) -> Self {
        Self {
            job_id: job_id.clone(),
            stage,
            input_ref: input_ref.into(),
            content_hash: content_hash.clone(),
            input: Artifact::empty(),
        }
    }

    /// Attach the previous stage's artifact.
    pub fn with_input(mut self, input: Artifact) -> Self {
        self.input = input;
        self
    }
}

/// Output of one detector stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    pub artifact: Artifact,
}

impl StageOutput {
    pub fn new(artifact: Artifact) -> Self {
        Self { artifact }
    }
}

/// External inference collaborator.
///
/// Calls must be idempotent: the worker may repeat any stage after a
/// transient failure.
#[async_trait]
pub trait Detector: Send + Sync {
    /// Run one stage.
    async fn detect(&self, request: StageRequest) -> DetectorResult<StageOutput>;

    /// Liveness of the collaborator, reported by the readiness probe.
    async fn health_check(&self) -> bool {
        true
    }

    /// Name for logs.
    fn name(&self) -> &str;
}
