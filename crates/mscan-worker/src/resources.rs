//! Compute resource tokens.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{WorkerError, WorkerResult};

/// Fixed pool of compute tokens.
#[derive(Clone)]
pub struct ResourcePool {
    semaphore: Arc<Semaphore>,
    total: usize,
}

/// One held token. Returned to the pool when dropped, including during a
/// panic unwind of the task that owns it.
pub struct ResourceToken {
    _permit: OwnedSemaphorePermit,
}

impl ResourcePool {
    pub fn new(total: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(total)),
            total,
        }
    }

    /// Wait for a free token.
    pub async fn acquire(&self) -> WorkerResult<ResourceToken> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| WorkerError::resource_unavailable("resource pool closed"))?;
        metrics::gauge!("mscan_resource_tokens_available")
            .set(self.semaphore.available_permits() as f64);
        Ok(ResourceToken { _permit: permit })
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn total(&self) -> usize {
        self.total
    }
}
