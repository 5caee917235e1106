//! In-process work queue.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use tokio::sync::{watch, Notify};
use tracing::debug;

use mscan_models::JobId;

/// FIFO of job ids shared by producers (dispatcher, retry controller) and
/// consumers (worker slots).
///
/// `pop` blocks until an id is available or shutdown is signalled.
pub struct WorkQueue {
    items: Mutex<VecDeque<JobId>>,
    notify: Notify,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Enqueue without blocking.
    pub fn push(&self, job_id: JobId) {
        let depth = {
            let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
            items.push_back(job_id);
            items.len()
        };
        metrics::gauge!("mscan_queue_depth").set(depth as f64);
        self.notify.notify_one();
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<JobId> {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        let item = items.pop_front();
        if item.is_some() {
            metrics::gauge!("mscan_queue_depth").set(items.len() as f64);
        }
        item
    }

    /// Wait for the next id. Returns `None` once `shutdown` flips to true.
    pub async fn pop(&self, shutdown: &mut watch::Receiver<bool>) -> Option<JobId> {
        loop {
            if *shutdown.borrow() {
                return None;
            }
            if let Some(job_id) = self.try_pop() {
                return Some(job_id);
            }

            tokio::select! {
                _ = self.notify.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    /// Remove a queued id (cancellation before claim).
    pub fn remove(&self, job_id: &JobId) -> bool {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        let before = items.len();
        items.retain(|id| id != job_id);
        let removed = items.len() != before;
        if removed {
            debug!(job_id = %job_id, "Removed job from work queue");
            metrics::gauge!("mscan_queue_depth").set(items.len() as f64);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = WorkQueue::new();
        let (_tx, mut rx) = watch::channel(false);
        let a = JobId::new();
        let b = JobId::new();
        queue.push(a.clone());
        queue.push(b.clone());
        assert_eq!(queue.pop(&mut rx).await, Some(a));
        assert_eq!(queue.pop(&mut rx).await, Some(b));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = Arc::new(WorkQueue::new());
        let (_tx, rx) = watch::channel(false);
        let consumer = {
            let queue = queue.clone();
            let mut rx = rx.clone();
            tokio::spawn(async move { queue.pop(&mut rx).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let id = JobId::new();
        queue.push(id.clone());
        assert_eq!(consumer.await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn test_pop_cancelled_by_shutdown() {
        let queue = Arc::new(WorkQueue::new());
        let (tx, rx) = watch::channel(false);
        let consumer = {
            let queue = queue.clone();
            let mut rx = rx.clone();
            tokio::spawn(async move { queue.pop(&mut rx).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send(true).unwrap();
        assert_eq!(consumer.await.unwrap(), None);
    }

    #[test]
    fn test_remove() {
        let queue = WorkQueue::new();
        let a = JobId::new();
        queue.push(a.clone());
        queue.push(JobId::new());
        assert!(queue.remove(&a));
        assert!(!queue.remove(&a));
        assert_eq!(queue.len(), 1);
    }
}
