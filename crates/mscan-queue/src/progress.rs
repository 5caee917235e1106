//! Status fan-out to streaming connections.
//!
//! Every connection owns an `Outbox`: a bounded buffer drained by that
//! connection's send task. Publishing only appends to outboxes, so a client
//! that stops reading never slows the worker pool or other clients.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, trace};

use mscan_models::{ConnectionId, JobId, ServerMessage, StatusEvent};

use crate::config::BroadcastConfig;

/// Receiver of status events.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: StatusEvent);
}

struct OutboxState {
    queue: VecDeque<ServerMessage>,
    closed: bool,
}

/// Bounded per-connection buffer.
///
/// When full, the oldest non-terminal status update is evicted. Terminal
/// updates and control replies are never evicted; the buffer grows past its
/// capacity rather than lose them.
pub struct Outbox {
    state: Mutex<OutboxState>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(OutboxState {
                queue: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Append a message. Returns false once the outbox is closed.
    pub fn push(&self, msg: ServerMessage) -> bool {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.closed {
                return false;
            }

            if state.queue.len() >= self.capacity {
                if let Some(pos) = state.queue.iter().position(ServerMessage::is_droppable) {
                    state.queue.remove(pos);
                    self.record_drop();
                } else if msg.is_droppable() {
                    self.record_drop();
                    return true;
                }
            }
            state.queue.push_back(msg);
        }
        self.notify.notify_one();
        true
    }

    /// Wait for the next message. Returns `None` once closed and drained.
    pub async fn recv(&self) -> Option<ServerMessage> {
        loop {
            {
                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(msg) = state.queue.pop_front() {
                    return Some(msg);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Take everything currently buffered.
    pub fn drain(&self) -> Vec<ServerMessage> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.queue.drain(..).collect()
    }

    /// Stop accepting messages and wake the reader.
    pub fn close(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed = true;
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .queue
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages evicted or discarded under backpressure.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("mscan_broadcast_dropped_total").increment(1);
    }
}

#[derive(Default)]
struct JobChannel {
    subscribers: HashSet<ConnectionId>,
    last: Option<StatusEvent>,
}

/// Counter snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BroadcastStats {
    pub connections: usize,
    pub subscriptions: usize,
    pub tracked_jobs: usize,
    pub published: u64,
    pub dropped: u64,
}

/// Subscription registry and fan-out.
///
/// Publishing and subscribing to the same job are serialized on that job's
/// channel, so a new subscriber's snapshot is never newer than the first
/// live update it receives.
pub struct StatusBroadcaster {
    jobs: DashMap<JobId, JobChannel>,
    connections: DashMap<ConnectionId, Arc<Outbox>>,
    subscriptions: DashMap<ConnectionId, HashSet<JobId>>,
    config: BroadcastConfig,
    published: AtomicU64,
}

impl StatusBroadcaster {
    pub fn new(config: BroadcastConfig) -> Self {
        Self {
            jobs: DashMap::new(),
            connections: DashMap::new(),
            subscriptions: DashMap::new(),
            config,
            published: AtomicU64::new(0),
        }
    }

    /// Register a connection and return its outbox.
    pub fn open_connection(&self, conn: &ConnectionId) -> Arc<Outbox> {
        let outbox = Arc::new(Outbox::new(self.config.outbound_buffer));
        self.connections.insert(conn.clone(), outbox.clone());
        self.subscriptions.entry(conn.clone()).or_default();
        debug!(conn_id = %conn, "Connection registered");
        outbox
    }

    /// Remove a connection and every subscription it held.
    pub fn close_connection(&self, conn: &ConnectionId) {
        if let Some((_, outbox)) = self.connections.remove(conn) {
            outbox.close();
        }
        let jobs = self
            .subscriptions
            .remove(conn)
            .map(|(_, jobs)| jobs)
            .unwrap_or_default();
        for job_id in &jobs {
            if let Some(mut channel) = self.jobs.get_mut(job_id) {
                channel.subscribers.remove(conn);
            }
        }
        debug!(conn_id = %conn, subscriptions = jobs.len(), "Connection removed");
    }

    /// Subscribe a connection to a job and queue the job's latest state.
    ///
    /// `fallback` is delivered when nothing has been published for the job
    /// yet. Returns false if the connection is unknown.
    pub fn subscribe(&self, conn: &ConnectionId, job_id: &JobId, fallback: StatusEvent) -> bool {
        let Some(outbox) = self.connections.get(conn).map(|o| o.value().clone()) else {
            return false;
        };

        {
            let mut channel = self.jobs.entry(job_id.clone()).or_default();
            channel.subscribers.insert(conn.clone());
            outbox.push(ServerMessage::Subscribed {
                job_id: job_id.clone(),
            });
            let snapshot = channel.last.clone().unwrap_or(fallback);
            outbox.push(ServerMessage::status_update(&snapshot));
        }

        self.subscriptions
            .entry(conn.clone())
            .or_default()
            .insert(job_id.clone());
        debug!(conn_id = %conn, job_id = %job_id, "Subscribed");
        true
    }

    /// Remove one subscription. Returns whether it existed.
    pub fn unsubscribe(&self, conn: &ConnectionId, job_id: &JobId) -> bool {
        let existed = self
            .jobs
            .get_mut(job_id)
            .map(|mut channel| channel.subscribers.remove(conn))
            .unwrap_or(false);
        if let Some(mut jobs) = self.subscriptions.get_mut(conn) {
            jobs.remove(job_id);
        }
        debug!(conn_id = %conn, job_id = %job_id, existed, "Unsubscribed");
        existed
    }

    /// Send a message to one connection.
    pub fn send_to(&self, conn: &ConnectionId, msg: ServerMessage) -> bool {
        match self.connections.get(conn) {
            Some(outbox) => outbox.push(msg),
            None => false,
        }
    }

    /// Jobs a connection is subscribed to.
    pub fn subscriptions_of(&self, conn: &ConnectionId) -> Vec<JobId> {
        self.subscriptions
            .get(conn)
            .map(|jobs| jobs.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of connections subscribed to a job.
    pub fn subscriber_count(&self, job_id: &JobId) -> usize {
        self.jobs
            .get(job_id)
            .map(|c| c.subscribers.len())
            .unwrap_or(0)
    }

    /// Latest event published for a job.
    pub fn last_event(&self, job_id: &JobId) -> Option<StatusEvent> {
        self.jobs.get(job_id).and_then(|c| c.last.clone())
    }

    /// Drop state for jobs removed from the store.
    pub fn forget(&self, job_id: &JobId) {
        self.jobs.remove(job_id);
    }

    pub fn stats(&self) -> BroadcastStats {
        let dropped = self.connections.iter().map(|o| o.dropped()).sum();
        BroadcastStats {
            connections: self.connections.len(),
            subscriptions: self.subscriptions.iter().map(|s| s.len()).sum(),
            tracked_jobs: self.jobs.len(),
            published: self.published.load(Ordering::Relaxed),
            dropped,
        }
    }
}

impl EventSink for StatusBroadcaster {
    fn publish(&self, event: StatusEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);
        let msg = ServerMessage::status_update(&event);

        let mut channel = self.jobs.entry(event.job_id.clone()).or_default();
        for conn in &channel.subscribers {
            if let Some(outbox) = self.connections.get(conn) {
                outbox.push(msg.clone());
            }
        }
        trace!(
            job_id = %event.job_id,
            status = %event.status,
            stage = %event.stage,
            seq = event.seq,
            subscribers = channel.subscribers.len(),
            "Published status event"
        );
        channel.last = Some(event);
    }
}

/// Sink that discards events.
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: StatusEvent) {}
}
