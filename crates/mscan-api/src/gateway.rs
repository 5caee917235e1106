//! Transport-independent side of the streaming protocol.
//!
//! The WebSocket handler feeds text frames in and drains the connection's
//! outbox; everything about subscriptions, replies and liveness lives here.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use mscan_models::{ClientMessage, ConnectionId, JobId, ServerMessage, StatusEvent};
use mscan_queue::{JobStore, Outbox, StatusBroadcaster};

/// Heartbeat settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub heartbeat_interval: Duration,
    /// Consecutive unanswered pings before a connection is considered dead.
    pub max_missed_pongs: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            max_missed_pongs: 2,
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            heartbeat_interval: std::env::var("HEARTBEAT_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_interval),
            max_missed_pongs: std::env::var("MAX_MISSED_PONGS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_missed_pongs),
        }
    }
}

/// What to do on a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    Ping,
    Disconnect,
}

/// Counts pings that went unanswered.
#[derive(Debug)]
pub struct Heartbeat {
    missed: u32,
    max_missed: u32,
}

impl Heartbeat {
    pub fn new(max_missed: u32) -> Self {
        Self {
            missed: 0,
            max_missed: max_missed.max(1),
        }
    }

    pub fn on_tick(&mut self) -> HeartbeatAction {
        if self.missed >= self.max_missed {
            HeartbeatAction::Disconnect
        } else {
            self.missed += 1;
            HeartbeatAction::Ping
        }
    }

    /// Any frame from the peer proves it is alive.
    pub fn on_activity(&mut self) {
        self.missed = 0;
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }
}

/// One open client connection.
pub struct Session {
    pub conn: ConnectionId,
    pub outbox: Arc<Outbox>,
}

/// Subscription handling for streaming clients.
pub struct Gateway {
    store: Arc<JobStore>,
    broadcaster: Arc<StatusBroadcaster>,
    config: GatewayConfig,
}

impl Gateway {
    pub fn new(
        store: Arc<JobStore>,
        broadcaster: Arc<StatusBroadcaster>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            store,
            broadcaster,
            config,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn heartbeat(&self) -> Heartbeat {
        Heartbeat::new(self.config.max_missed_pongs)
    }

    pub fn open(&self) -> Session {
        let conn = ConnectionId::new();
        let outbox = self.broadcaster.open_connection(&conn);
        info!(conn_id = %conn, "Client connected");
        Session { conn, outbox }
    }

    /// Drop the connection and all of its subscriptions.
    pub fn close(&self, session: &Session) {
        self.broadcaster.close_connection(&session.conn);
        info!(conn_id = %session.conn, "Client disconnected");
    }

    /// Handle one text frame. Replies are queued on the session's outbox.
    pub fn handle_text(&self, session: &Session, text: &str) {
        match ClientMessage::parse(text) {
            Ok(msg) => self.handle(session, msg),
            Err(message) => {
                debug!(conn_id = %session.conn, error = %message, "Rejected client message");
                session.outbox.push(ServerMessage::error(None, message));
            }
        }
    }

    pub fn handle(&self, session: &Session, msg: ClientMessage) {
        match msg {
            ClientMessage::Subscribe { job_id } => self.subscribe(session, job_id),
            ClientMessage::Unsubscribe { job_id } => {
                if self.broadcaster.unsubscribe(&session.conn, &job_id) {
                    session
                        .outbox
                        .push(ServerMessage::Unsubscribed { job_id });
                } else {
                    session.outbox.push(ServerMessage::error(
                        Some(job_id),
                        "not subscribed to this job",
                    ));
                }
            }
            ClientMessage::Ping => {
                session.outbox.push(ServerMessage::Pong);
            }
        }
    }

    fn subscribe(&self, session: &Session, job_id: JobId) {
        let Some(job) = self.store.get(&job_id) else {
            session
                .outbox
                .push(ServerMessage::error(Some(job_id), "job not found"));
            return;
        };
        self.broadcaster
            .subscribe(&session.conn, &job_id, StatusEvent::from_job(&job));
    }
}
