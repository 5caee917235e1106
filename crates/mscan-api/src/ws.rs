//! WebSocket endpoint for the streaming status protocol.
//!
//! Each connection runs two tasks. The send task owns the socket sink and
//! drains the connection's outbox plus a small control channel for pings.
//! The receive loop handles inbound frames and the heartbeat, so a peer that
//! stops reading is still timed out while its sends are stuck.

use std::fmt::Display;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use mscan_models::{ConnectionId, ServerMessage};
use mscan_queue::Outbox;

use crate::gateway::{Gateway, HeartbeatAction};
use crate::metrics;
use crate::state::AppState;

/// Control frames waiting behind a slow send.
const CONTROL_BUFFER_SIZE: usize = 8;

/// How long a closing connection may spend flushing its outbox.
const SEND_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Global counter for active WebSocket connections.
static ACTIVE_WS_CONNECTIONS: AtomicI64 = AtomicI64::new(0);

/// `GET /ws`
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let count = ACTIVE_WS_CONNECTIONS.fetch_add(1, Ordering::SeqCst) + 1;
    metrics::record_ws_connection();
    metrics::set_ws_active_connections(count);

    let (sender, receiver) = socket.split();
    run_connection(state.gateway.clone(), sender, receiver).await;

    let count = ACTIVE_WS_CONNECTIONS.fetch_sub(1, Ordering::SeqCst) - 1;
    metrics::set_ws_active_connections(count);
}

/// Serve one connection until the peer leaves or stops answering pings.
/// Subscriptions are released before this returns.
pub(crate) async fn run_connection<S, R, E>(gateway: Arc<Gateway>, sink: S, mut stream: R)
where
    S: Sink<Message> + Send + Unpin + 'static,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let session = gateway.open();
    let mut heartbeat = gateway.heartbeat();
    let period = gateway.config().heartbeat_interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let (control_tx, control_rx) = mpsc::channel(CONTROL_BUFFER_SIZE);
    let mut send_task = tokio::spawn(send_loop(
        sink,
        session.outbox.clone(),
        control_rx,
        session.conn.clone(),
    ));
    let mut send_finished = false;

    loop {
        tokio::select! {
            _ = &mut send_task => {
                send_finished = true;
                break;
            }
            _ = ticker.tick() => {
                match heartbeat.on_tick() {
                    HeartbeatAction::Ping => {
                        // A full control channel means the peer is not reading;
                        // the missed pong count takes care of it.
                        let _ = control_tx.try_send(Message::Ping(Vec::new()));
                    }
                    HeartbeatAction::Disconnect => {
                        warn!(
                            conn_id = %session.conn,
                            missed = heartbeat.missed(),
                            "Heartbeat timed out, dropping connection"
                        );
                        metrics::record_ws_heartbeat_timeout();
                        break;
                    }
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        heartbeat.on_activity();
                        metrics::record_ws_message_received();
                        gateway.handle_text(&session, &text);
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Ping(_))) => {
                        heartbeat.on_activity();
                    }
                    Some(Ok(Message::Binary(_))) => {
                        heartbeat.on_activity();
                        session
                            .outbox
                            .push(ServerMessage::error(None, "binary frames are not supported"));
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(conn_id = %session.conn, "Client closed connection");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(conn_id = %session.conn, error = %e, "WebSocket receive error");
                        break;
                    }
                }
            }
        }
    }

    gateway.close(&session);
    drop(control_tx);

    if !send_finished && tokio::time::timeout(SEND_DRAIN_TIMEOUT, &mut send_task).await.is_err() {
        debug!(conn_id = %session.conn, "Send task still blocked, aborting");
        send_task.abort();
    }
}

/// Write control frames and outbox messages to the peer until the outbox
/// closes or a send fails.
async fn send_loop<S>(
    mut sink: S,
    outbox: Arc<Outbox>,
    mut control: mpsc::Receiver<Message>,
    conn: ConnectionId,
) where
    S: Sink<Message> + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            Some(frame) = control.recv() => frame,
            outgoing = outbox.recv() => match outgoing {
                Some(msg) => {
                    metrics::record_ws_message_sent(message_type(&msg));
                    Message::Text(msg.to_json())
                }
                None => break,
            },
        };
        if sink.send(frame).await.is_err() {
            debug!(conn_id = %conn, "Send failed, client gone");
            break;
        }
    }
    let _ = sink.close().await;
}

fn message_type(msg: &ServerMessage) -> &'static str {
    match msg {
        ServerMessage::StatusUpdate { .. } => "status_update",
        ServerMessage::Error { .. } => "error",
        ServerMessage::Pong => "pong",
        ServerMessage::Subscribed { .. } => "subscribed",
        ServerMessage::Unsubscribed { .. } => "unsubscribed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::task::{Context, Poll};

    use futures_util::stream;
    use mscan_models::{ContentHash, Job, JobId};
    use mscan_queue::{BroadcastConfig, JobStore, StatusBroadcaster};

    use crate::gateway::GatewayConfig;

    /// Sink of a peer whose receive window is full.
    struct StalledSink;

    impl Sink<Message> for StalledSink {
        type Error = axum::Error;

        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _: Message) -> Result<(), Self::Error> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }
    }

    /// Sink that keeps every frame written to it.
    #[derive(Clone, Default)]
    struct RecordingSink(Arc<Mutex<Vec<Message>>>);

    impl Sink<Message> for RecordingSink {
        type Error = axum::Error;

        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
            self.0.lock().unwrap().push(item);
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    fn setup() -> (Arc<Gateway>, Arc<JobStore>, Arc<StatusBroadcaster>, JobId) {
        let broadcaster = Arc::new(StatusBroadcaster::new(BroadcastConfig::default()));
        let store = Arc::new(JobStore::new(broadcaster.clone()));
        let config = GatewayConfig {
            heartbeat_interval: Duration::from_millis(100),
            max_missed_pongs: 2,
        };
        let gateway = Arc::new(Gateway::new(store.clone(), broadcaster.clone(), config));
        let job = store.insert(Job::new(
            "s3://media/a.mp4",
            ContentHash::of_bytes(b"a"),
            "caller",
            3,
        ));
        (gateway, store, broadcaster, job.id)
    }

    fn subscribe_frame(job_id: &JobId) -> Result<Message, axum::Error> {
        Ok(Message::Text(format!(
            r#"{{"type":"subscribe","job_id":"{}"}}"#,
            job_id
        )))
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_peer_is_dropped_by_heartbeat() {
        let (gateway, store, broadcaster, job_id) = setup();
        let frames = stream::iter(vec![subscribe_frame(&job_id)]).chain(stream::pending());

        let conn = tokio::spawn(run_connection(gateway, StalledSink, frames));
        for _ in 0..10 {
            if broadcaster.subscriber_count(&job_id) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(broadcaster.subscriber_count(&job_id), 1);

        // Updates pile up behind the stuck send.
        store.update(&job_id, |j| j.claim()).unwrap();
        for _ in 0..50 {
            store
                .update(&job_id, |j| j.enter_stage(mscan_models::Stage::Preprocessing))
                .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), conn)
            .await
            .expect("connection dropped after missed pongs")
            .unwrap();
        assert_eq!(broadcaster.subscriber_count(&job_id), 0);
    }

    #[tokio::test]
    async fn test_replies_are_flushed_before_close() {
        let (gateway, _store, broadcaster, job_id) = setup();
        let sink = RecordingSink::default();
        let frames = stream::iter(vec![
            subscribe_frame(&job_id),
            Ok(Message::Text(r#"{"type":"ping"}"#.to_string())),
            Ok(Message::Close(None)),
        ]);

        run_connection(gateway, sink.clone(), frames).await;

        let sent: Vec<ServerMessage> = sink
            .0
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| match m {
                Message::Text(text) => serde_json::from_str(text).ok(),
                _ => None,
            })
            .collect();
        assert_eq!(sent.len(), 3);
        assert_eq!(
            sent[0],
            ServerMessage::Subscribed {
                job_id: job_id.clone()
            }
        );
        assert!(matches!(sent[1], ServerMessage::StatusUpdate { .. }));
        assert_eq!(sent[2], ServerMessage::Pong);
        assert_eq!(broadcaster.subscriber_count(&job_id), 0);
    }
}
