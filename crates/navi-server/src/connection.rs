use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use navi_core::events::{DecodeError, InboundEvent};
use navi_core::ids::SessionId;
use navi_core::wire::{EndpointFrame, ErrorCode};
use navi_engine::{NavigationOrchestrator, Session};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Missed heartbeats tolerated before a connection is treated as dead.
const MISSED_PONGS: u64 = 3;

/// One relay connection bound to a navigation session.
pub struct Connection {
    tx: mpsc::Sender<String>,
    last_pong: AtomicU64,
    closed: CancellationToken,
}

impl Connection {
    fn new(tx: mpsc::Sender<String>) -> Self {
        Self {
            tx,
            last_pong: AtomicU64::new(now_millis()),
            closed: CancellationToken::new(),
        }
    }

    /// Ask the writer to send a close frame and stop.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_millis(), Ordering::Relaxed);
    }

    pub fn is_alive(&self, heartbeat: Duration) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        let limit = heartbeat.as_millis() as u64 * MISSED_PONGS;
        now_millis().saturating_sub(last) < limit
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Live relay connections, keyed by the session each one owns.
pub struct ConnectionRegistry {
    connections: DashMap<SessionId, Arc<Connection>>,
    max_send_queue: usize,
}

impl ConnectionRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            connections: DashMap::new(),
            max_send_queue,
        }
    }

    /// Register a connection for a session and return its outbound queue.
    pub fn register(&self, session_id: SessionId) -> (Arc<Connection>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.max_send_queue.max(1));
        let conn = Arc::new(Connection::new(tx));
        self.connections.insert(session_id, Arc::clone(&conn));
        (conn, rx)
    }

    /// Drop a session's connection, only if it is still `conn`.
    pub fn unregister(&self, session_id: &SessionId, conn: &Arc<Connection>) {
        self.connections
            .remove_if(session_id, |_, current| Arc::ptr_eq(current, conn));
    }

    /// Queue a frame without waiting. Drops it if the queue is full.
    pub fn send_to(&self, session_id: &SessionId, message: String) -> bool {
        let Some(conn) = self.connections.get(session_id).map(|c| Arc::clone(c.value())) else {
            return false;
        };
        match conn.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                tracing::warn!(
                    session_id = %session_id,
                    msg_len = msg.len(),
                    "send queue full, dropping frame"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Close every connection's socket and forget them.
    pub fn close_all(&self) {
        for entry in self.connections.iter() {
            entry.value().close();
        }
        self.connections.clear();
    }
}

/// Drive one relay connection until either side goes away, then close the
/// session.
pub async fn handle_connection(
    socket: WebSocket,
    session_id: SessionId,
    orchestrator: Arc<dyn NavigationOrchestrator>,
    registry: Arc<ConnectionRegistry>,
    heartbeat: Duration,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let session = match orchestrator.open(session_id.clone()).await {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!(session_id = %session_id, error = %e, "session open rejected");
            let frame = EndpointFrame::error(e.code(), e.to_string());
            let _ = ws_tx.send(WsMessage::Text(frame.to_json().into())).await;
            let _ = ws_tx
                .send(WsMessage::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: "session unavailable".into(),
                })))
                .await;
            return;
        }
    };

    let (conn, mut rx) = registry.register(session_id.clone());
    let degraded_roles = session.degraded_roles();
    tracing::info!(
        session_id = %session_id,
        degraded = degraded_roles.len(),
        "relay connected"
    );
    let ready = EndpointFrame::SessionReady {
        session_id: session_id.clone(),
        degraded_roles,
    };
    let _ = conn.tx.try_send(ready.to_json());

    let writer_conn = Arc::clone(&conn);
    let writer_sid = session_id.clone();
    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                _ = writer_conn.closed.cancelled() => break,
                msg = rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                return;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if !writer_conn.is_alive(heartbeat) {
                        tracing::warn!(session_id = %writer_sid, "relay stopped answering pings");
                        break;
                    }
                    if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        return;
                    }
                }
            }
        }
        let _ = ws_tx
            .send(WsMessage::Close(Some(CloseFrame {
                code: close_code::NORMAL,
                reason: "".into(),
            })))
            .await;
    });

    // Replies to text frames leave in the order the frames arrived.
    let (replies_tx, mut replies_rx) = mpsc::channel::<oneshot::Receiver<String>>(registry.max_send_queue.max(1));
    let responder_tx = conn.tx.clone();
    let responder = tokio::spawn(async move {
        while let Some(reply) = replies_rx.recv().await {
            if let Ok(text) = reply.await {
                if responder_tx.send(text).await.is_err() {
                    break;
                }
            }
        }
    });

    let reader_conn = Arc::clone(&conn);
    let reader_sid = session_id.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    let reply = handle_text(&session, &reader_sid, text.as_str());
                    if replies_tx.send(reply).await.is_err() {
                        break;
                    }
                }
                WsMessage::Binary(_) => {
                    let frame = EndpointFrame::error(
                        ErrorCode::MalformedPayload,
                        "binary frames must be base64-encoded into an audio_chunk event",
                    );
                    let _ = reader_conn.tx.send(frame.to_json()).await;
                }
                WsMessage::Pong(_) => reader_conn.record_pong(),
                WsMessage::Close(_) => break,
                WsMessage::Ping(_) => {}
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => {
            conn.close();
            let _ = writer.await;
        }
    }

    responder.abort();
    registry.unregister(&session_id, &conn);
    orchestrator.close(&session_id).await;
    tracing::info!(session_id = %session_id, "relay disconnected");
}

/// Decode one client payload and admit it to the session. The returned
/// receiver yields the reply frame; valid events are routed on their own
/// task so a newer frame can supersede one still waiting.
fn handle_text(session: &Arc<Session>, session_id: &SessionId, raw: &str) -> oneshot::Receiver<String> {
    let (reply_tx, reply_rx) = oneshot::channel();
    let event = match InboundEvent::decode(raw) {
        Ok(event) => event,
        Err(e) => {
            let code = match &e {
                DecodeError::UnknownType(_) => ErrorCode::UnknownEvent,
                _ => ErrorCode::MalformedPayload,
            };
            tracing::debug!(session_id = %session_id, error = %e, "rejected client payload");
            let _ = reply_tx.send(EndpointFrame::error(code, e.to_string()).to_json());
            return reply_rx;
        }
    };

    let admission = match session.admit(event) {
        Ok(admission) => admission,
        Err(e) => {
            let _ = reply_tx.send(EndpointFrame::error(e.code(), e.to_string()).to_json());
            return reply_rx;
        }
    };
    tokio::spawn(async move {
        let frame = match admission.run().await {
            Ok(response) => EndpointFrame::Response(response),
            Err(e) => EndpointFrame::error(e.code(), e.to_string()),
        };
        let _ = reply_tx.send(frame.to_json());
    });
    reply_rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_unregister() {
        let registry = ConnectionRegistry::new(8);
        let a = SessionId::from_raw("nav_a");
        let b = SessionId::from_raw("nav_b");
        let (conn_a, _rx_a) = registry.register(a.clone());
        let (_conn_b, _rx_b) = registry.register(b.clone());
        assert_eq!(registry.count(), 2);

        registry.unregister(&a, &conn_a);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn stale_unregister_keeps_replacement() {
        let registry = ConnectionRegistry::new(8);
        let sid = SessionId::from_raw("nav_re");
        let (old, _rx_old) = registry.register(sid.clone());
        let (_new, _rx_new) = registry.register(sid.clone());

        registry.unregister(&sid, &old);
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn send_to_reaches_the_session_queue() {
        let registry = ConnectionRegistry::new(8);
        let sid = SessionId::from_raw("nav_send");
        let (_conn, mut rx) = registry.register(sid.clone());

        assert!(registry.send_to(&sid, "hello".into()));
        assert_eq!(rx.recv().await.as_deref(), Some("hello"));
        assert!(!registry.send_to(&SessionId::from_raw("nav_other"), "x".into()));
    }

    #[test]
    fn full_queue_drops() {
        let registry = ConnectionRegistry::new(2);
        let sid = SessionId::from_raw("nav_full");
        let (_conn, _rx) = registry.register(sid.clone());

        assert!(registry.send_to(&sid, "1".into()));
        assert!(registry.send_to(&sid, "2".into()));
        assert!(!registry.send_to(&sid, "3".into()));
    }

    #[test]
    fn close_all_signals_every_writer() {
        let registry = ConnectionRegistry::new(4);
        let (a, _rx_a) = registry.register(SessionId::from_raw("nav_close_a"));
        let (b, _rx_b) = registry.register(SessionId::from_raw("nav_close_b"));
        registry.close_all();
        assert_eq!(registry.count(), 0);
        assert!(a.closed.is_cancelled());
        assert!(b.closed.is_cancelled());
    }

    #[test]
    fn pong_tracking() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = Connection::new(tx);
        assert!(conn.is_alive(Duration::from_secs(30)));

        conn.last_pong.store(0, Ordering::Relaxed);
        assert!(!conn.is_alive(Duration::from_secs(30)));

        conn.record_pong();
        assert!(conn.is_alive(Duration::from_secs(30)));
    }
}
