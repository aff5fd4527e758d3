//! Relay behaviour against a scripted orchestration endpoint and against
//! the real one.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as AxMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use navi_core::ids::SessionId;
use navi_core::results::{MergedResponse, ResponseKind};
use navi_core::wire::EndpointFrame;
use navi_relay::{start, BridgeConfig, RelayConfig, RelayHandle};

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

#[derive(Debug)]
enum Seen {
    Opened(String),
    Event { text: String, after_ready: bool },
    Closed,
}

#[derive(Clone)]
struct Fake {
    seen: mpsc::UnboundedSender<Seen>,
    ready_delay: Duration,
    close_after_ready: bool,
}

async fn fake_stream(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(fake): State<Fake>,
) -> impl IntoResponse {
    let sid = headers
        .get("x-session-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    ws.on_upgrade(move |socket| fake_session(socket, sid, fake))
}

/// Reads concurrently with the ready delay so early forwards are visible.
async fn fake_session(socket: WebSocket, sid: String, fake: Fake) {
    let _ = fake.seen.send(Seen::Opened(sid.clone()));
    let (mut out, mut inp) = socket.split();
    let ready = Arc::new(AtomicBool::new(false));
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<String>();

    let reader_ready = Arc::clone(&ready);
    let seen = fake.seen.clone();
    tokio::spawn(async move {
        let mut seq = 0;
        while let Some(Ok(msg)) = inp.next().await {
            match msg {
                AxMessage::Text(text) => {
                    seq += 1;
                    let _ = seen.send(Seen::Event {
                        text: text.to_string(),
                        after_ready: reader_ready.load(Ordering::SeqCst),
                    });
                    let response = MergedResponse::empty(
                        ResponseKind::NavigationUpdate,
                        SessionId::from_raw("nav_fake"),
                        seq,
                    );
                    let _ = reply_tx.send(EndpointFrame::Response(response).to_json());
                }
                AxMessage::Close(_) => break,
                _ => {}
            }
        }
        let _ = seen.send(Seen::Closed);
    });

    tokio::time::sleep(fake.ready_delay).await;
    ready.store(true, Ordering::SeqCst);
    let frame = EndpointFrame::SessionReady {
        session_id: SessionId::from_raw(sid),
        degraded_roles: vec![],
    };
    if out.send(AxMessage::Text(frame.to_json().into())).await.is_err() {
        return;
    }
    if fake.close_after_ready {
        let _ = out.send(AxMessage::Close(None)).await;
        return;
    }
    while let Some(text) = reply_rx.recv().await {
        if out.send(AxMessage::Text(text.into())).await.is_err() {
            break;
        }
    }
}

async fn fake_endpoint(
    ready_delay: Duration,
    close_after_ready: bool,
) -> (SocketAddr, mpsc::UnboundedReceiver<Seen>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let fake = Fake {
        seen: tx,
        ready_delay,
        close_after_ready,
    };
    let app = Router::new()
        .route("/agent/stream", get(fake_stream))
        .with_state(fake);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, rx)
}

fn relay_config(upstream: SocketAddr) -> RelayConfig {
    RelayConfig {
        host: "127.0.0.1".into(),
        port: 0,
        bridge: BridgeConfig {
            upstream_url: format!("ws://{upstream}/agent/stream"),
            max_pending: 16,
            connect_timeout: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(30),
        },
    }
}

async fn connect_client(relay: &RelayHandle) -> WsStream {
    let url = format!("ws://{}/", relay.addr());
    let (ws, _) = timeout(TIMEOUT, connect_async(url)).await.unwrap().unwrap();
    ws
}

/// Next JSON frame, or `None` once the relay closes the socket.
async fn next_json(ws: &mut WsStream) -> Option<Value> {
    loop {
        let msg = timeout(TIMEOUT, ws.next()).await.expect("timed out waiting for a frame");
        match msg {
            Some(Ok(Message::Text(text))) => return Some(serde_json::from_str(text.as_str()).unwrap()),
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(other)) => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn next_seen(rx: &mut mpsc::UnboundedReceiver<Seen>) -> Seen {
    timeout(TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for the endpoint")
        .expect("endpoint channel closed")
}

async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

#[tokio::test]
async fn events_sent_before_ready_are_flushed_in_order() {
    let (upstream, mut seen) = fake_endpoint(Duration::from_millis(300), false).await;
    let relay = start(relay_config(upstream)).await.unwrap();
    let mut client = connect_client(&relay).await;

    for data in ["f1", "f2", "f3"] {
        send_json(&mut client, json!({"type": "video_frame", "data": data})).await;
    }

    let ready = next_json(&mut client).await.unwrap();
    assert_eq!(ready["type"], "session_ready");
    for seq in 1..=3 {
        let frame = next_json(&mut client).await.unwrap();
        assert_eq!(frame["type"], "navigation_update");
        assert_eq!(frame["frame_seq"], seq);
    }

    match next_seen(&mut seen).await {
        Seen::Opened(sid) => assert!(sid.starts_with("nav_"), "unexpected session id {sid}"),
        other => panic!("expected open, got {other:?}"),
    }
    for expected in ["f1", "f2", "f3"] {
        match next_seen(&mut seen).await {
            Seen::Event { text, after_ready } => {
                let v: Value = serde_json::from_str(&text).unwrap();
                assert_eq!(v["data"], expected);
                assert!(after_ready, "{expected} forwarded before the endpoint was ready");
            }
            other => panic!("expected event, got {other:?}"),
        }
    }

    relay.shutdown().await;
}

#[tokio::test]
async fn malformed_payloads_are_answered_not_forwarded() {
    let (upstream, mut seen) = fake_endpoint(Duration::ZERO, false).await;
    let relay = start(relay_config(upstream)).await.unwrap();
    let mut client = connect_client(&relay).await;
    assert_eq!(next_json(&mut client).await.unwrap()["type"], "session_ready");
    assert!(matches!(next_seen(&mut seen).await, Seen::Opened(_)));

    client.send(Message::Text("{bad".into())).await.unwrap();
    let err = next_json(&mut client).await.unwrap();
    assert_eq!(err["type"], "error");
    assert_eq!(err["code"], "MALFORMED_PAYLOAD");

    send_json(&mut client, json!({"type": "compass", "heading": 90})).await;
    assert_eq!(next_json(&mut client).await.unwrap()["code"], "UNKNOWN_EVENT");

    send_json(&mut client, json!({"type": "text_query", "destination": "exit"})).await;
    assert_eq!(next_json(&mut client).await.unwrap()["type"], "navigation_update");

    match next_seen(&mut seen).await {
        Seen::Event { text, .. } => {
            let v: Value = serde_json::from_str(&text).unwrap();
            assert_eq!(v["type"], "text_query");
            assert_eq!(v["text"], "exit");
        }
        other => panic!("expected the query only, got {other:?}"),
    }
    assert!(seen.try_recv().is_err());

    relay.shutdown().await;
}

#[tokio::test]
async fn binary_audio_is_forwarded_as_audio_chunk() {
    let (upstream, mut seen) = fake_endpoint(Duration::ZERO, false).await;
    let relay = start(relay_config(upstream)).await.unwrap();
    let mut client = connect_client(&relay).await;
    assert_eq!(next_json(&mut client).await.unwrap()["type"], "session_ready");
    assert!(matches!(next_seen(&mut seen).await, Seen::Opened(_)));

    client.send(Message::Binary(vec![0u8, 1, 2].into())).await.unwrap();
    match next_seen(&mut seen).await {
        Seen::Event { text, .. } => {
            let v: Value = serde_json::from_str(&text).unwrap();
            assert_eq!(v["type"], "audio_chunk");
            assert_eq!(v["data"], "AAEC");
            assert!(v["timestamp"].as_f64().unwrap() > 0.0);
        }
        other => panic!("expected audio chunk, got {other:?}"),
    }

    relay.shutdown().await;
}

#[tokio::test]
async fn client_disconnect_closes_upstream() {
    let (upstream, mut seen) = fake_endpoint(Duration::ZERO, false).await;
    let relay = start(relay_config(upstream)).await.unwrap();
    let mut client = connect_client(&relay).await;
    assert_eq!(next_json(&mut client).await.unwrap()["type"], "session_ready");
    assert!(matches!(next_seen(&mut seen).await, Seen::Opened(_)));

    client.close(None).await.unwrap();
    drop(client);

    assert!(matches!(next_seen(&mut seen).await, Seen::Closed));
    relay.shutdown().await;
}

#[tokio::test]
async fn upstream_close_closes_client() {
    let (upstream, _seen) = fake_endpoint(Duration::ZERO, true).await;
    let relay = start(relay_config(upstream)).await.unwrap();
    let mut client = connect_client(&relay).await;

    assert_eq!(next_json(&mut client).await.unwrap()["type"], "session_ready");
    let err = next_json(&mut client).await.unwrap();
    assert_eq!(err["type"], "error");
    assert_eq!(err["code"], "UPSTREAM_UNAVAILABLE");
    assert!(next_json(&mut client).await.is_none());

    relay.shutdown().await;
}

#[tokio::test]
async fn unreachable_upstream_reports_error_and_closes() {
    let dead = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = dead.local_addr().unwrap();
    drop(dead);

    let relay = start(relay_config(addr)).await.unwrap();
    let mut client = connect_client(&relay).await;
    let err = next_json(&mut client).await.unwrap();
    assert_eq!(err["type"], "error");
    assert_eq!(err["code"], "UPSTREAM_UNAVAILABLE");
    assert!(next_json(&mut client).await.is_none());

    relay.shutdown().await;
}

#[tokio::test]
async fn health_needs_no_session() {
    let (upstream, _seen) = fake_endpoint(Duration::ZERO, false).await;
    let relay = start(relay_config(upstream)).await.unwrap();

    let body: Value = reqwest::get(format!("http://{}/health", relay.addr()))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connections"], 0);

    relay.shutdown().await;
}

#[tokio::test]
async fn relays_through_the_orchestration_endpoint() {
    use navi_core::reasoning::ReasoningBackend;
    use navi_core::roles::AgentRole;
    use navi_engine::{EngineConfig, NavigationOrchestrator, Orchestrator};
    use navi_llm::{MockBackend, MockReply};
    use navi_store::{Database, SqliteStore};

    let mock = Arc::new(MockBackend::new());
    mock.script(
        AgentRole::Scene,
        [MockReply::json(json!({
            "obstacles": [],
            "clear_path": {"direction": "forward-left", "distance_feet": 8},
            "confidence": 0.9,
            "summary": "Lobby"
        }))],
    );
    mock.script(
        AgentRole::Hazard,
        [MockReply::json(json!({"imminent_hazards": [], "safe_status": true}))],
    );
    let orchestrator: Arc<dyn NavigationOrchestrator> = Arc::new(Orchestrator::new(
        Arc::clone(&mock) as Arc<dyn ReasoningBackend>,
        Arc::new(SqliteStore::new(Database::in_memory().unwrap())),
        EngineConfig::default(),
    ));
    let endpoint = navi_server::start(
        navi_server::ServerConfig {
            port: 0,
            ..Default::default()
        },
        orchestrator,
    )
    .await
    .unwrap();

    let relay = start(relay_config(endpoint.addr())).await.unwrap();
    let mut client = connect_client(&relay).await;
    send_json(&mut client, json!({"type": "video_frame", "data": "AAAA", "timestamp": 5.0})).await;

    let ready = next_json(&mut client).await.unwrap();
    assert_eq!(ready["type"], "session_ready");
    let update = next_json(&mut client).await.unwrap();
    assert_eq!(update["type"], "navigation_update");
    assert_eq!(update["direction"], "forward-left");
    assert_eq!(update["roles"]["audio"]["pan"], -0.35);

    relay.shutdown().await;
    endpoint.shutdown().await;
}
