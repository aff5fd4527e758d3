use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message as ClientMessage, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use navi_core::ids::SessionId;
use navi_core::wire::SESSION_HEADER;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::RelayError;
use crate::frames::{self, ClientFrame};
use crate::queue::PendingQueue;

type Upstream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ClientSink = SplitSink<WebSocket, ClientMessage>;
type UpstreamSink = SplitSink<Upstream, UpstreamMessage>;

/// Per-connection relay bounds.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub upstream_url: String,
    pub max_pending: usize,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
}

/// Why a relayed connection ended.
#[derive(Debug)]
enum End {
    ClientGone,
    Upstream(RelayError),
}

/// Open the orchestration endpoint connection for one session.
pub async fn connect_upstream(
    url: &str,
    session_id: &SessionId,
    timeout: Duration,
) -> Result<Upstream, RelayError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| RelayError::UpstreamConnect(e.to_string()))?;
    let value = HeaderValue::from_str(session_id.as_str())
        .map_err(|e| RelayError::UpstreamConnect(e.to_string()))?;
    request.headers_mut().insert(SESSION_HEADER, value);

    match tokio::time::timeout(timeout, connect_async(request)).await {
        Ok(Ok((ws, _))) => Ok(ws),
        Ok(Err(e)) => Err(RelayError::UpstreamConnect(e.to_string())),
        Err(_) => Err(RelayError::UpstreamConnect(format!(
            "timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}

/// Relay one client connection to its own orchestration session until
/// either side goes away.
pub async fn run(client: WebSocket, config: &BridgeConfig) {
    let session_id = SessionId::new();
    tracing::info!(session_id = %session_id, "client connected");

    let (mut client_tx, mut client_rx) = client.split();
    let mut pending = PendingQueue::new(config.max_pending);
    let mut ready = false;

    let connect = connect_upstream(&config.upstream_url, &session_id, config.connect_timeout);
    tokio::pin!(connect);
    let mut connecting = true;
    let mut upstream_tx: Option<UpstreamSink> = None;
    let mut upstream_rx: Option<SplitStream<Upstream>> = None;

    let mut ping = tokio::time::interval(config.heartbeat_interval);
    ping.tick().await;

    let end = loop {
        tokio::select! {
            connected = &mut connect, if connecting => {
                connecting = false;
                match connected {
                    Ok(ws) => {
                        let (tx, rx) = ws.split();
                        upstream_tx = Some(tx);
                        upstream_rx = Some(rx);
                        tracing::debug!(session_id = %session_id, "upstream connected");
                    }
                    Err(e) => break End::Upstream(e),
                }
            }
            msg = client_rx.next() => {
                let outbound = match msg {
                    Some(Ok(ClientMessage::Text(text))) => frames::client_text(text.as_str()),
                    Some(Ok(ClientMessage::Binary(bytes))) => {
                        Ok(frames::client_audio(&bytes, frames::now_secs()))
                    }
                    Some(Ok(ClientMessage::Close(_))) | None => break End::ClientGone,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::debug!(session_id = %session_id, error = %e, "client read failed");
                        break End::ClientGone;
                    }
                };
                let outbound = match outbound {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::debug!(session_id = %session_id, error = %e, "rejected client payload");
                        if !send_client(&mut client_tx, ClientFrame::error(&e).text).await {
                            break End::ClientGone;
                        }
                        continue;
                    }
                };
                match upstream_tx.as_mut() {
                    Some(tx) if ready => {
                        if let Err(e) = tx.send(UpstreamMessage::Text(outbound.into())).await {
                            break End::Upstream(RelayError::UpstreamClosed(e.to_string()));
                        }
                    }
                    _ => {
                        if let Err(e) = pending.push(outbound) {
                            tracing::warn!(session_id = %session_id, error = %e, "dropping client message");
                            if !send_client(&mut client_tx, ClientFrame::error(&e).text).await {
                                break End::ClientGone;
                            }
                        }
                    }
                }
            }
            msg = next_upstream(&mut upstream_rx) => {
                match msg {
                    Some(Ok(UpstreamMessage::Text(text))) => {
                        let frame = frames::tag_for_client(text.as_str());
                        let becomes_ready = frame.is_ready() && !ready;
                        if !send_client(&mut client_tx, frame.text).await {
                            break End::ClientGone;
                        }
                        if becomes_ready {
                            ready = true;
                            if let Some(tx) = upstream_tx.as_mut() {
                                match flush(&mut pending, tx).await {
                                    Ok(0) => {}
                                    Ok(n) => tracing::debug!(session_id = %session_id, flushed = n, "pending messages forwarded"),
                                    Err(e) => break End::Upstream(e),
                                }
                            }
                        }
                    }
                    Some(Ok(UpstreamMessage::Close(frame))) => {
                        let reason = frame.map(|f| f.reason.as_str().to_string()).unwrap_or_default();
                        break End::Upstream(RelayError::UpstreamClosed(reason));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break End::Upstream(RelayError::UpstreamClosed(e.to_string())),
                    None => break End::Upstream(RelayError::UpstreamClosed("stream ended".into())),
                }
            }
            _ = ping.tick() => {
                if client_tx.send(ClientMessage::Ping(Vec::new().into())).await.is_err() {
                    break End::ClientGone;
                }
            }
        }
    };

    match end {
        End::ClientGone => {
            if let Some(mut tx) = upstream_tx {
                let _ = tx.send(UpstreamMessage::Close(None)).await;
                let _ = tx.close().await;
            }
            tracing::info!(session_id = %session_id, "client disconnected");
        }
        End::Upstream(e) => {
            tracing::warn!(session_id = %session_id, error = %e, "upstream lost, closing client");
            let _ = send_client(&mut client_tx, ClientFrame::error(&e).text).await;
            let _ = client_tx
                .send(ClientMessage::Close(Some(CloseFrame {
                    code: close_code::AGAIN,
                    reason: "orchestration endpoint unavailable".into(),
                })))
                .await;
        }
    }
}

async fn send_client(tx: &mut ClientSink, text: String) -> bool {
    tx.send(ClientMessage::Text(text.into())).await.is_ok()
}

async fn next_upstream(
    rx: &mut Option<SplitStream<Upstream>>,
) -> Option<Result<UpstreamMessage, tokio_tungstenite::tungstenite::Error>> {
    match rx.as_mut() {
        Some(rx) => rx.next().await,
        None => std::future::pending().await,
    }
}

/// Forward held messages in arrival order.
async fn flush(pending: &mut PendingQueue, tx: &mut UpstreamSink) -> Result<usize, RelayError> {
    let mut sent = 0;
    for message in pending.drain().collect::<Vec<_>>() {
        tx.send(UpstreamMessage::Text(message.into()))
            .await
            .map_err(|e| RelayError::UpstreamClosed(e.to_string()))?;
        sent += 1;
    }
    Ok(sent)
}
