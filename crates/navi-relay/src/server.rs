use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use navi_settings::types::RelaySettings;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::bridge::{self, BridgeConfig};

/// Client-facing relay configuration.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub bridge: BridgeConfig,
}

impl From<&RelaySettings> for RelayConfig {
    fn from(s: &RelaySettings) -> Self {
        Self {
            host: s.host.clone(),
            port: s.port,
            bridge: BridgeConfig {
                upstream_url: s.upstream_url.clone(),
                max_pending: s.max_pending,
                connect_timeout: Duration::from_millis(s.connect_timeout_ms),
                heartbeat_interval: Duration::from_millis(s.heartbeat_interval_ms.max(1)),
            },
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::from(&RelaySettings::default())
    }
}

#[derive(Clone)]
pub struct RelayState {
    pub bridge: Arc<BridgeConfig>,
    pub connections: Arc<AtomicUsize>,
}

/// Decrements the live connection count when a relayed socket ends.
struct ConnectionGuard(Arc<AtomicUsize>);

impl ConnectionGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn build_router(state: RelayState) -> Router {
    Router::new()
        .route("/", get(client_handler))
        .route("/ws", get(client_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn start(config: RelayConfig) -> Result<RelayHandle, std::io::Error> {
    let connections = Arc::new(AtomicUsize::new(0));
    let state = RelayState {
        bridge: Arc::new(config.bridge.clone()),
        connections: Arc::clone(&connections),
    };
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let addr = listener.local_addr()?;
    tracing::info!(
        addr = %addr,
        upstream = %config.bridge.upstream_url,
        "relay started"
    );

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "relay stopped");
        }
    });

    Ok(RelayHandle {
        addr,
        cancel,
        connections,
        server,
    })
}

pub struct RelayHandle {
    addr: SocketAddr,
    cancel: CancellationToken,
    connections: Arc<AtomicUsize>,
    server: tokio::task::JoinHandle<()>,
}

impl RelayHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.server.await;
        tracing::info!("relay stopped");
    }
}

async fn client_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let _guard = ConnectionGuard::enter(&state.connections);
        bridge::run(socket, &state.bridge).await;
    })
}

async fn health_handler(State(state): State<RelayState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "connections": state.connections.load(Ordering::SeqCst),
    }))
}
