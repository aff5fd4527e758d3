use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use navi_core::ids::SessionId;
use navi_core::wire::SESSION_HEADER;
use navi_engine::NavigationOrchestrator;
use navi_settings::types::OrchestratorSettings;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::connection::{self, ConnectionRegistry};
use crate::hazard_bridge::HazardBridge;

/// Orchestration endpoint configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_send_queue: usize,
    pub heartbeat_interval: Duration,
}

impl From<&OrchestratorSettings> for ServerConfig {
    fn from(s: &OrchestratorSettings) -> Self {
        Self {
            host: s.host.clone(),
            port: s.port,
            max_send_queue: s.max_send_queue,
            heartbeat_interval: Duration::from_millis(s.heartbeat_interval_ms.max(1)),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&OrchestratorSettings::default())
    }
}

/// Shared state handed to every axum handler.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<dyn NavigationOrchestrator>,
    pub registry: Arc<ConnectionRegistry>,
    pub heartbeat: Duration,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/agent/stream", get(stream_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Bind the endpoint and start serving. The hazard bridge runs alongside.
pub async fn start(
    config: ServerConfig,
    orchestrator: Arc<dyn NavigationOrchestrator>,
) -> Result<ServerHandle, std::io::Error> {
    let registry = Arc::new(ConnectionRegistry::new(config.max_send_queue));
    let cancel = CancellationToken::new();

    let bridge = HazardBridge::new(Arc::clone(&registry))
        .start(orchestrator.subscribe_hazards(), cancel.child_token());

    let state = AppState {
        orchestrator,
        registry: Arc::clone(&registry),
        heartbeat: config.heartbeat_interval,
    };
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let addr = listener.local_addr()?;
    tracing::info!(addr = %addr, "orchestration endpoint started");

    let shutdown = cancel.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "orchestration endpoint stopped");
        }
    });

    Ok(ServerHandle {
        addr,
        cancel,
        registry,
        server,
        bridge,
    })
}

/// Keeps the endpoint's background tasks alive until shut down.
pub struct ServerHandle {
    addr: SocketAddr,
    cancel: CancellationToken,
    registry: Arc<ConnectionRegistry>,
    server: tokio::task::JoinHandle<()>,
    bridge: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn connections(&self) -> usize {
        self.registry.count()
    }

    /// Close every relay connection and stop accepting new ones.
    pub async fn shutdown(self) {
        self.registry.close_all();
        self.cancel.cancel();
        let _ = self.server.await;
        let _ = self.bridge.await;
        tracing::info!("orchestration endpoint stopped");
    }
}

async fn stream_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let Some(session_id) = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(SessionId::from_header)
    else {
        return (StatusCode::BAD_REQUEST, "missing or invalid X-Session-Id header").into_response();
    };

    ws.on_upgrade(move |socket| {
        connection::handle_connection(
            socket,
            session_id,
            state.orchestrator,
            state.registry,
            state.heartbeat,
        )
    })
    .into_response()
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "active_sessions": state.orchestrator.active_sessions(),
        "connections": state.registry.count(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_follows_settings() {
        let settings = OrchestratorSettings {
            port: 8123,
            max_send_queue: 16,
            heartbeat_interval_ms: 500,
            ..Default::default()
        };
        let config = ServerConfig::from(&settings);
        assert_eq!(config.port, 8123);
        assert_eq!(config.max_send_queue, 16);
        assert_eq!(config.heartbeat_interval, Duration::from_millis(500));
    }

    #[test]
    fn zero_heartbeat_is_clamped() {
        let settings = OrchestratorSettings {
            heartbeat_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(ServerConfig::from(&settings).heartbeat_interval, Duration::from_millis(1));
    }
}
