//! Connection orchestration: one [`Session`] per client connection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::broadcast;
use tracing::{info, warn};

use navi_core::events::InboundEvent;
use navi_core::ids::SessionId;
use navi_core::reasoning::ReasoningBackend;
use navi_core::results::{HazardAlert, MergedResponse};
use navi_settings::{AgentSettings, BackendSettings, NaviSettings};
use navi_store::NavigationStore;

use crate::bus::HazardBus;
use crate::context::ContextConfig;
use crate::error::EngineError;
use crate::session::Session;

/// Runtime bounds and per-role settings shared by every session.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub dispatch_timeout: Duration,
    pub open_timeout: Duration,
    pub close_grace: Duration,
    pub reopen_interval: Duration,
    pub context: ContextConfig,
    pub agents: AgentSettings,
    pub backend: BackendSettings,
}

impl From<&NaviSettings> for EngineConfig {
    fn from(s: &NaviSettings) -> Self {
        Self {
            dispatch_timeout: s.orchestrator.dispatch_timeout(),
            open_timeout: s.orchestrator.open_timeout(),
            close_grace: s.orchestrator.close_grace(),
            reopen_interval: s.orchestrator.reopen_interval(),
            context: ContextConfig::from(&s.context),
            agents: s.agents.clone(),
            backend: s.backend.clone(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&NaviSettings::default())
    }
}

/// What the orchestration endpoint needs from the engine.
#[async_trait]
pub trait NavigationOrchestrator: Send + Sync {
    async fn open(&self, session_id: SessionId) -> Result<Arc<Session>, EngineError>;
    async fn route(&self, session_id: &SessionId, event: InboundEvent) -> Result<MergedResponse, EngineError>;
    /// Idempotent; closing an unknown session is a no-op.
    async fn close(&self, session_id: &SessionId);
    fn active_sessions(&self) -> usize;
    fn subscribe_hazards(&self) -> broadcast::Receiver<HazardAlert>;
}

pub struct Orchestrator {
    sessions: DashMap<SessionId, Arc<Session>>,
    backend: Arc<dyn ReasoningBackend>,
    store: Arc<dyn NavigationStore>,
    bus: HazardBus,
    config: Arc<EngineConfig>,
}

impl Orchestrator {
    pub fn new(backend: Arc<dyn ReasoningBackend>, store: Arc<dyn NavigationStore>, config: EngineConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            backend,
            store,
            bus: HazardBus::default(),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn bus(&self) -> &HazardBus {
        &self.bus
    }

    pub fn session(&self, session_id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.get(session_id).map(|s| Arc::clone(s.value()))
    }

    /// Close every open session.
    pub async fn shutdown(&self) {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        info!(sessions = ids.len(), "closing all sessions");
        join_all(ids.iter().map(|id| NavigationOrchestrator::close(self, id))).await;
    }
}

#[async_trait]
impl NavigationOrchestrator for Orchestrator {
    async fn open(&self, session_id: SessionId) -> Result<Arc<Session>, EngineError> {
        if self.sessions.contains_key(&session_id) {
            return Err(EngineError::SessionAlreadyOpen(session_id.to_string()));
        }
        let session = Session::open(
            session_id.clone(),
            Arc::clone(&self.backend),
            Arc::clone(&self.store),
            self.bus.clone(),
            Arc::clone(&self.config),
        )
        .await;

        match self.sessions.entry(session_id.clone()) {
            Entry::Occupied(_) => {
                warn!(session_id = %session_id, "session opened concurrently, discarding duplicate");
                session.close().await;
                Err(EngineError::SessionAlreadyOpen(session_id.to_string()))
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&session));
                Ok(session)
            }
        }
    }

    async fn route(&self, session_id: &SessionId, event: InboundEvent) -> Result<MergedResponse, EngineError> {
        let session = self
            .session(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;
        session.route(event).await
    }

    async fn close(&self, session_id: &SessionId) {
        if let Some((_, session)) = self.sessions.remove(session_id) {
            session.close().await;
        }
    }

    fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    fn subscribe_hazards(&self) -> broadcast::Receiver<HazardAlert> {
        self.bus.subscribe()
    }
}
