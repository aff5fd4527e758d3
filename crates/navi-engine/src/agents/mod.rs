//! Agent roles.
//!
//! An agent turns one inbound event plus a slice of session context into one
//! model turn on its reasoning handle, runs any function calls the backend
//! asks for, and decodes the final text into its role's typed output.
//! Audio parameterization is derived from sibling results and never talks to
//! the backend; see [`audio::derive`].

pub mod audio;
pub mod hazard;
pub mod parse;
pub mod recall;
pub mod route;
pub mod scene;

use std::sync::Arc;

use async_trait::async_trait;

use navi_core::errors::{AgentError, BackendError};
use navi_core::events::InboundEvent;
use navi_core::ids::SessionId;
use navi_core::reasoning::{collect_reply, ReasoningSession, SessionConfig, Turn};
use navi_core::results::RoleOutput;
use navi_core::roles::AgentRole;
use navi_settings::{AgentSettings, BackendSettings};

use crate::context::{ContextEntry, NewEntry};
use crate::tools::{self, ToolRunner};

/// Backend round trips allowed for function calls within one turn.
pub const MAX_TOOL_ROUNDS: usize = 4;

/// Read-only snapshot of session context taken when a dispatch starts.
#[derive(Clone, Debug, Default)]
pub struct ContextView {
    pub rendered: String,
    pub entries: Vec<ContextEntry>,
}

impl ContextView {
    /// Entries mentioning `needle`, case-insensitively.
    pub fn mentioning(&self, needle: &str) -> Vec<&ContextEntry> {
        let needle = needle.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }
        self.entries
            .iter()
            .filter(|e| e.text().to_lowercase().contains(&needle))
            .collect()
    }
}

/// Everything one agent invocation may use besides the event itself.
#[derive(Clone)]
pub struct AgentContext {
    pub session_id: SessionId,
    pub frame_seq: u64,
    pub handle: Option<Arc<dyn ReasoningSession>>,
    pub view: Arc<ContextView>,
    pub tools: ToolRunner,
    /// Last position reported by a video frame, if any.
    pub position: Option<(f64, f64)>,
}

impl AgentContext {
    pub fn handle(&self, role: AgentRole) -> Result<&Arc<dyn ReasoningSession>, AgentError> {
        self.handle.as_ref().ok_or(AgentError::NoHandle(role))
    }
}

/// A successful agent invocation: the typed output plus context entries to
/// append once the dispatch has joined.
#[derive(Clone, Debug)]
pub struct AgentReport {
    pub output: RoleOutput,
    pub entries: Vec<NewEntry>,
}

#[async_trait]
pub trait Agent: Send + Sync {
    fn role(&self) -> AgentRole;

    /// Role instruction text for the reasoning session.
    fn instruction(&self) -> &'static str;

    async fn handle_event(&self, event: &InboundEvent, ctx: &AgentContext) -> Result<AgentReport, AgentError>;

    fn session_config(&self, backend: &BackendSettings) -> SessionConfig {
        SessionConfig {
            role: self.role(),
            instruction: self.instruction().to_string(),
            temperature: backend.temperature,
            max_output_tokens: backend.max_output_tokens,
            tools: tools::definitions_for(self.role()),
        }
    }
}

/// Build the agents that own a reasoning handle, one per role.
pub fn build_agents(settings: &AgentSettings) -> Vec<Arc<dyn Agent>> {
    vec![
        Arc::new(scene::SceneAgent::new()),
        Arc::new(hazard::HazardAgent::new(
            settings.hazard_history,
            settings.hazard_window_secs,
        )),
        Arc::new(route::RouteAgent::new(settings.route_history)),
        Arc::new(recall::RecallAgent::new(
            settings.recall_limit,
            settings.recall_radius_m,
        )),
    ]
}

/// Send a turn and settle any function calls, returning the final text.
/// Entries produced by tools are appended to `entries`.
pub async fn converse(
    handle: &dyn ReasoningSession,
    turn: Turn,
    ctx: &AgentContext,
    entries: &mut Vec<NewEntry>,
) -> Result<String, AgentError> {
    let mut reply = collect_reply(handle.send(turn).await?).await?;
    let mut text = std::mem::take(&mut reply.text);
    let mut rounds = 0;
    while !reply.tool_calls.is_empty() {
        if rounds == MAX_TOOL_ROUNDS {
            return Err(AgentError::Backend(BackendError::InvalidRequest(format!(
                "function calls did not settle after {MAX_TOOL_ROUNDS} rounds"
            ))));
        }
        let mut results = Vec::with_capacity(reply.tool_calls.len());
        for call in &reply.tool_calls {
            let outcome = ctx.tools.execute(call, ctx.frame_seq, ctx.position).await;
            entries.extend(outcome.entries);
            results.push(outcome.result);
        }
        reply = collect_reply(handle.send_tool_results(results).await?).await?;
        text.push_str(&reply.text);
        rounds += 1;
    }
    Ok(text)
}

/// Shared prompt suffix carrying session context.
pub(crate) fn with_context(prompt: String, view: &ContextView) -> String {
    if view.rendered.is_empty() {
        prompt
    } else {
        format!("{prompt}\n\nSession context:\n{}", view.rendered)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::bus::HazardBus;
    use crate::persist::PersistWriter;
    use crate::tools::SessionCounters;
    use navi_core::reasoning::ReasoningBackend;
    use navi_llm::MockBackend;
    use navi_store::{Database, NavigationStore, SqliteStore};

    pub fn sqlite() -> Arc<dyn NavigationStore> {
        Arc::new(SqliteStore::new(Database::in_memory().unwrap()))
    }

    pub fn runner(store: Arc<dyn NavigationStore>) -> ToolRunner {
        ToolRunner::new(
            SessionId::from_raw("nav_agents"),
            store,
            PersistWriter::new(),
            HazardBus::default(),
            Arc::new(SessionCounters::default()),
            5,
        )
    }

    pub async fn context_for(mock: &MockBackend, agent: &dyn Agent, tools: ToolRunner) -> AgentContext {
        let handle = mock
            .open(agent.session_config(&BackendSettings::default()))
            .await
            .unwrap();
        AgentContext {
            session_id: tools.session_id().clone(),
            frame_seq: 1,
            handle: Some(handle),
            view: Arc::new(ContextView::default()),
            tools,
            position: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use navi_llm::{MockBackend, MockReply};
    use serde_json::json;

    #[tokio::test]
    async fn converse_settles_tool_calls_before_returning() {
        let mock = MockBackend::new();
        mock.script(
            AgentRole::Scene,
            [
                MockReply::tool_call("record_landmark", json!({"label": "elevator"})),
                MockReply::Text("{\"done\": true}".into()),
            ],
        );
        let agent = scene::SceneAgent::new();
        let ctx = context_for(&mock, &agent, runner(sqlite())).await;
        let mut entries = Vec::new();
        let handle = ctx.handle(AgentRole::Scene).unwrap().clone();
        let text = converse(handle.as_ref(), Turn::text("frame"), &ctx, &mut entries)
            .await
            .unwrap();
        assert_eq!(text, "{\"done\": true}");
        assert_eq!(entries.len(), 1);
        let results = mock.tool_results(AgentRole::Scene);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].content["status"], "acknowledged");
    }

    #[tokio::test]
    async fn endless_tool_calls_fail_the_agent() {
        let mock = MockBackend::new();
        mock.fallback(
            AgentRole::Route,
            MockReply::tool_call("update_route", json!({"next_direction": "left", "instruction": "turn"})),
        );
        let agent = route::RouteAgent::new(5);
        let ctx = context_for(&mock, &agent, runner(sqlite())).await;
        let mut entries = Vec::new();
        let handle = ctx.handle(AgentRole::Route).unwrap().clone();
        let err = converse(handle.as_ref(), Turn::text("go"), &ctx, &mut entries)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Backend(BackendError::InvalidRequest(_))));
        assert_eq!(mock.sends(AgentRole::Route), MAX_TOOL_ROUNDS + 1);
    }

    #[test]
    fn session_config_carries_role_settings() {
        let agent = hazard::HazardAgent::new(8, 10.0);
        let backend = BackendSettings::default();
        let config = agent.session_config(&backend);
        assert_eq!(config.role, AgentRole::Hazard);
        assert_eq!(config.max_output_tokens, backend.max_output_tokens);
        assert_eq!(config.tools.len(), 1);
        assert!(!config.instruction.is_empty());
    }

    #[test]
    fn build_agents_covers_handle_roles() {
        let agents = build_agents(&AgentSettings::default());
        let mut roles: Vec<AgentRole> = agents.iter().map(|a| a.role()).collect();
        let mut expected: Vec<AgentRole> = AgentRole::with_handles().collect();
        roles.sort();
        expected.sort();
        assert_eq!(roles, expected);
    }
}
