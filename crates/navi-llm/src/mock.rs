use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;

use navi_core::errors::BackendError;
use navi_core::ids::{HandleId, ToolCallId};
use navi_core::reasoning::{
    ReasoningBackend, ReasoningSession, ReplyEvent, ReplyStream, SessionConfig, Turn,
};
use navi_core::roles::AgentRole;
use navi_core::tools::{ToolCall, ToolResult};

/// A scripted backend reply for one `send` or `send_tool_results`.
#[derive(Clone, Debug)]
pub enum MockReply {
    /// Text followed by turn completion.
    Text(String),
    /// Function calls followed by turn completion.
    ToolCalls(Vec<ToolCall>),
    /// A stream that yields an error event.
    StreamError(BackendError),
    /// The send call itself fails.
    SendError(BackendError),
    /// Wait, then resolve the inner reply.
    Delay(Duration, Box<MockReply>),
}

impl MockReply {
    pub fn json(value: serde_json::Value) -> Self {
        Self::Text(value.to_string())
    }

    pub fn delayed(delay: Duration, inner: MockReply) -> Self {
        Self::Delay(delay, Box::new(inner))
    }

    pub fn tool_call(name: &str, arguments: serde_json::Value) -> Self {
        Self::ToolCalls(vec![ToolCall {
            id: ToolCallId::new(),
            name: name.to_string(),
            arguments,
        }])
    }
}

#[derive(Default)]
struct MockState {
    scripts: Mutex<HashMap<AgentRole, VecDeque<MockReply>>>,
    fallbacks: Mutex<HashMap<AgentRole, MockReply>>,
    open_failures: Mutex<HashMap<AgentRole, VecDeque<BackendError>>>,
    token_count_fails: AtomicBool,
    token_count_delay: Mutex<Option<Duration>>,
    sends: Mutex<HashMap<AgentRole, usize>>,
    opens: Mutex<HashMap<AgentRole, usize>>,
    closes: Mutex<HashMap<AgentRole, usize>>,
    turns: Mutex<Vec<(AgentRole, Turn)>>,
    tool_results: Mutex<Vec<(AgentRole, ToolResult)>>,
    configs: Mutex<Vec<SessionConfig>>,
}

impl MockState {
    fn next_reply(&self, role: AgentRole) -> MockReply {
        *self.sends.lock().entry(role).or_default() += 1;
        if let Some(reply) = self.scripts.lock().get_mut(&role).and_then(VecDeque::pop_front) {
            return reply;
        }
        self.fallbacks.lock().get(&role).cloned().unwrap_or_else(|| {
            MockReply::SendError(BackendError::InvalidRequest(format!(
                "mock: no reply scripted for {role}"
            )))
        })
    }
}

/// Backend with per-role scripted replies, for tests that must not touch
/// the network.
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<MockState>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue replies for a role, consumed in order.
    pub fn script(&self, role: AgentRole, replies: impl IntoIterator<Item = MockReply>) -> &Self {
        self.state.scripts.lock().entry(role).or_default().extend(replies);
        self
    }

    /// Reply used whenever a role's queue is empty.
    pub fn fallback(&self, role: AgentRole, reply: MockReply) -> &Self {
        self.state.fallbacks.lock().insert(role, reply);
        self
    }

    /// Make the next `times` opens for a role fail.
    pub fn fail_open(&self, role: AgentRole, error: BackendError, times: usize) -> &Self {
        let mut failures = self.state.open_failures.lock();
        let queue = failures.entry(role).or_default();
        queue.extend(std::iter::repeat(error).take(times));
        self
    }

    pub fn fail_token_count(&self, fail: bool) -> &Self {
        self.state.token_count_fails.store(fail, Ordering::Relaxed);
        self
    }

    /// Hold every `count_tokens` call for `delay` before answering.
    pub fn delay_token_count(&self, delay: Duration) -> &Self {
        *self.state.token_count_delay.lock() = Some(delay);
        self
    }

    pub fn sends(&self, role: AgentRole) -> usize {
        self.state.sends.lock().get(&role).copied().unwrap_or(0)
    }

    pub fn opens(&self, role: AgentRole) -> usize {
        self.state.opens.lock().get(&role).copied().unwrap_or(0)
    }

    pub fn closes(&self, role: AgentRole) -> usize {
        self.state.closes.lock().get(&role).copied().unwrap_or(0)
    }

    pub fn total_sends(&self) -> usize {
        self.state.sends.lock().values().sum()
    }

    pub fn turns(&self, role: AgentRole) -> Vec<Turn> {
        self.state
            .turns
            .lock()
            .iter()
            .filter(|(r, _)| *r == role)
            .map(|(_, t)| t.clone())
            .collect()
    }

    pub fn tool_results(&self, role: AgentRole) -> Vec<ToolResult> {
        self.state
            .tool_results
            .lock()
            .iter()
            .filter(|(r, _)| *r == role)
            .map(|(_, t)| t.clone())
            .collect()
    }

    pub fn opened_configs(&self) -> Vec<SessionConfig> {
        self.state.configs.lock().clone()
    }
}

#[async_trait]
impl ReasoningBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn open(&self, config: SessionConfig) -> Result<Arc<dyn ReasoningSession>, BackendError> {
        let role = config.role;
        *self.state.opens.lock().entry(role).or_default() += 1;
        if let Some(err) = self
            .state
            .open_failures
            .lock()
            .get_mut(&role)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        self.state.configs.lock().push(config);
        Ok(Arc::new(MockSession {
            id: HandleId::new(),
            role,
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn count_tokens(&self, text: &str) -> Result<usize, BackendError> {
        let delay = *self.state.token_count_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.state.token_count_fails.load(Ordering::Relaxed) {
            return Err(BackendError::NetworkError("mock: token counting disabled".into()));
        }
        Ok(text.split_whitespace().count().max(1))
    }
}

pub struct MockSession {
    id: HandleId,
    role: AgentRole,
    state: Arc<MockState>,
    closed: AtomicBool,
}

impl MockSession {
    async fn respond(&self) -> Result<ReplyStream, BackendError> {
        if self.is_closed() {
            return Err(BackendError::SessionClosed);
        }
        let mut reply = self.state.next_reply(self.role);
        loop {
            match reply {
                MockReply::Delay(duration, inner) => {
                    tokio::time::sleep(duration).await;
                    if self.is_closed() {
                        return Err(BackendError::SessionClosed);
                    }
                    reply = *inner;
                }
                MockReply::Text(text) => {
                    return Ok(Box::pin(stream::iter(vec![
                        ReplyEvent::TextDelta(text),
                        ReplyEvent::TurnComplete,
                    ])));
                }
                MockReply::ToolCalls(calls) => {
                    let mut events: Vec<ReplyEvent> = calls.into_iter().map(ReplyEvent::ToolCall).collect();
                    events.push(ReplyEvent::TurnComplete);
                    return Ok(Box::pin(stream::iter(events)));
                }
                MockReply::StreamError(e) => {
                    return Ok(Box::pin(stream::iter(vec![ReplyEvent::Error(e)])));
                }
                MockReply::SendError(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl ReasoningSession for MockSession {
    fn id(&self) -> &HandleId {
        &self.id
    }

    fn role(&self) -> AgentRole {
        self.role
    }

    async fn send(&self, turn: Turn) -> Result<ReplyStream, BackendError> {
        self.state.turns.lock().push((self.role, turn));
        self.respond().await
    }

    async fn send_tool_results(&self, results: Vec<ToolResult>) -> Result<ReplyStream, BackendError> {
        self.state
            .tool_results
            .lock()
            .extend(results.into_iter().map(|r| (self.role, r)));
        self.respond().await
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            *self.state.closes.lock().entry(self.role).or_default() += 1;
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
