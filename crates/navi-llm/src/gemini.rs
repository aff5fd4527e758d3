//! Gemini `generateContent` backend.
//!
//! Each agent role gets its own [`GeminiSession`] holding the role's system
//! instruction, generation config and function declarations. The session keeps
//! a short rolling history of completed exchanges so a role sees its own recent
//! turns without the request body growing for the life of the connection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::{debug, error, info};

use navi_core::errors::BackendError;
use navi_core::ids::{HandleId, ToolCallId};
use navi_core::reasoning::{
    ReasoningBackend, ReasoningSession, ReplyEvent, ReplyStream, SessionConfig, Turn, TurnPart,
};
use navi_core::roles::AgentRole;
use navi_core::tools::{ToolCall, ToolResult};

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Completed user/model exchanges retained per session.
const MAX_EXCHANGES: usize = 8;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct GeminiConfig {
    pub api_base: String,
    pub model: String,
    pub api_key: SecretString,
    pub timeout: Duration,
}

impl GeminiConfig {
    pub fn new(model: impl Into<String>, api_key: SecretString) -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            model: model.into(),
            api_key,
            timeout: Duration::from_secs(15),
        }
    }

    fn url(&self, action: &str) -> String {
        format!(
            "{}/models/{}:{action}",
            self.api_base.trim_end_matches('/'),
            self.model
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Backend
// ─────────────────────────────────────────────────────────────────────────────

pub struct GeminiBackend {
    config: Arc<GeminiConfig>,
    client: reqwest::Client,
}

impl GeminiBackend {
    pub fn new(config: GeminiConfig) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(config.timeout)
            .build()
            .map_err(|e| BackendError::NetworkError(e.to_string()))?;
        info!(model = %config.model, api_base = %config.api_base, "gemini backend initialized");
        Ok(Self {
            config: Arc::new(config),
            client,
        })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }
}

#[async_trait]
impl ReasoningBackend for GeminiBackend {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn open(&self, config: SessionConfig) -> Result<Arc<dyn ReasoningSession>, BackendError> {
        if self.config.api_key.expose_secret().is_empty() {
            return Err(BackendError::AuthenticationFailed(
                "gemini api key is empty".into(),
            ));
        }
        let session = GeminiSession::new(self.config.clone(), self.client.clone(), config);
        debug!(handle = %session.id, role = %session.role, "gemini session opened");
        Ok(Arc::new(session))
    }

    async fn count_tokens(&self, text: &str) -> Result<usize, BackendError> {
        let body = json!({ "contents": [{ "role": "user", "parts": [{ "text": text }] }] });
        let value = post_json(&self.client, &self.config, "countTokens", &body).await?;
        value["totalTokens"]
            .as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| BackendError::InvalidRequest("countTokens reply missing totalTokens".into()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

pub struct GeminiSession {
    id: HandleId,
    role: AgentRole,
    config: Arc<GeminiConfig>,
    client: reqwest::Client,
    system_instruction: Value,
    generation_config: Value,
    tools: Option<Value>,
    exchanges: Mutex<VecDeque<Vec<Value>>>,
    pending: Mutex<Vec<Value>>,
    closed: AtomicBool,
}

impl GeminiSession {
    fn new(config: Arc<GeminiConfig>, client: reqwest::Client, session: SessionConfig) -> Self {
        let tools = (!session.tools.is_empty()).then(|| {
            let declarations: Vec<Value> = session
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters_schema,
                    })
                })
                .collect();
            json!([{ "functionDeclarations": declarations }])
        });
        Self {
            id: HandleId::new(),
            role: session.role,
            config,
            client,
            system_instruction: json!({ "parts": [{ "text": session.instruction }] }),
            generation_config: json!({
                "temperature": session.temperature,
                "maxOutputTokens": session.max_output_tokens,
            }),
            tools,
            exchanges: Mutex::new(VecDeque::new()),
            pending: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn request_body(&self) -> Value {
        let mut contents: Vec<Value> = self.exchanges.lock().iter().flatten().cloned().collect();
        contents.extend(self.pending.lock().iter().cloned());
        let mut body = json!({
            "contents": contents,
            "systemInstruction": self.system_instruction,
            "generationConfig": self.generation_config,
        });
        if let Some(tools) = &self.tools {
            body["tools"] = tools.clone();
        }
        body
    }

    async fn exchange(&self, content: Value) -> Result<ReplyStream, BackendError> {
        if self.is_closed() {
            return Err(BackendError::SessionClosed);
        }
        self.pending.lock().push(content);
        let body = self.request_body();

        let reply = match post_json(&self.client, &self.config, "generateContent", &body).await {
            Ok(reply) => reply,
            Err(e) => {
                self.pending.lock().clear();
                return Err(e);
            }
        };
        if self.is_closed() {
            return Err(BackendError::SessionClosed);
        }

        let model_content = reply["candidates"][0]["content"].clone();
        let events = reply_events(&model_content);
        let awaiting_tools = events.iter().any(|e| matches!(e, ReplyEvent::ToolCall(_)));

        let mut pending = self.pending.lock();
        pending.push(model_content);
        if !awaiting_tools {
            let finished = std::mem::take(&mut *pending);
            let mut exchanges = self.exchanges.lock();
            exchanges.push_back(finished);
            while exchanges.len() > MAX_EXCHANGES {
                exchanges.pop_front();
            }
        }
        Ok(Box::pin(stream::iter(events)))
    }
}

#[async_trait]
impl ReasoningSession for GeminiSession {
    fn id(&self) -> &HandleId {
        &self.id
    }

    fn role(&self) -> AgentRole {
        self.role
    }

    async fn send(&self, turn: Turn) -> Result<ReplyStream, BackendError> {
        self.exchange(json!({ "role": "user", "parts": turn_parts(&turn) }))
            .await
    }

    async fn send_tool_results(&self, results: Vec<ToolResult>) -> Result<ReplyStream, BackendError> {
        let parts: Vec<Value> = results
            .iter()
            .map(|r| json!({ "functionResponse": { "name": r.name, "response": r.content } }))
            .collect();
        self.exchange(json!({ "role": "user", "parts": parts })).await
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.pending.lock().clear();
            self.exchanges.lock().clear();
            debug!(handle = %self.id, role = %self.role, "gemini session closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire helpers
// ─────────────────────────────────────────────────────────────────────────────

fn turn_parts(turn: &Turn) -> Vec<Value> {
    turn.parts
        .iter()
        .map(|part| match part {
            TurnPart::Text(text) => json!({ "text": text }),
            TurnPart::Image { mime, data_b64 } | TurnPart::Audio { mime, data_b64 } => {
                json!({ "inlineData": { "mimeType": mime, "data": data_b64 } })
            }
        })
        .collect()
}

/// Translate a candidate's content into reply events, always ending with
/// `TurnComplete`.
fn reply_events(content: &Value) -> Vec<ReplyEvent> {
    let mut events = Vec::new();
    if let Some(parts) = content["parts"].as_array() {
        for part in parts {
            if let Some(text) = part["text"].as_str() {
                events.push(ReplyEvent::TextDelta(text.to_string()));
            } else if let Some(call) = part.get("functionCall") {
                events.push(ReplyEvent::ToolCall(ToolCall {
                    id: ToolCallId::new(),
                    name: call["name"].as_str().unwrap_or_default().to_string(),
                    arguments: call.get("args").cloned().unwrap_or_else(|| json!({})),
                }));
            }
        }
    }
    events.push(ReplyEvent::TurnComplete);
    events
}

async fn post_json(
    client: &reqwest::Client,
    config: &GeminiConfig,
    action: &str,
    body: &Value,
) -> Result<Value, BackendError> {
    let response = client
        .post(config.url(action))
        .header(CONTENT_TYPE, "application/json")
        .header("x-goog-api-key", config.api_key.expose_secret())
        .json(body)
        .send()
        .await
        .map_err(|e| map_transport_error(e, config.timeout))?;

    let status = response.status();
    if !status.is_success() {
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let text = response.text().await.unwrap_or_default();
        let message = api_error_message(&text, status.as_u16());
        error!(status = status.as_u16(), action, "gemini api error");
        return Err(match BackendError::from_status(status.as_u16(), message) {
            BackendError::RateLimited { .. } => BackendError::RateLimited { retry_after },
            other => other,
        });
    }

    response
        .json::<Value>()
        .await
        .map_err(|e| BackendError::StreamInterrupted(e.to_string()))
}

fn map_transport_error(error: reqwest::Error, timeout: Duration) -> BackendError {
    if error.is_timeout() {
        BackendError::Timeout(timeout)
    } else {
        BackendError::NetworkError(error.to_string())
    }
}

fn api_error_message(body: &str, status: u16) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(String::from))
        .unwrap_or_else(|| format!("HTTP {status}: {body}"))
}
