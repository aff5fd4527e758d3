use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};

use crate::errors::BackendError;
use crate::ids::HandleId;
use crate::roles::AgentRole;
use crate::tools::{ToolCall, ToolDefinition, ToolResult};

/// Role-specific configuration used to open a reasoning session.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub role: AgentRole,
    pub instruction: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub tools: Vec<ToolDefinition>,
}

/// One piece of a multimodal turn.
#[derive(Clone, Debug, PartialEq)]
pub enum TurnPart {
    Text(String),
    Image { mime: String, data_b64: String },
    Audio { mime: String, data_b64: String },
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Turn {
    pub parts: Vec<TurnPart>,
}

impl Turn {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            parts: vec![TurnPart::Text(text.into())],
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.parts.push(TurnPart::Text(text.into()));
        self
    }

    pub fn with_image(mut self, mime: impl Into<String>, data_b64: impl Into<String>) -> Self {
        self.parts.push(TurnPart::Image {
            mime: mime.into(),
            data_b64: data_b64.into(),
        });
        self
    }

    pub fn with_audio(mut self, mime: impl Into<String>, data_b64: impl Into<String>) -> Self {
        self.parts.push(TurnPart::Audio {
            mime: mime.into(),
            data_b64: data_b64.into(),
        });
        self
    }

    /// Concatenated text parts, used for token accounting and mocks.
    pub fn text_content(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                TurnPart::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Events yielded while a reply streams back. Ordering contract:
/// `(TextDelta | ToolCall)* -> TurnComplete`, with `Error` terminal at any point.
#[derive(Clone, Debug)]
pub enum ReplyEvent {
    TextDelta(String),
    ToolCall(ToolCall),
    TurnComplete,
    Error(BackendError),
}

impl ReplyEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TurnComplete | Self::Error(_))
    }
}

pub type ReplyStream = Pin<Box<dyn Stream<Item = ReplyEvent> + Send>>;

/// Factory for reasoning sessions (one per agent role per connection).
#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn open(&self, config: SessionConfig) -> Result<Arc<dyn ReasoningSession>, BackendError>;

    /// Authoritative token count for `text`.
    async fn count_tokens(&self, text: &str) -> Result<usize, BackendError>;
}

/// A live, role-scoped connection to the backend.
#[async_trait]
pub trait ReasoningSession: Send + Sync {
    fn id(&self) -> &HandleId;
    fn role(&self) -> AgentRole;

    async fn send(&self, turn: Turn) -> Result<ReplyStream, BackendError>;

    async fn send_tool_results(&self, results: Vec<ToolResult>) -> Result<ReplyStream, BackendError>;

    /// Release backend resources. Must be safe to call more than once.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// A fully drained reply.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Reply {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
}

/// Drain a reply stream into text plus requested tool calls.
pub async fn collect_reply(mut stream: ReplyStream) -> Result<Reply, BackendError> {
    let mut reply = Reply::default();
    while let Some(event) = stream.next().await {
        match event {
            ReplyEvent::TextDelta(delta) => reply.text.push_str(&delta),
            ReplyEvent::ToolCall(call) => reply.tool_calls.push(call),
            ReplyEvent::TurnComplete => return Ok(reply),
            ReplyEvent::Error(e) => return Err(e),
        }
    }
    Err(BackendError::StreamInterrupted(
        "stream ended before turn completed".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ToolCallId;

    fn stream_of(events: Vec<ReplyEvent>) -> ReplyStream {
        Box::pin(futures::stream::iter(events))
    }

    #[tokio::test]
    async fn collects_text_and_calls() {
        let call = ToolCall {
            id: ToolCallId::from_raw("call_a"),
            name: "record_landmark".into(),
            arguments: serde_json::json!({"label": "door"}),
        };
        let reply = collect_reply(stream_of(vec![
            ReplyEvent::TextDelta("{\"a\":".into()),
            ReplyEvent::ToolCall(call.clone()),
            ReplyEvent::TextDelta("1}".into()),
            ReplyEvent::TurnComplete,
        ]))
        .await
        .unwrap();
        assert_eq!(reply.text, "{\"a\":1}");
        assert_eq!(reply.tool_calls, vec![call]);
    }

    #[tokio::test]
    async fn error_event_fails_the_reply() {
        let err = collect_reply(stream_of(vec![
            ReplyEvent::TextDelta("partial".into()),
            ReplyEvent::Error(BackendError::Overloaded),
        ]))
        .await
        .unwrap_err();
        assert!(matches!(err, BackendError::Overloaded));
    }

    #[tokio::test]
    async fn truncated_stream_is_interrupted() {
        let err = collect_reply(stream_of(vec![ReplyEvent::TextDelta("x".into())]))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::StreamInterrupted(_)));
    }

    #[test]
    fn turn_text_content_skips_media() {
        let turn = Turn::text("look")
            .with_image("image/jpeg", "AAAA")
            .with_text("and listen");
        assert_eq!(turn.text_content(), "look\nand listen");
        assert_eq!(turn.parts.len(), 3);
    }
}
