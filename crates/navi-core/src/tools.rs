use serde::{Deserialize, Serialize};

use crate::ids::ToolCallId;

/// Tool declaration sent to the backend when a reasoning session opens.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

/// A function call requested by the backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: ToolCallId,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// The answer to a [`ToolCall`], returned to the backend before the turn completes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: ToolCallId,
    pub name: String,
    pub content: serde_json::Value,
}

impl ToolResult {
    /// Reply for write tools: the side effect has been handed off.
    pub fn acknowledged(call: &ToolCall) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            content: serde_json::json!({ "status": "acknowledged", "stored": true }),
        }
    }

    pub fn with_content(call: &ToolCall, content: serde_json::Value) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            content,
        }
    }

    pub fn rejected(call: &ToolCall, reason: impl Into<String>) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            content: serde_json::json!({ "status": "error", "error": reason.into() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str) -> ToolCall {
        ToolCall {
            id: ToolCallId::from_raw("call_1"),
            name: name.into(),
            arguments: serde_json::json!({}),
        }
    }

    #[test]
    fn acknowledgement_shape() {
        let r = ToolResult::acknowledged(&call("record_landmark"));
        assert_eq!(r.content["status"], "acknowledged");
        assert_eq!(r.content["stored"], true);
        assert_eq!(r.call_id.as_str(), "call_1");
    }

    #[test]
    fn rejection_carries_reason() {
        let r = ToolResult::rejected(&call("nope"), "unknown tool");
        assert_eq!(r.content["status"], "error");
        assert_eq!(r.content["error"], "unknown tool");
    }

    #[test]
    fn arguments_default_to_null() {
        let c: ToolCall = serde_json::from_str(r#"{"id":"call_9","name":"recall_landmark"}"#).unwrap();
        assert!(c.arguments.is_null());
    }
}
