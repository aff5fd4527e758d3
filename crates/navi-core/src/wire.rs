use serde::{Deserialize, Serialize};

use crate::ids::SessionId;
use crate::results::{HazardAlert, MergedResponse};
use crate::roles::AgentRole;

/// Header carrying the session identity the relay assigned to a client.
pub const SESSION_HEADER: &str = "x-session-id";

/// Typed error codes carried in `error` frames.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MalformedPayload,
    UnknownEvent,
    SessionClosing,
    SessionNotFound,
    UpstreamUnavailable,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MalformedPayload => "MALFORMED_PAYLOAD",
            Self::UnknownEvent => "UNKNOWN_EVENT",
            Self::SessionClosing => "SESSION_CLOSING",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub code: ErrorCode,
    pub message: String,
}

/// Frames sent by the orchestration endpoint to the relay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EndpointFrame {
    SessionReady {
        session_id: SessionId,
        #[serde(default)]
        degraded_roles: Vec<AgentRole>,
    },
    Response(MergedResponse),
    HazardAlert(HazardAlert),
    Error(ErrorFrame),
}

impl EndpointFrame {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error(ErrorFrame {
            code,
            message: message.into(),
        })
    }

    /// The `type` tag the relay attaches when forwarding to the client.
    pub fn response_type(&self) -> &'static str {
        match self {
            Self::SessionReady { .. } => "session_ready",
            Self::Response(r) => r.kind.as_str(),
            Self::HazardAlert(_) => "hazard_alert",
            Self::Error(_) => "error",
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","code":"INTERNAL_ERROR","message":"encode failed: {e}"}}"#)
        })
    }
}
