use std::time::Duration;

use crate::roles::AgentRole;

/// Failures talking to the reasoning backend, classified so callers can
/// decide between retrying, degrading, or giving up.
#[derive(Clone, Debug, thiserror::Error)]
pub enum BackendError {
    // Fatal
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // Retryable
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("backend overloaded")]
    Overloaded,
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),

    // Operational
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
    #[error("reasoning session closed")]
    SessionClosed,
    #[error("circuit open, retry in {0:?}")]
    CircuitOpen(Duration),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::ServerError { .. }
                | Self::Overloaded
                | Self::NetworkError(_)
                | Self::StreamInterrupted(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthenticationFailed(_) | Self::InvalidRequest(_))
    }

    pub fn suggested_delay(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            Self::CircuitOpen(remaining) => Some(*remaining),
            _ => None,
        }
    }

    /// Short classification string for logs.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::Overloaded => "overloaded",
            Self::NetworkError(_) => "network_error",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::SessionClosed => "session_closed",
            Self::CircuitOpen(_) => "circuit_open",
        }
    }

    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::AuthenticationFailed(body),
            400 | 404 => Self::InvalidRequest(body),
            429 => Self::RateLimited { retry_after: None },
            503 => Self::Overloaded,
            500..=599 => Self::ServerError { status, body },
            _ => Self::InvalidRequest(format!("unexpected status {status}: {body}")),
        }
    }
}

/// Why one agent produced no usable result for a dispatch.
#[derive(Clone, Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("unparseable output: {0}")]
    Unparseable(String),
    #[error("event carries no {0}")]
    MissingInput(&'static str),
    #[error("no upstream results to derive from")]
    UpstreamMissing,
    #[error("{0} has no live reasoning handle")]
    NoHandle(AgentRole),
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
}

impl AgentError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Backend(e) => e.error_kind(),
            Self::Unparseable(_) => "unparseable",
            Self::MissingInput(_) => "missing_input",
            Self::UpstreamMissing => "upstream_missing",
            Self::NoHandle(_) => "no_handle",
            Self::TimedOut(_) => "timed_out",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(BackendError::RateLimited { retry_after: None }.is_retryable());
        assert!(BackendError::ServerError { status: 502, body: "bad".into() }.is_retryable());
        assert!(BackendError::Overloaded.is_retryable());
        assert!(BackendError::NetworkError("reset".into()).is_retryable());
        assert!(!BackendError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!BackendError::SessionClosed.is_retryable());
    }

    #[test]
    fn fatal_classification() {
        assert!(BackendError::AuthenticationFailed("key".into()).is_fatal());
        assert!(BackendError::InvalidRequest("schema".into()).is_fatal());
        assert!(!BackendError::Cancelled.is_fatal());
    }

    #[test]
    fn status_mapping() {
        assert!(BackendError::from_status(401, String::new()).is_fatal());
        assert!(BackendError::from_status(404, String::new()).is_fatal());
        assert!(matches!(BackendError::from_status(503, String::new()), BackendError::Overloaded));
        assert!(BackendError::from_status(500, String::new()).is_retryable());
        assert!(BackendError::from_status(429, String::new()).is_retryable());
    }

    #[test]
    fn delay_hints() {
        let rl = BackendError::RateLimited { retry_after: Some(Duration::from_secs(2)) };
        assert_eq!(rl.suggested_delay(), Some(Duration::from_secs(2)));
        let open = BackendError::CircuitOpen(Duration::from_millis(300));
        assert_eq!(open.suggested_delay(), Some(Duration::from_millis(300)));
        assert_eq!(BackendError::Overloaded.suggested_delay(), None);
    }

    #[test]
    fn agent_error_kind_delegates_to_backend() {
        let err: AgentError = BackendError::Timeout(Duration::from_secs(3)).into();
        assert_eq!(err.error_kind(), "timeout");
        assert_eq!(AgentError::Unparseable("x".into()).error_kind(), "unparseable");
        assert_eq!(AgentError::NoHandle(AgentRole::Scene).to_string(), "scene has no live reasoning handle");
    }
}
