use navi_core::errors::BackendError;
use navi_core::wire::ErrorCode;
use navi_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session is closing: {0}")]
    SessionClosing(String),

    #[error("session already open: {0}")]
    SessionAlreadyOpen(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    /// Wire error code reported to the client.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::SessionNotFound(_) => ErrorCode::SessionNotFound,
            Self::SessionClosing(_) => ErrorCode::SessionClosing,
            Self::Backend(_) => ErrorCode::UpstreamUnavailable,
            Self::SessionAlreadyOpen(_) | Self::Store(_) | Self::Internal(_) => {
                ErrorCode::InternalError
            }
        }
    }
}
