use navi_core::events::DecodeError;
use navi_core::wire::{EndpointFrame, ErrorCode};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("upstream connect failed: {0}")]
    UpstreamConnect(String),

    #[error("upstream closed: {0}")]
    UpstreamClosed(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] DecodeError),

    #[error("pending queue full ({0} messages)")]
    QueueFull(usize),
}

impl RelayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UpstreamConnect(_) | Self::UpstreamClosed(_) | Self::QueueFull(_) => {
                ErrorCode::UpstreamUnavailable
            }
            Self::MalformedPayload(DecodeError::UnknownType(_)) => ErrorCode::UnknownEvent,
            Self::MalformedPayload(_) => ErrorCode::MalformedPayload,
        }
    }

    /// The typed error frame sent to the client.
    pub fn to_frame(&self) -> EndpointFrame {
        EndpointFrame::error(self.code(), self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_events_keep_their_own_code() {
        let err = RelayError::from(DecodeError::UnknownType("telemetry".into()));
        assert_eq!(err.code(), ErrorCode::UnknownEvent);
        let err = RelayError::from(DecodeError::MissingType);
        assert_eq!(err.code(), ErrorCode::MalformedPayload);
    }

    #[test]
    fn upstream_failures_map_to_unavailable() {
        let frame = RelayError::UpstreamConnect("refused".into()).to_frame();
        match frame {
            EndpointFrame::Error(e) => {
                assert_eq!(e.code, ErrorCode::UpstreamUnavailable);
                assert!(e.message.contains("refused"));
            }
            other => panic!("expected error frame, got {other:?}"),
        }
    }
}
