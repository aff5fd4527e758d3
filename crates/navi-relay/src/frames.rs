use base64::Engine;
use navi_core::events::InboundEvent;
use navi_core::wire::{EndpointFrame, ErrorCode};
use serde_json::{json, Value};

use crate::error::RelayError;

/// An endpoint frame rewritten for the client.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientFrame {
    pub response_type: &'static str,
    pub text: String,
}

impl ClientFrame {
    pub fn is_ready(&self) -> bool {
        self.response_type == "session_ready"
    }

    pub fn error(err: &RelayError) -> Self {
        Self {
            response_type: "error",
            text: err.to_frame().to_json(),
        }
    }
}

/// Validate a client text payload and return the normalized event to
/// forward upstream.
pub fn client_text(raw: &str) -> Result<String, RelayError> {
    let event = InboundEvent::decode(raw)?;
    serde_json::to_string(&event).map_err(|e| {
        RelayError::MalformedPayload(navi_core::events::DecodeError::NotJson(e.to_string()))
    })
}

/// Wrap a binary audio frame in an `audio_chunk` event.
pub fn client_audio(bytes: &[u8], timestamp: f64) -> String {
    json!({
        "type": "audio_chunk",
        "data": base64::engine::general_purpose::STANDARD.encode(bytes),
        "timestamp": timestamp,
    })
    .to_string()
}

/// Seconds since the epoch, for events the relay creates itself.
pub fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Tag an endpoint frame with its response type. Unreadable frames become
/// typed errors so the client still hears about them.
pub fn tag_for_client(raw: &str) -> ClientFrame {
    let parsed = serde_json::from_str::<Value>(raw).and_then(|value| {
        serde_json::from_value::<EndpointFrame>(value.clone()).map(|frame| (value, frame))
    });
    match parsed {
        Ok((mut value, frame)) => {
            let response_type = frame.response_type();
            if let Some(obj) = value.as_object_mut() {
                obj.insert("type".into(), Value::from(response_type));
            }
            ClientFrame {
                response_type,
                text: value.to_string(),
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "unreadable upstream frame");
            let frame = EndpointFrame::error(
                ErrorCode::InternalError,
                format!("unreadable upstream frame: {e}"),
            );
            ClientFrame {
                response_type: "error",
                text: frame.to_json(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use navi_core::ids::SessionId;
    use navi_core::results::{MergedResponse, ResponseKind};

    #[test]
    fn valid_events_are_normalized() {
        let out = client_text(r#"{"type":"text_query","destination":"gate 12","timestamp":3}"#).unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["type"], "text_query");
        assert_eq!(v["text"], "gate 12");
        assert_eq!(v["timestamp"], 3.0);
    }

    #[test]
    fn malformed_events_are_rejected() {
        assert!(matches!(
            client_text("not json"),
            Err(RelayError::MalformedPayload(_))
        ));
        let err = client_text(r#"{"type":"gps_fix"}"#).unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnknownEvent);
    }

    #[test]
    fn binary_audio_is_base64_wrapped() {
        let out = client_audio(&[1, 2, 3], 10.5);
        let event = InboundEvent::decode(&out).unwrap();
        match event {
            InboundEvent::AudioChunk(chunk) => {
                assert_eq!(chunk.data, "AQID");
                assert_eq!(chunk.timestamp, Some(10.5));
            }
            other => panic!("expected audio chunk, got {other:?}"),
        }
    }

    #[test]
    fn responses_are_tagged_by_kind() {
        let mut r = MergedResponse::empty(ResponseKind::NavigationUpdate, SessionId::from_raw("nav_t"), 4);
        r.direction = Some("left".into());
        let tagged = tag_for_client(&EndpointFrame::Response(r).to_json());
        assert_eq!(tagged.response_type, "navigation_update");
        let v: Value = serde_json::from_str(&tagged.text).unwrap();
        assert_eq!(v["type"], "navigation_update");
        assert_eq!(v["direction"], "left");
        assert_eq!(v["frame_seq"], 4);
    }

    #[test]
    fn session_ready_is_recognized() {
        let frame = EndpointFrame::SessionReady {
            session_id: SessionId::from_raw("nav_r"),
            degraded_roles: vec![],
        };
        let tagged = tag_for_client(&frame.to_json());
        assert!(tagged.is_ready());
    }

    #[test]
    fn unreadable_upstream_frames_become_errors() {
        let tagged = tag_for_client(r#"{"type":"mystery"}"#);
        assert_eq!(tagged.response_type, "error");
        let v: Value = serde_json::from_str(&tagged.text).unwrap();
        assert_eq!(v["code"], "INTERNAL_ERROR");
    }
}
