use serde::{Deserialize, Serialize};

/// A typed event sent by the client device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    VideoFrame(VideoFrame),
    AudioChunk(AudioChunk),
    TextQuery(TextQuery),
    VoiceCommand(VoiceCommand),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VideoFrame {
    /// Base64-encoded JPEG.
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AudioChunk {
    /// Base64-encoded audio.
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    /// Optional frame captured alongside the audio.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TextQuery {
    #[serde(alias = "destination")]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_scene: Option<serde_json::Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoiceCommand {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
}

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    VideoFrame,
    AudioChunk,
    TextQuery,
    VoiceCommand,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::VideoFrame,
        EventKind::AudioChunk,
        EventKind::TextQuery,
        EventKind::VoiceCommand,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VideoFrame => "video_frame",
            Self::AudioChunk => "audio_chunk",
            Self::TextQuery => "text_query",
            Self::VoiceCommand => "voice_command",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

/// Why a client payload could not be turned into an [`InboundEvent`].
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is not a JSON object: {0}")]
    NotJson(String),
    #[error("missing \"type\" field")]
    MissingType,
    #[error("unknown event type: {0}")]
    UnknownType(String),
    #[error("invalid {kind} event: {reason}")]
    InvalidFields { kind: &'static str, reason: String },
}

impl InboundEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::VideoFrame(_) => EventKind::VideoFrame,
            Self::AudioChunk(_) => EventKind::AudioChunk,
            Self::TextQuery(_) => EventKind::TextQuery,
            Self::VoiceCommand(_) => EventKind::VoiceCommand,
        }
    }

    pub fn timestamp(&self) -> Option<f64> {
        match self {
            Self::VideoFrame(e) => e.timestamp,
            Self::AudioChunk(e) => e.timestamp,
            Self::TextQuery(e) => e.timestamp,
            Self::VoiceCommand(e) => e.timestamp,
        }
    }

    /// Free text of a query-style event.
    pub fn query_text(&self) -> Option<&str> {
        match self {
            Self::TextQuery(q) => Some(q.text.as_str()),
            Self::VoiceCommand(v) => Some(v.text.as_str()),
            _ => None,
        }
    }

    /// Decode a client payload, separating unknown event types from
    /// structurally broken ones.
    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| DecodeError::NotJson(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, DecodeError> {
        if !value.is_object() {
            return Err(DecodeError::NotJson("expected an object".into()));
        }
        let kind = match value.get("type") {
            Some(serde_json::Value::String(t)) => {
                EventKind::parse(t).ok_or_else(|| DecodeError::UnknownType(t.clone()))?
            }
            _ => return Err(DecodeError::MissingType),
        };
        serde_json::from_value(value).map_err(|e| DecodeError::InvalidFields {
            kind: kind.as_str(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_video_frame() {
        let ev = InboundEvent::decode(r#"{"type":"video_frame","data":"AAA","timestamp":12.5}"#).unwrap();
        assert_eq!(ev.kind(), EventKind::VideoFrame);
        assert_eq!(ev.timestamp(), Some(12.5));
    }

    #[test]
    fn timestamp_is_optional() {
        let ev = InboundEvent::decode(r#"{"type":"audio_chunk","data":"AAA"}"#).unwrap();
        assert_eq!(ev.timestamp(), None);
    }

    #[test]
    fn destination_alias_for_text_query() {
        let ev = InboundEvent::decode(r#"{"type":"text_query","destination":"room 204"}"#).unwrap();
        assert_eq!(ev.query_text(), Some("room 204"));
    }

    #[test]
    fn unknown_type_is_distinguished() {
        let err = InboundEvent::decode(r#"{"type":"telemetry","data":1}"#).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownType(t) if t == "telemetry"));
    }

    #[test]
    fn missing_fields_are_invalid() {
        let err = InboundEvent::decode(r#"{"type":"video_frame"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidFields { kind: "video_frame", .. }));
    }

    #[test]
    fn garbage_is_not_json() {
        assert!(matches!(InboundEvent::decode("{oops"), Err(DecodeError::NotJson(_))));
        assert!(matches!(InboundEvent::decode("[1,2]"), Err(DecodeError::NotJson(_))));
        assert!(matches!(InboundEvent::decode(r#"{"data":"x"}"#), Err(DecodeError::MissingType)));
    }

    #[test]
    fn serializes_with_type_tag() {
        let ev = InboundEvent::VoiceCommand(VoiceCommand {
            text: "where was the door".into(),
            timestamp: Some(1.0),
        });
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v, json!({"type": "voice_command", "text": "where was the door", "timestamp": 1.0}));
    }
}
