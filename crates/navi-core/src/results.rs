use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::AgentError;
use crate::ids::SessionId;
use crate::roles::AgentRole;

pub const SAFE_FALLBACK_INSTRUCTION: &str = "Stop and wait";
pub const SAFE_FALLBACK_REASON: &str = "System error detected";

#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Case-insensitive parse of model-reported urgency words.
    pub fn parse_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" | "minor" | "none" => Self::Low,
            "high" | "urgent" | "severe" => Self::High,
            "critical" | "imminent" | "emergency" => Self::Critical,
            _ => Self::Medium,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Obstacle {
    pub label: String,
    pub bearing: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_feet: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<String>,
    #[serde(default)]
    pub urgency: Urgency,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClearPath {
    pub bearing: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_feet: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SceneReport {
    #[serde(default)]
    pub obstacles: Vec<Obstacle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clear_path: Option<ClearPath>,
    #[serde(default)]
    pub floor_hazards: Vec<Hazard>,
    #[serde(default)]
    pub spatial_features: Vec<String>,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Estimated closing motion of a hazard, from successive detections.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Approach {
    pub speed_fps: f64,
    pub lead_time_secs: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Hazard {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearing: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_feet: Option<f64>,
    #[serde(default)]
    pub urgency: Urgency,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approach: Option<Approach>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HazardReport {
    #[serde(default)]
    pub hazards: Vec<Hazard>,
    pub safe: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommended_action: Option<String>,
}

impl HazardReport {
    pub fn max_urgency(&self) -> Option<Urgency> {
        self.hazards.iter().map(|h| h.urgency).max()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteStep {
    pub destination: String,
    pub bearing: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_feet: Option<f64>,
    pub milestone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turns_remaining: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<f64>,
    pub confidence: f64,
}

/// Rendering parameters for spatial audio cues.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AudioParams {
    /// -1.0 (hard left) to 1.0 (hard right).
    pub pan: f32,
    /// 0.0 to 1.0.
    pub volume: f32,
    pub tone_hz: u32,
    pub cadence_bpm: u32,
    pub voice_instruction: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecallSource {
    /// Answered from an exact persisted label match.
    StoreExact,
    /// Answered by the backend from retrieved facts.
    Synthesized,
    NotFound,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LandmarkRef {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearing: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_feet: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecallAnswer {
    pub query: String,
    pub answer: String,
    pub source: RecallSource,
    #[serde(default)]
    pub landmarks: Vec<LandmarkRef>,
}

/// Typed output of one role.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum RoleOutput {
    Scene(SceneReport),
    Hazard(HazardReport),
    Route(RouteStep),
    Audio(AudioParams),
    Recall(RecallAnswer),
}

impl RoleOutput {
    pub fn role(&self) -> AgentRole {
        match self {
            Self::Scene(_) => AgentRole::Scene,
            Self::Hazard(_) => AgentRole::Hazard,
            Self::Route(_) => AgentRole::Route,
            Self::Audio(_) => AgentRole::Audio,
            Self::Recall(_) => AgentRole::Recall,
        }
    }

    pub fn direction(&self) -> Option<&str> {
        match self {
            Self::Scene(s) => s.clear_path.as_ref().map(|p| p.bearing.as_str()),
            Self::Route(r) if !r.bearing.is_empty() => Some(r.bearing.as_str()),
            _ => None,
        }
    }

    pub fn distance_feet(&self) -> Option<f64> {
        match self {
            Self::Scene(s) => s.clear_path.as_ref().and_then(|p| p.distance_feet),
            Self::Route(r) => r.distance_feet,
            _ => None,
        }
    }

    pub fn summary(&self) -> Option<&str> {
        match self {
            Self::Scene(s) => s.summary.as_deref(),
            Self::Route(r) if !r.milestone.is_empty() => Some(r.milestone.as_str()),
            Self::Recall(r) => Some(r.answer.as_str()),
            _ => None,
        }
    }

    pub fn instruction(&self) -> Option<&str> {
        match self {
            Self::Hazard(h) => h.recommended_action.as_deref(),
            Self::Route(r) if !r.milestone.is_empty() => Some(r.milestone.as_str()),
            Self::Audio(a) if !a.voice_instruction.is_empty() => Some(a.voice_instruction.as_str()),
            _ => None,
        }
    }

    pub fn confidence(&self) -> Option<f64> {
        match self {
            Self::Scene(s) => Some(s.confidence),
            Self::Route(r) => Some(r.confidence),
            _ => None,
        }
    }

    pub fn hazards(&self) -> &[Hazard] {
        match self {
            Self::Hazard(h) => &h.hazards,
            Self::Scene(s) => &s.floor_hazards,
            _ => &[],
        }
    }
}

/// Outcome of one agent invocation within a dispatch.
#[derive(Clone, Debug)]
pub struct AgentResult {
    pub role: AgentRole,
    pub output: Option<RoleOutput>,
    pub produced_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl AgentResult {
    pub fn success(output: RoleOutput) -> Self {
        Self {
            role: output.role(),
            output: Some(output),
            produced_at: Utc::now(),
            error: None,
        }
    }

    pub fn failed(role: AgentRole, error: &AgentError) -> Self {
        Self {
            role,
            output: None,
            produced_at: Utc::now(),
            error: Some(error.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.output.is_some() && self.error.is_none()
    }
}

/// Role-namespaced payloads of a merged response.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleOutputs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene: Option<SceneReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hazard: Option<HazardReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<RouteStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recall: Option<RecallAnswer>,
}

impl RoleOutputs {
    pub fn insert(&mut self, output: RoleOutput) {
        match output {
            RoleOutput::Scene(s) => self.scene = Some(s),
            RoleOutput::Hazard(h) => self.hazard = Some(h),
            RoleOutput::Route(r) => self.route = Some(r),
            RoleOutput::Audio(a) => self.audio = Some(a),
            RoleOutput::Recall(r) => self.recall = Some(r),
        }
    }

    pub fn contains(&self, role: AgentRole) -> bool {
        match role {
            AgentRole::Scene => self.scene.is_some(),
            AgentRole::Hazard => self.hazard.is_some(),
            AgentRole::Route => self.route.is_some(),
            AgentRole::Audio => self.audio.is_some(),
            AgentRole::Recall => self.recall.is_some(),
        }
    }

    pub fn populated(&self) -> usize {
        AgentRole::ALL.iter().filter(|r| self.contains(**r)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.populated() == 0
    }
}

/// Response type tag delivered to the client.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    NavigationUpdate,
    HazardUpdate,
    RouteGuidance,
    RecallAnswer,
    SafeFallback,
    FrameSuperseded,
}

impl ResponseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NavigationUpdate => "navigation_update",
            Self::HazardUpdate => "hazard_update",
            Self::RouteGuidance => "route_guidance",
            Self::RecallAnswer => "recall_answer",
            Self::SafeFallback => "safe_fallback",
            Self::FrameSuperseded => "frame_superseded",
        }
    }
}

/// The aggregated output of one dispatch. Immutable once built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MergedResponse {
    pub kind: ResponseKind,
    pub session_id: SessionId,
    pub frame_seq: u64,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_feet: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hazards: Vec<Hazard>,
    #[serde(default, skip_serializing_if = "RoleOutputs::is_empty")]
    pub roles: RoleOutputs,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub omitted_roles: Vec<AgentRole>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backfilled: Vec<String>,
}

impl MergedResponse {
    pub fn empty(kind: ResponseKind, session_id: SessionId, frame_seq: u64) -> Self {
        Self {
            kind,
            session_id,
            frame_seq,
            latency_ms: 0,
            direction: None,
            distance_feet: None,
            summary: None,
            instruction: None,
            confidence: None,
            reason: None,
            hazards: Vec::new(),
            roles: RoleOutputs::default(),
            omitted_roles: Vec::new(),
            backfilled: Vec::new(),
        }
    }

    /// The fixed conservative response used when every selected agent failed.
    pub fn safe_fallback(session_id: SessionId, frame_seq: u64, latency_ms: u64) -> Self {
        Self {
            latency_ms,
            instruction: Some(SAFE_FALLBACK_INSTRUCTION.into()),
            reason: Some(SAFE_FALLBACK_REASON.into()),
            ..Self::empty(ResponseKind::SafeFallback, session_id, frame_seq)
        }
    }

    /// Answer for a video frame that a newer frame overtook while waiting.
    pub fn superseded(session_id: SessionId, frame_seq: u64, newer_seq: u64) -> Self {
        Self {
            reason: Some(format!("superseded by frame {newer_seq}")),
            ..Self::empty(ResponseKind::FrameSuperseded, session_id, frame_seq)
        }
    }

    pub fn is_safe_fallback(&self) -> bool {
        self.kind == ResponseKind::SafeFallback
    }

    /// Response body without per-dispatch metadata.
    pub fn payload(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(obj) = value.as_object_mut() {
            obj.remove("session_id");
            obj.remove("frame_seq");
            obj.remove("latency_ms");
        }
        value
    }
}

/// The fixed safe fallback body, for comparisons.
pub fn safe_fallback_payload() -> serde_json::Value {
    serde_json::json!({
        "kind": "safe_fallback",
        "instruction": SAFE_FALLBACK_INSTRUCTION,
        "reason": SAFE_FALLBACK_REASON,
    })
}

/// Fields retained from the most recent successful dispatch, used to fill
/// gaps left by failed agents.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LastKnownGood {
    pub direction: Option<String>,
    pub distance_feet: Option<f64>,
    pub summary: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl LastKnownGood {
    /// Fold a successful response in; absent fields keep their previous value.
    pub fn absorb(&mut self, response: &MergedResponse) {
        if let Some(d) = &response.direction {
            self.direction = Some(d.clone());
        }
        if let Some(d) = response.distance_feet {
            self.distance_feet = Some(d);
        }
        if let Some(s) = &response.summary {
            self.summary = Some(s.clone());
        }
        self.updated_at = Some(Utc::now());
    }
}

/// A hazard pushed to the client outside the request/response cycle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HazardAlert {
    pub session_id: SessionId,
    pub hazard: Hazard,
    pub source: String,
    pub at: DateTime<Utc>,
}
