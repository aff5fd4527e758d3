use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use navi_core::errors::AgentError;
use navi_core::events::InboundEvent;
use navi_core::reasoning::Turn;
use navi_core::results::{ClearPath, Obstacle, RoleOutput, SceneReport, Urgency};
use navi_core::roles::AgentRole;
use navi_store::landmarks::NewLandmark;

use super::hazard::RawHazard;
use super::parse::{decode, loose_f64};
use super::{converse, with_context, Agent, AgentContext, AgentReport};
use crate::context::NewEntry;

const DEFAULT_CONFIDENCE: f64 = 0.85;

const INSTRUCTION: &str = "You describe camera frames for a blind pedestrian. \
Report obstacles with bearing and distance, the clearest walking path, floor hazards, \
and stable spatial features worth remembering. Reply with one JSON object only.";

const FRAME_PROMPT: &str = r#"Analyze this camera frame.
OUTPUT JSON:
{
  "obstacles": [{"name": "chair", "location": "left", "distance_feet": 3, "height": "ankle", "urgency": "medium"}],
  "clear_path": {"direction": "forward-right", "distance_feet": 10},
  "floor_hazards": [{"type": "cable", "location": "center", "urgency": "high"}],
  "spatial_features": ["door frame", "water fountain"],
  "confidence": 0.92,
  "summary": "Safe path 10ft forward with small obstacle to left"
}"#;

#[derive(Debug, Default, Deserialize)]
struct RawScene {
    #[serde(default)]
    obstacles: Option<Vec<RawObstacle>>,
    #[serde(default)]
    clear_path: Option<RawClearPath>,
    #[serde(default)]
    direction: Option<String>,
    #[serde(default, deserialize_with = "loose_f64")]
    distance_feet: Option<f64>,
    #[serde(default)]
    floor_hazards: Option<Vec<RawHazard>>,
    #[serde(default)]
    spatial_features: Option<Vec<Value>>,
    #[serde(default, alias = "confidence_0to1", deserialize_with = "loose_f64")]
    confidence: Option<f64>,
    #[serde(default, alias = "long_description")]
    summary: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawObstacle {
    #[serde(default, alias = "label", alias = "type")]
    name: Option<String>,
    #[serde(default, alias = "direction", alias = "bearing")]
    location: Option<String>,
    #[serde(default, deserialize_with = "loose_f64")]
    distance_feet: Option<f64>,
    #[serde(default)]
    height: Option<String>,
    #[serde(default)]
    urgency: Option<String>,
    #[serde(default, deserialize_with = "loose_f64")]
    confidence: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawClearPath {
    #[serde(default, alias = "bearing")]
    direction: Option<String>,
    #[serde(default, deserialize_with = "loose_f64")]
    distance_feet: Option<f64>,
}

impl RawScene {
    fn has_content(&self) -> bool {
        self.obstacles.is_some()
            || self.clear_path.is_some()
            || self.direction.is_some()
            || self.floor_hazards.is_some()
            || self.spatial_features.is_some()
            || self.summary.is_some()
    }

    fn into_report(self) -> (SceneReport, Vec<NewLandmark>) {
        let obstacles = self
            .obstacles
            .unwrap_or_default()
            .into_iter()
            .map(|o| Obstacle {
                label: o.name.unwrap_or_else(|| "obstacle".into()),
                bearing: o.location.unwrap_or_default(),
                distance_feet: o.distance_feet,
                height: o.height,
                urgency: o.urgency.as_deref().map(Urgency::parse_loose).unwrap_or_default(),
                confidence: o.confidence,
            })
            .collect();

        let clear_path = match self.clear_path {
            Some(RawClearPath {
                direction: Some(bearing),
                distance_feet,
            }) if !bearing.is_empty() => Some(ClearPath {
                bearing,
                distance_feet,
            }),
            _ => self.direction.filter(|d| !d.is_empty()).map(|bearing| ClearPath {
                bearing,
                distance_feet: self.distance_feet,
            }),
        };

        let floor_hazards = self
            .floor_hazards
            .unwrap_or_default()
            .into_iter()
            .map(|h| h.into_hazard("floor_hazard", Urgency::High))
            .collect();

        let landmarks: Vec<NewLandmark> = self
            .spatial_features
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter_map(feature_landmark)
            .collect();
        let spatial_features = landmarks.iter().map(|l| l.label.clone()).collect();

        let report = SceneReport {
            obstacles,
            clear_path,
            floor_hazards,
            spatial_features,
            confidence: self.confidence.unwrap_or(DEFAULT_CONFIDENCE).clamp(0.0, 1.0),
            summary: self.summary.filter(|s| !s.is_empty()),
        };
        (report, landmarks)
    }
}

/// Spatial features arrive either as bare labels or as objects.
fn feature_landmark(feature: &Value) -> Option<NewLandmark> {
    let landmark = match feature {
        Value::String(label) => NewLandmark {
            label: label.trim().to_string(),
            ..NewLandmark::default()
        },
        Value::Object(map) => {
            let text = |keys: &[&str]| {
                keys.iter()
                    .find_map(|k| map.get(*k).and_then(Value::as_str))
                    .map(str::to_string)
            };
            NewLandmark {
                label: text(&["label", "name"])?.trim().to_string(),
                description: text(&["description"]),
                direction: text(&["direction", "location"]),
                distance_feet: map.get("distance_feet").and_then(Value::as_f64),
                ..NewLandmark::default()
            }
        }
        _ => return None,
    };
    (!landmark.label.is_empty()).then_some(landmark)
}

pub struct SceneAgent;

impl SceneAgent {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SceneAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Agent for SceneAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Scene
    }

    fn instruction(&self) -> &'static str {
        INSTRUCTION
    }

    async fn handle_event(&self, event: &InboundEvent, ctx: &AgentContext) -> Result<AgentReport, AgentError> {
        let InboundEvent::VideoFrame(frame) = event else {
            return Err(AgentError::MissingInput("video frame"));
        };
        let handle = ctx.handle(AgentRole::Scene)?;
        let turn = Turn::text(with_context(FRAME_PROMPT.to_string(), &ctx.view)).with_image(
            frame.mime.as_deref().unwrap_or("image/jpeg"),
            frame.data.as_str(),
        );

        let mut entries = Vec::new();
        let text = converse(handle.as_ref(), turn, ctx, &mut entries).await?;
        let raw = decode::<RawScene>(&text).into_result()?;
        if !raw.has_content() {
            return Err(AgentError::Unparseable("scene reply has no scene fields".into()));
        }
        let (report, landmarks) = raw.into_report();

        for mut landmark in landmarks {
            landmark.frame_seq = ctx.frame_seq;
            landmark.lat = frame.lat;
            landmark.lon = frame.lon;
            entries.extend(ctx.tools.remember_landmark(landmark));
        }
        entries.push(NewEntry::observation(scene_text(&report)));

        Ok(AgentReport {
            output: RoleOutput::Scene(report),
            entries,
        })
    }
}

fn scene_text(report: &SceneReport) -> String {
    let mut text = String::from("SCENE:");
    if let Some(summary) = &report.summary {
        text.push_str(&format!(" {summary}."));
    }
    if let Some(path) = &report.clear_path {
        text.push_str(&format!(" Clear path {}", path.bearing));
        if let Some(d) = path.distance_feet {
            text.push_str(&format!(" ~{d}ft"));
        }
        text.push('.');
    }
    if !report.obstacles.is_empty() {
        let names: Vec<&str> = report.obstacles.iter().map(|o| o.label.as_str()).collect();
        text.push_str(&format!(" Obstacles: {}.", names.join(", ")));
    }
    text
}
