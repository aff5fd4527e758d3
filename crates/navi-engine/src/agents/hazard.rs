//! Hazard prediction.
//!
//! Keeps a rolling history of recent detections so that a hazard seen again
//! at a shorter distance gets an approach speed and lead time. A lead time
//! under [`CRITICAL_LEAD_SECS`] escalates the hazard to critical.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;

use navi_core::errors::AgentError;
use navi_core::events::InboundEvent;
use navi_core::reasoning::Turn;
use navi_core::results::{Approach, Hazard, HazardReport, RoleOutput, Urgency};
use navi_core::roles::AgentRole;

use super::parse::{decode, loose_bool, loose_f64};
use super::{converse, with_context, Agent, AgentContext, AgentReport};
use crate::context::NewEntry;
use crate::tools::hazard_text;

pub const CRITICAL_LEAD_SECS: f64 = 2.0;

const INSTRUCTION: &str = "You watch for immediate threats to a blind pedestrian within the next few \
seconds of walking. Use the camera frame and any ambient audio. Reply with one JSON object only.";

const PROMPT: &str = r#"Identify IMMEDIATE THREATS (next 5 feet) and hazards further ahead.
OUTPUT JSON:
{
  "imminent_hazards": [{"type": "person-approaching", "direction": "left", "distance_feet": 4, "urgency": "critical"}],
  "predicted_hazards": [{"type": "stairs", "direction": "ahead", "distance_feet": 8, "warning_lead_time_sec": 3}],
  "safe_status": true,
  "recommended_action": "Continue forward, be alert to left"
}"#;

/// Hazard as reported by the model, shared with the scene agent's floor hazards.
#[derive(Debug, Deserialize)]
pub(crate) struct RawHazard {
    #[serde(default, rename = "type", alias = "name", alias = "hazard_type")]
    kind: Option<String>,
    #[serde(default, alias = "location", alias = "bearing")]
    direction: Option<String>,
    #[serde(default, deserialize_with = "loose_f64")]
    distance_feet: Option<f64>,
    #[serde(default)]
    urgency: Option<String>,
}

impl RawHazard {
    pub(crate) fn into_hazard(self, default_kind: &str, default_urgency: Urgency) -> Hazard {
        Hazard {
            kind: self
                .kind
                .filter(|k| !k.is_empty())
                .unwrap_or_else(|| default_kind.to_string()),
            bearing: self.direction.filter(|d| !d.is_empty()),
            distance_feet: self.distance_feet,
            urgency: self
                .urgency
                .as_deref()
                .map(Urgency::parse_loose)
                .unwrap_or(default_urgency),
            approach: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawHazardReply {
    #[serde(default, alias = "hazards")]
    imminent_hazards: Option<Vec<RawHazard>>,
    #[serde(default)]
    predicted_hazards: Option<Vec<RawHazard>>,
    #[serde(default, alias = "safe", deserialize_with = "loose_bool")]
    safe_status: Option<bool>,
    #[serde(default)]
    recommended_action: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
struct Detection {
    kind: String,
    bearing: Option<String>,
    distance_feet: f64,
    at_secs: f64,
}

pub struct HazardAgent {
    history: Mutex<VecDeque<Detection>>,
    capacity: usize,
    window_secs: f64,
}

impl HazardAgent {
    pub fn new(capacity: usize, window_secs: f64) -> Self {
        Self {
            history: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            window_secs,
        }
    }

    /// Attach approach estimates against prior detections, then remember
    /// these detections.
    fn track(&self, hazards: &mut [Hazard], at_secs: f64) {
        let mut history = self.history.lock();
        for hazard in hazards.iter_mut() {
            let Some(distance) = hazard.distance_feet else {
                continue;
            };
            let prior = history.iter().rev().find(|d| {
                d.kind.eq_ignore_ascii_case(&hazard.kind)
                    && d.bearing == hazard.bearing
                    && at_secs > d.at_secs
                    && at_secs - d.at_secs <= self.window_secs
            });
            if let Some(prior) = prior {
                let dt = at_secs - prior.at_secs;
                let speed = (prior.distance_feet - distance) / dt;
                if speed > 0.0 {
                    let lead = distance / speed;
                    hazard.approach = Some(Approach {
                        speed_fps: round2(speed),
                        lead_time_secs: round2(lead),
                    });
                    if lead < CRITICAL_LEAD_SECS {
                        hazard.urgency = Urgency::Critical;
                    }
                }
            }
        }
        for hazard in hazards.iter() {
            if let Some(distance) = hazard.distance_feet {
                if history.len() == self.capacity {
                    history.pop_front();
                }
                history.push_back(Detection {
                    kind: hazard.kind.clone(),
                    bearing: hazard.bearing.clone(),
                    distance_feet: distance,
                    at_secs,
                });
            }
        }
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().len()
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Event time in seconds. Client clocks send seconds; millisecond stamps are
/// scaled down.
fn event_secs(event: &InboundEvent) -> f64 {
    match event.timestamp() {
        Some(ts) if ts > 1e11 => ts / 1000.0,
        Some(ts) => ts,
        None => SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default(),
    }
}

#[async_trait]
impl Agent for HazardAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Hazard
    }

    fn instruction(&self) -> &'static str {
        INSTRUCTION
    }

    async fn handle_event(&self, event: &InboundEvent, ctx: &AgentContext) -> Result<AgentReport, AgentError> {
        let handle = ctx.handle(AgentRole::Hazard)?;
        let prompt = with_context(PROMPT.to_string(), &ctx.view);
        let turn = match event {
            InboundEvent::VideoFrame(frame) => Turn::text(prompt).with_image(
                frame.mime.as_deref().unwrap_or("image/jpeg"),
                frame.data.as_str(),
            ),
            InboundEvent::AudioChunk(chunk) => {
                let mut turn = Turn::text(prompt).with_audio(
                    chunk.mime.as_deref().unwrap_or("audio/pcm"),
                    chunk.data.as_str(),
                );
                if let Some(image) = chunk.image.as_deref().filter(|i| !i.is_empty()) {
                    turn = turn.with_image("image/jpeg", image);
                }
                turn
            }
            _ => return Err(AgentError::MissingInput("frame or audio")),
        };

        let mut entries = Vec::new();
        let text = converse(handle.as_ref(), turn, ctx, &mut entries).await?;
        let raw = decode::<RawHazardReply>(&text).into_result()?;
        if raw.imminent_hazards.is_none() && raw.predicted_hazards.is_none() && raw.safe_status.is_none() {
            return Err(AgentError::Unparseable("hazard reply has no hazard fields".into()));
        }

        let mut hazards: Vec<Hazard> = raw
            .imminent_hazards
            .unwrap_or_default()
            .into_iter()
            .map(|h| h.into_hazard("obstacle", Urgency::High))
            .chain(
                raw.predicted_hazards
                    .unwrap_or_default()
                    .into_iter()
                    .map(|h| h.into_hazard("obstacle", Urgency::Medium)),
            )
            .collect();
        self.track(&mut hazards, event_secs(event));

        let urgent = hazards.iter().any(|h| h.urgency >= Urgency::High);
        let report = HazardReport {
            safe: raw.safe_status.unwrap_or(!urgent) && !urgent,
            recommended_action: raw.recommended_action.filter(|a| !a.is_empty()),
            hazards,
        };
        entries.extend(report.hazards.iter().map(|h| NewEntry::hazard(hazard_text(h))));

        Ok(AgentReport {
            output: RoleOutput::Hazard(report),
            entries,
        })
    }
}
