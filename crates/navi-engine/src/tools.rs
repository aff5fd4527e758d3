//! Backend function calls and the side effects behind them.
//!
//! Write tools (`record_landmark`, `report_hazard`, `update_route`) hand their
//! store write to the [`PersistWriter`] and acknowledge at once. The read tool
//! `recall_landmark` awaits a store query. A failed side effect is logged and
//! still reported to the backend as completed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use navi_core::ids::SessionId;
use navi_core::results::{Hazard, HazardAlert, Urgency};
use navi_core::roles::AgentRole;
use navi_core::tools::{ToolCall, ToolDefinition, ToolResult};
use navi_store::landmarks::NewLandmark;
use navi_store::NavigationStore;

use crate::agents::parse::loose_f64;
use crate::bus::HazardBus;
use crate::context::NewEntry;
use crate::persist::PersistWriter;

pub const RECORD_LANDMARK: &str = "record_landmark";
pub const REPORT_HAZARD: &str = "report_hazard";
pub const UPDATE_ROUTE: &str = "update_route";
pub const RECALL_LANDMARK: &str = "recall_landmark";

/// Per-session totals written when the session ends.
#[derive(Debug, Default)]
pub struct SessionCounters {
    pub frames: AtomicU64,
    pub hazards: AtomicU64,
    pub landmarks: AtomicU64,
}

impl SessionCounters {
    pub fn totals(&self) -> navi_store::sessions::SessionTotals {
        navi_store::sessions::SessionTotals {
            frames: self.frames.load(Ordering::Relaxed),
            hazards: self.hazards.load(Ordering::Relaxed),
        }
    }
}

pub fn definition(name: &str) -> Option<ToolDefinition> {
    let (description, schema) = match name {
        RECORD_LANDMARK => (
            "Remember a landmark the user passed so it can be recalled later",
            json!({
                "type": "object",
                "required": ["label"],
                "properties": {
                    "label": {"type": "string", "description": "Short name, e.g. 'water fountain'"},
                    "description": {"type": "string"},
                    "direction": {"type": "string", "description": "Bearing relative to the user"},
                    "distance_feet": {"type": "number"}
                }
            }),
        ),
        REPORT_HAZARD => (
            "Report a hazard that the user must hear about immediately",
            json!({
                "type": "object",
                "required": ["hazard_type", "urgency"],
                "properties": {
                    "hazard_type": {"type": "string"},
                    "urgency": {"type": "string", "enum": ["low", "medium", "high", "critical"]},
                    "direction": {"type": "string"},
                    "distance_feet": {"type": "number"},
                    "recommended_action": {"type": "string"}
                }
            }),
        ),
        UPDATE_ROUTE => (
            "Record the next routing step",
            json!({
                "type": "object",
                "required": ["next_direction", "instruction"],
                "properties": {
                    "next_direction": {"type": "string"},
                    "distance_feet": {"type": "number"},
                    "instruction": {"type": "string"}
                }
            }),
        ),
        RECALL_LANDMARK => (
            "Look up landmarks seen earlier in this session",
            json!({
                "type": "object",
                "required": ["query"],
                "properties": {
                    "query": {"type": "string", "description": "Landmark name or part of it"}
                }
            }),
        ),
        _ => return None,
    };
    Some(ToolDefinition {
        name: name.to_string(),
        description: description.to_string(),
        parameters_schema: schema,
    })
}

/// Tools declared when a role's reasoning session opens.
pub fn definitions_for(role: AgentRole) -> Vec<ToolDefinition> {
    let names: &[&str] = match role {
        AgentRole::Scene => &[RECORD_LANDMARK, REPORT_HAZARD],
        AgentRole::Hazard => &[REPORT_HAZARD],
        AgentRole::Route => &[UPDATE_ROUTE, RECORD_LANDMARK, RECALL_LANDMARK],
        AgentRole::Recall => &[RECALL_LANDMARK],
        AgentRole::Audio => &[],
    };
    names.iter().filter_map(|n| definition(n)).collect()
}

#[derive(Debug, Deserialize)]
struct RecordLandmarkArgs {
    label: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    direction: Option<String>,
    #[serde(default, deserialize_with = "loose_f64")]
    distance_feet: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ReportHazardArgs {
    hazard_type: String,
    #[serde(default)]
    urgency: Option<String>,
    #[serde(default)]
    direction: Option<String>,
    #[serde(default, deserialize_with = "loose_f64")]
    distance_feet: Option<f64>,
    #[serde(default)]
    recommended_action: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateRouteArgs {
    next_direction: String,
    #[serde(default, deserialize_with = "loose_f64")]
    distance_feet: Option<f64>,
    instruction: String,
}

#[derive(Debug, Deserialize)]
struct RecallLandmarkArgs {
    query: String,
}

/// What one tool call produced: the reply for the backend plus context
/// entries applied after the dispatch joins.
#[derive(Debug)]
pub struct ToolOutcome {
    pub result: ToolResult,
    pub entries: Vec<NewEntry>,
}

impl ToolOutcome {
    fn reply(result: ToolResult) -> Self {
        Self {
            result,
            entries: Vec::new(),
        }
    }
}

/// Executes tool calls for one session.
#[derive(Clone)]
pub struct ToolRunner {
    session_id: SessionId,
    store: Arc<dyn NavigationStore>,
    writer: PersistWriter,
    bus: HazardBus,
    counters: Arc<SessionCounters>,
    recall_limit: u32,
}

impl ToolRunner {
    pub fn new(
        session_id: SessionId,
        store: Arc<dyn NavigationStore>,
        writer: PersistWriter,
        bus: HazardBus,
        counters: Arc<SessionCounters>,
        recall_limit: u32,
    ) -> Self {
        Self {
            session_id,
            store,
            writer,
            bus,
            counters,
            recall_limit,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn store(&self) -> &Arc<dyn NavigationStore> {
        &self.store
    }

    pub fn recall_limit(&self) -> u32 {
        self.recall_limit
    }

    pub async fn execute(&self, call: &ToolCall, frame_seq: u64, position: Option<(f64, f64)>) -> ToolOutcome {
        debug!(session_id = %self.session_id, tool = %call.name, "executing tool call");
        match call.name.as_str() {
            RECORD_LANDMARK => match args::<RecordLandmarkArgs>(call) {
                Ok(a) => {
                    let entry = self.remember_landmark(NewLandmark {
                        label: a.label,
                        description: a.description,
                        direction: a.direction,
                        distance_feet: a.distance_feet,
                        frame_seq,
                        lat: position.map(|p| p.0),
                        lon: position.map(|p| p.1),
                    });
                    ToolOutcome {
                        result: ToolResult::acknowledged(call),
                        entries: entry.into_iter().collect(),
                    }
                }
                Err(result) => ToolOutcome::reply(result),
            },
            REPORT_HAZARD => match args::<ReportHazardArgs>(call) {
                Ok(a) => {
                    let hazard = Hazard {
                        kind: a.hazard_type,
                        bearing: a.direction,
                        distance_feet: a.distance_feet,
                        urgency: a.urgency.as_deref().map(Urgency::parse_loose).unwrap_or_default(),
                        approach: None,
                    };
                    let mut text = hazard_text(&hazard);
                    if let Some(action) = &a.recommended_action {
                        text.push_str(&format!(": {action}"));
                    }
                    self.record_hazard(&hazard);
                    self.publish_hazard(hazard, REPORT_HAZARD);
                    ToolOutcome {
                        result: ToolResult::acknowledged(call),
                        entries: vec![NewEntry::hazard(text)],
                    }
                }
                Err(result) => ToolOutcome::reply(result),
            },
            UPDATE_ROUTE => match args::<UpdateRouteArgs>(call) {
                Ok(a) => {
                    let mut text = format!("ROUTE: {} ({}", a.instruction, a.next_direction);
                    if let Some(d) = a.distance_feet {
                        text.push_str(&format!(", ~{d}ft"));
                    }
                    text.push(')');
                    ToolOutcome {
                        result: ToolResult::acknowledged(call),
                        entries: vec![NewEntry::instruction(text)],
                    }
                }
                Err(result) => ToolOutcome::reply(result),
            },
            RECALL_LANDMARK => match args::<RecallLandmarkArgs>(call) {
                Ok(a) => {
                    let landmarks = match self
                        .store
                        .search_landmarks(&self.session_id, &a.query, self.recall_limit)
                        .await
                    {
                        Ok(found) => found.iter().map(|l| l.to_ref()).collect(),
                        Err(e) => {
                            warn!(session_id = %self.session_id, error = %e, "landmark lookup failed");
                            Vec::new()
                        }
                    };
                    ToolOutcome::reply(ToolResult::with_content(
                        call,
                        json!({ "status": "completed", "landmarks": landmarks }),
                    ))
                }
                Err(result) => ToolOutcome::reply(result),
            },
            other => {
                warn!(session_id = %self.session_id, tool = other, "unknown tool requested");
                ToolOutcome::reply(ToolResult::rejected(call, format!("unknown tool: {other}")))
            }
        }
    }

    /// Persist a landmark in the background and return its pin-eligible
    /// context entry. Empty labels are dropped.
    pub fn remember_landmark(&self, landmark: NewLandmark) -> Option<NewEntry> {
        let label = landmark.label.trim().to_string();
        if label.is_empty() {
            return None;
        }
        let entry = NewEntry::landmark(&label, landmark_text(&landmark));
        self.counters.landmarks.fetch_add(1, Ordering::Relaxed);

        let store = Arc::clone(&self.store);
        let sid = self.session_id.clone();
        self.writer.spawn(RECORD_LANDMARK, async move {
            store.record_landmark(&sid, &landmark).await
        });
        Some(entry)
    }

    /// Persist a hazard event in the background.
    pub fn record_hazard(&self, hazard: &Hazard) {
        self.counters.hazards.fetch_add(1, Ordering::Relaxed);
        let store = Arc::clone(&self.store);
        let sid = self.session_id.clone();
        let hazard = hazard.clone();
        self.writer.spawn("save_hazard", async move {
            store.save_hazard(&sid, &hazard).await
        });
    }

    pub fn publish_hazard(&self, hazard: Hazard, source: &str) {
        self.bus.publish(HazardAlert {
            session_id: self.session_id.clone(),
            hazard,
            source: source.to_string(),
            at: Utc::now(),
        });
    }

    pub fn writer(&self) -> &PersistWriter {
        &self.writer
    }

    pub fn counters(&self) -> &Arc<SessionCounters> {
        &self.counters
    }
}

fn args<T: serde::de::DeserializeOwned>(call: &ToolCall) -> Result<T, ToolResult> {
    serde_json::from_value::<T>(call.arguments.clone()).map_err(|e| {
        warn!(tool = %call.name, error = %e, "invalid tool arguments");
        ToolResult::rejected(call, format!("invalid arguments: {e}"))
    })
}

pub fn landmark_text(landmark: &NewLandmark) -> Value {
    let mut text = format!("LANDMARK: {}", landmark.label.trim());
    if let Some(desc) = landmark.description.as_deref().filter(|d| !d.is_empty()) {
        text.push_str(&format!(" - {desc}"));
    }
    if let Some(dir) = landmark.direction.as_deref().filter(|d| !d.is_empty()) {
        text.push_str(&format!(" ({dir}"));
        if let Some(d) = landmark.distance_feet {
            text.push_str(&format!(", ~{d}ft"));
        }
        text.push(')');
    }
    Value::String(text)
}

pub fn hazard_text(hazard: &Hazard) -> String {
    let mut text = format!("HAZARD [{}]: {}", hazard.urgency.as_str(), hazard.kind);
    if let Some(bearing) = &hazard.bearing {
        text.push_str(&format!(" {bearing}"));
    }
    if let Some(d) = hazard.distance_feet {
        text.push_str(&format!(" ~{d}ft"));
    }
    text
}
