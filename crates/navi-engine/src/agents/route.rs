//! Route guidance toward a spoken or typed destination.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;

use navi_core::errors::AgentError;
use navi_core::events::InboundEvent;
use navi_core::reasoning::Turn;
use navi_core::results::{RoleOutput, RouteStep};
use navi_core::roles::AgentRole;

use super::parse::{decode, loose_f64};
use super::{converse, with_context, Agent, AgentContext, AgentReport};
use crate::context::NewEntry;

const DEFAULT_CONFIDENCE: f64 = 0.8;

const INSTRUCTION: &str = "You guide a blind pedestrian step by step toward a destination, \
keeping continuity with the steps you already gave. Reply with one JSON object only.";

const FORMAT: &str = r#"Provide the next routing step. FORMAT:
{
  "next_direction": "forward-left",
  "distance_feet": 12,
  "next_milestone": "passing through doorway",
  "turns_remaining": 2,
  "estimated_time_sec": 45,
  "confidence": 0.85
}"#;

#[derive(Debug, Deserialize)]
struct RawRoute {
    #[serde(default, alias = "direction")]
    next_direction: Option<String>,
    #[serde(default, deserialize_with = "loose_f64")]
    distance_feet: Option<f64>,
    #[serde(default, alias = "milestone", alias = "instruction")]
    next_milestone: Option<String>,
    #[serde(default, deserialize_with = "loose_f64")]
    turns_remaining: Option<f64>,
    #[serde(default, alias = "eta_secs", deserialize_with = "loose_f64")]
    estimated_time_sec: Option<f64>,
    #[serde(default, deserialize_with = "loose_f64")]
    confidence: Option<f64>,
}

pub struct RouteAgent {
    history: Mutex<VecDeque<RouteStep>>,
    capacity: usize,
}

impl RouteAgent {
    pub fn new(capacity: usize) -> Self {
        Self {
            history: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    /// Steps given so far, oldest first.
    pub fn history(&self) -> Vec<RouteStep> {
        self.history.lock().iter().cloned().collect()
    }

    fn remember(&self, step: RouteStep) {
        let mut history = self.history.lock();
        if history.len() == self.capacity {
            history.pop_front();
        }
        history.push_back(step);
    }

    fn journey(&self) -> String {
        let history = self.history.lock();
        if history.is_empty() {
            return "(none)".into();
        }
        history
            .iter()
            .enumerate()
            .map(|(i, s)| format!("[{i}] to {}: {} - {}", s.destination, s.bearing, s.milestone))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
impl Agent for RouteAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Route
    }

    fn instruction(&self) -> &'static str {
        INSTRUCTION
    }

    async fn handle_event(&self, event: &InboundEvent, ctx: &AgentContext) -> Result<AgentReport, AgentError> {
        let destination = event
            .query_text()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AgentError::MissingInput("destination"))?
            .to_string();
        let handle = ctx.handle(AgentRole::Route)?;

        let scene = match event {
            InboundEvent::TextQuery(q) => q.current_scene.as_ref().map(|s| s.to_string()),
            _ => None,
        };
        let prompt = format!(
            "User destination: {destination}\nCurrent scene: {}\nJourney so far:\n{}\n\n{FORMAT}",
            scene.as_deref().unwrap_or("{}"),
            self.journey(),
        );

        let mut entries = Vec::new();
        let text = converse(handle.as_ref(), Turn::text(with_context(prompt, &ctx.view)), ctx, &mut entries).await?;
        let raw = decode::<RawRoute>(&text).into_result()?;
        if raw.next_direction.is_none() && raw.next_milestone.is_none() {
            return Err(AgentError::Unparseable("route reply has no direction or milestone".into()));
        }

        let step = RouteStep {
            destination,
            bearing: raw.next_direction.unwrap_or_default(),
            distance_feet: raw.distance_feet,
            milestone: raw.next_milestone.unwrap_or_default(),
            turns_remaining: raw.turns_remaining.filter(|t| *t >= 0.0).map(|t| t.round() as u32),
            eta_secs: raw.estimated_time_sec,
            confidence: raw.confidence.unwrap_or(DEFAULT_CONFIDENCE).clamp(0.0, 1.0),
        };
        self.remember(step.clone());

        let mut line = format!("ROUTE to {}: {}", step.destination, step.bearing);
        if let Some(d) = step.distance_feet {
            line.push_str(&format!(" ~{d}ft"));
        }
        if !step.milestone.is_empty() {
            line.push_str(&format!(", {}", step.milestone));
        }
        entries.push(NewEntry::instruction(line));

        Ok(AgentReport {
            output: RoleOutput::Route(step),
            entries,
        })
    }
}
