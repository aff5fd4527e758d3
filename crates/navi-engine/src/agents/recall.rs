//! "Where was X" answers.
//!
//! Lookup order: an exact persisted label (answered locally), then substring
//! and proximity matches from the store plus matching context entries. Only
//! when facts were found is the backend asked to phrase an answer.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use navi_core::errors::AgentError;
use navi_core::events::InboundEvent;
use navi_core::reasoning::Turn;
use navi_core::results::{LandmarkRef, RecallAnswer, RecallSource, RoleOutput};
use navi_core::roles::AgentRole;
use navi_store::landmarks::LandmarkRecord;

use super::parse::{decode, loose_f64};
use super::{converse, Agent, AgentContext, AgentReport};

static RECALL_QUERY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bwhere\s+(?:was|were|did)\b|\bwhere(?:'s|\s+is)\s+the\s+.+\s+i\b").unwrap()
});

static RECALL_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\bwhere(?:'s|\s+(?:was|were|did|is))\s+(?:(?:i|we)\s+(?:see|saw|pass|passed|leave|left|put|find|found)\s+)?(?:(?:the|my|a|an|that)\s+)?(?P<label>.+?)(?:\s+(?:i|we)\s+\w+.*?)?\s*[?.!]*$",
    )
    .unwrap()
});

const INSTRUCTION: &str = "You help a blind pedestrian remember where things were. Answer only \
from the facts you are given. Reply with one JSON object only.";

/// Whether free text asks where something was.
pub fn is_recall_query(text: &str) -> bool {
    RECALL_QUERY.is_match(text)
}

/// The thing being asked about, lowercased. Falls back to the whole text.
pub fn recall_label(text: &str) -> String {
    let label = RECALL_LABEL
        .captures(text.trim())
        .and_then(|c| c.name("label"))
        .map(|m| m.as_str())
        .unwrap_or(text);
    label
        .trim_matches(|c: char| c.is_ascii_punctuation() || c.is_whitespace())
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Deserialize)]
struct RawRecall {
    #[serde(default, alias = "answer", alias = "response")]
    voice_response: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default, alias = "bearing")]
    direction: Option<String>,
    #[serde(default, deserialize_with = "loose_f64")]
    distance_feet: Option<f64>,
}

pub struct RecallAgent {
    limit: u32,
    radius_m: f64,
}

impl RecallAgent {
    pub fn new(limit: u32, radius_m: f64) -> Self {
        Self { limit, radius_m }
    }

    async fn gather(&self, label: &str, ctx: &AgentContext) -> Vec<LandmarkRecord> {
        let store = ctx.tools.store();
        let mut found = match store.search_landmarks(&ctx.session_id, label, self.limit).await {
            Ok(found) => found,
            Err(e) => {
                warn!(session_id = %ctx.session_id, error = %e, "landmark search failed");
                Vec::new()
            }
        };
        if let Some((lat, lon)) = ctx.position {
            match store
                .landmarks_near(&ctx.session_id, lat, lon, self.radius_m, self.limit as usize)
                .await
            {
                Ok(near) => {
                    for record in near {
                        if !found.iter().any(|f| f.id == record.id) {
                            found.push(record);
                        }
                    }
                }
                Err(e) => warn!(session_id = %ctx.session_id, error = %e, "proximity search failed"),
            }
        }
        found
    }
}

fn describe(label: &str, direction: Option<&str>, distance_feet: Option<f64>) -> String {
    let mut answer = format!("The {label} was");
    match direction.filter(|d| !d.is_empty()) {
        Some(dir) => answer.push_str(&format!(" {dir}")),
        None => answer.push_str(" nearby"),
    }
    if let Some(d) = distance_feet {
        answer.push_str(&format!(", about {} feet away", d.round()));
    }
    answer.push('.');
    answer
}

#[async_trait]
impl Agent for RecallAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Recall
    }

    fn instruction(&self) -> &'static str {
        INSTRUCTION
    }

    async fn handle_event(&self, event: &InboundEvent, ctx: &AgentContext) -> Result<AgentReport, AgentError> {
        let query = event
            .query_text()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AgentError::MissingInput("query text"))?;
        let label = recall_label(query);

        match ctx.tools.store().find_landmark(&ctx.session_id, &label).await {
            Ok(Some(record)) => {
                return Ok(AgentReport {
                    output: RoleOutput::Recall(RecallAnswer {
                        query: query.to_string(),
                        answer: describe(&record.label, record.direction.as_deref(), record.distance_feet),
                        source: RecallSource::StoreExact,
                        landmarks: vec![record.to_ref()],
                    }),
                    entries: Vec::new(),
                });
            }
            Ok(None) => {}
            Err(e) => warn!(session_id = %ctx.session_id, error = %e, "landmark lookup failed"),
        }

        let records = self.gather(&label, ctx).await;
        let mentions: Vec<String> = ctx.view.mentioning(&label).iter().map(|e| e.render()).collect();
        let landmarks: Vec<LandmarkRef> = records.iter().map(LandmarkRecord::to_ref).collect();

        if landmarks.is_empty() && mentions.is_empty() {
            return Ok(AgentReport {
                output: RoleOutput::Recall(RecallAnswer {
                    query: query.to_string(),
                    answer: format!("I haven't seen the {label} yet."),
                    source: RecallSource::NotFound,
                    landmarks,
                }),
                entries: Vec::new(),
            });
        }

        let handle = ctx.handle(AgentRole::Recall)?;
        let facts = serde_json::to_string(&landmarks).unwrap_or_else(|_| "[]".into());
        let prompt = format!(
            "User asked: {query}\nStored landmarks: {facts}\nSession notes:\n{}\n\n\
             OUTPUT JSON:\n{{\"found\": true, \"label\": \"...\", \"description\": \"...\", \
             \"direction\": \"...\", \"distance_feet\": 0, \"voice_response\": \"...\"}}",
            if mentions.is_empty() { "(none)".to_string() } else { mentions.join("\n") },
        );

        let mut entries = Vec::new();
        let text = converse(handle.as_ref(), Turn::text(prompt), ctx, &mut entries).await?;
        let raw = decode::<RawRecall>(&text).into_result()?;
        let answer = raw
            .voice_response
            .filter(|v| !v.trim().is_empty())
            .or(raw.description.filter(|d| !d.trim().is_empty()))
            .unwrap_or_else(|| describe(&label, raw.direction.as_deref(), raw.distance_feet));

        Ok(AgentReport {
            output: RoleOutput::Recall(RecallAnswer {
                query: query.to_string(),
                answer,
                source: RecallSource::Synthesized,
                landmarks,
            }),
            entries,
        })
    }
}
