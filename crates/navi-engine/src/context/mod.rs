//! Per-session bounded history of observations.
//!
//! Entries carry an estimated token cost. After every append, the oldest
//! unpinned entries are evicted while the running total sits above
//! `prune_ratio * max_tokens`. Pinned entries (landmarks) are never evicted.
//! The store pins exactly what it is given; callers append repeat landmark
//! labels unpinned.

pub mod tokens;

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use navi_core::roles::ContextRole;
use navi_settings::ContextSettings;

pub use self::tokens::{estimate_text_tokens, TokenEstimator};

#[derive(Clone, Debug)]
pub struct ContextConfig {
    pub max_tokens: usize,
    pub prune_ratio: f64,
    pub chars_per_token: usize,
    pub window_tokens: usize,
    pub pinned_view_limit: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self::from(&ContextSettings::default())
    }
}

impl From<&ContextSettings> for ContextConfig {
    fn from(s: &ContextSettings) -> Self {
        Self {
            max_tokens: s.max_tokens,
            prune_ratio: s.prune_ratio.clamp(0.0, 1.0),
            chars_per_token: s.chars_per_token.max(1),
            window_tokens: s.window_tokens,
            pinned_view_limit: s.pinned_view_limit,
        }
    }
}

impl ContextConfig {
    pub fn prune_threshold(&self) -> usize {
        (self.max_tokens as f64 * self.prune_ratio) as usize
    }
}

/// A context entry proposed by an agent or tool, not yet costed.
#[derive(Clone, Debug, PartialEq)]
pub struct NewEntry {
    pub role: ContextRole,
    pub payload: Value,
    pub pinned: bool,
    /// Normalized landmark label.
    pub label: Option<String>,
}

impl NewEntry {
    pub fn observation(payload: impl Into<Value>) -> Self {
        Self {
            role: ContextRole::Observation,
            payload: payload.into(),
            pinned: false,
            label: None,
        }
    }

    pub fn hazard(payload: impl Into<Value>) -> Self {
        Self {
            role: ContextRole::Hazard,
            ..Self::observation(payload)
        }
    }

    pub fn instruction(payload: impl Into<Value>) -> Self {
        Self {
            role: ContextRole::Instruction,
            ..Self::observation(payload)
        }
    }

    /// Landmark entries are pin-eligible.
    pub fn landmark(label: &str, payload: impl Into<Value>) -> Self {
        Self {
            role: ContextRole::Landmark,
            payload: payload.into(),
            pinned: true,
            label: Some(normalize(label)),
        }
    }

    /// The same entry, kept as an ordinary evictable one.
    pub fn unpinned(self) -> Self {
        Self {
            pinned: false,
            ..self
        }
    }

    pub fn text(&self) -> String {
        payload_text(&self.payload)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ContextEntry {
    pub seq: u64,
    pub role: ContextRole,
    pub payload: Value,
    pub tokens: usize,
    pub pinned: bool,
    pub created_at: DateTime<Utc>,
}

impl ContextEntry {
    pub fn text(&self) -> String {
        payload_text(&self.payload)
    }

    pub fn render(&self) -> String {
        format!("[#{}] {}: {}", self.seq, self.role.as_str(), self.text())
    }
}

fn payload_text(payload: &Value) -> String {
    match payload {
        Value::String(s) => s.clone(),
        Value::Object(map) => match map.get("text").and_then(Value::as_str) {
            Some(text) => text.to_string(),
            None => payload.to_string(),
        },
        other => other.to_string(),
    }
}

fn normalize(label: &str) -> String {
    label.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ContextStats {
    pub total_tokens: usize,
    pub max_tokens: usize,
    pub utilisation_pct: f64,
    pub entry_count: usize,
    pub pinned_count: usize,
    pub evicted_count: u64,
    pub next_seq: u64,
}

pub struct ContextStore {
    config: ContextConfig,
    entries: VecDeque<ContextEntry>,
    pinned: Vec<ContextEntry>,
    pinned_labels: HashSet<String>,
    unpinned_tokens: usize,
    pinned_tokens: usize,
    next_seq: u64,
    evicted: u64,
}

impl ContextStore {
    pub fn new(config: ContextConfig) -> Self {
        Self {
            config,
            entries: VecDeque::new(),
            pinned: Vec::new(),
            pinned_labels: HashSet::new(),
            unpinned_tokens: 0,
            pinned_tokens: 0,
            next_seq: 0,
            evicted: 0,
        }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Heuristic cost of an entry, without consulting a backend.
    pub fn estimate_tokens(&self, entry: &NewEntry) -> usize {
        estimate_text_tokens(&entry.text(), self.config.chars_per_token)
    }

    /// Whether a landmark label already has a pinned entry.
    pub fn is_pinned_label(&self, label: &str) -> bool {
        self.pinned_labels.contains(&normalize(label))
    }

    /// Append an entry at a known cost, then evict. Returns its sequence number.
    /// Entries flagged `pinned` are always pinned.
    pub fn append(&mut self, entry: NewEntry, tokens: usize) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;

        let pin = entry.pinned;
        if pin {
            if let Some(label) = &entry.label {
                self.pinned_labels.insert(label.clone());
            }
        }

        let stored = ContextEntry {
            seq,
            role: entry.role,
            payload: entry.payload,
            tokens,
            pinned: pin,
            created_at: Utc::now(),
        };
        if pin {
            self.pinned_tokens += tokens;
            self.pinned.push(stored);
        } else {
            self.unpinned_tokens += tokens;
            self.entries.push_back(stored);
        }

        self.evict();
        seq
    }

    /// Append using the heuristic estimate.
    pub fn append_estimated(&mut self, entry: NewEntry) -> u64 {
        let tokens = self.estimate_tokens(&entry);
        self.append(entry, tokens)
    }

    fn evict(&mut self) {
        let threshold = self.config.prune_threshold();
        let mut removed = 0u64;
        while self.total_tokens() > threshold {
            let Some(oldest) = self.entries.pop_front() else {
                break;
            };
            self.unpinned_tokens -= oldest.tokens;
            removed += 1;
        }
        if removed > 0 {
            self.evicted += removed;
            debug!(
                removed,
                total_tokens = self.total_tokens(),
                threshold,
                "evicted context entries"
            );
        }
    }

    pub fn total_tokens(&self) -> usize {
        self.unpinned_tokens + self.pinned_tokens
    }

    pub fn unpinned_tokens(&self) -> usize {
        self.unpinned_tokens
    }

    pub fn len(&self) -> usize {
        self.entries.len() + self.pinned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pinned entries in pin order.
    pub fn pinned_view(&self) -> &[ContextEntry] {
        &self.pinned
    }

    /// Newest unpinned entries fitting in `max_tokens`, oldest first.
    pub fn window_view(&self, max_tokens: usize) -> Vec<&ContextEntry> {
        let mut budget = max_tokens;
        let mut view: Vec<&ContextEntry> = Vec::new();
        for entry in self.entries.iter().rev() {
            if entry.tokens > budget {
                break;
            }
            budget -= entry.tokens;
            view.push(entry);
        }
        view.reverse();
        view
    }

    /// Entries included in agent turns: the most recent pinned entries, then
    /// the observation window.
    pub fn visible(&self) -> Vec<&ContextEntry> {
        let skip = self.pinned.len().saturating_sub(self.config.pinned_view_limit);
        self.pinned[skip..]
            .iter()
            .chain(self.window_view(self.config.window_tokens))
            .collect()
    }

    /// Context block included in agent turns: recent pinned landmarks, then
    /// the observation window.
    pub fn render(&self) -> String {
        let mut lines = Vec::new();
        let skip = self.pinned.len().saturating_sub(self.config.pinned_view_limit);
        if self.pinned.len() > skip {
            lines.push("=== KNOWN LANDMARKS ===".to_string());
            lines.extend(self.pinned[skip..].iter().map(ContextEntry::render));
            lines.push(String::new());
        }
        let window = self.window_view(self.config.window_tokens);
        if !window.is_empty() {
            lines.push("=== RECENT OBSERVATIONS ===".to_string());
            lines.extend(window.into_iter().map(ContextEntry::render));
        }
        lines.join("\n")
    }

    /// Entries whose text mentions `needle`, case-insensitively. Pinned first.
    pub fn search(&self, needle: &str) -> Vec<&ContextEntry> {
        let needle = needle.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }
        self.pinned
            .iter()
            .chain(self.entries.iter())
            .filter(|e| e.text().to_lowercase().contains(&needle))
            .collect()
    }

    pub fn stats(&self) -> ContextStats {
        let total = self.total_tokens();
        let pct = if self.config.max_tokens == 0 {
            0.0
        } else {
            (total as f64 / self.config.max_tokens as f64 * 1000.0).round() / 10.0
        };
        ContextStats {
            total_tokens: total,
            max_tokens: self.config.max_tokens,
            utilisation_pct: pct,
            entry_count: self.len(),
            pinned_count: self.pinned.len(),
            evicted_count: self.evicted,
            next_seq: self.next_seq,
        }
    }

    /// Drop everything. Used when the owning session closes.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.pinned.clear();
        self.pinned_labels.clear();
        self.unpinned_tokens = 0;
        self.pinned_tokens = 0;
    }
}
