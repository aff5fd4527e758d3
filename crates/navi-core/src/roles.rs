use std::fmt;

use serde::{Deserialize, Serialize};

/// The named agent roles a session can run.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Scene,
    Hazard,
    Route,
    Audio,
    Recall,
}

/// Precedence for top-level fields that more than one role can fill.
/// Earlier roles win regardless of completion order.
pub const ROLE_PRIORITY: [AgentRole; 5] = [
    AgentRole::Hazard,
    AgentRole::Scene,
    AgentRole::Route,
    AgentRole::Recall,
    AgentRole::Audio,
];

impl AgentRole {
    pub const ALL: [AgentRole; 5] = [
        AgentRole::Scene,
        AgentRole::Hazard,
        AgentRole::Route,
        AgentRole::Audio,
        AgentRole::Recall,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scene => "scene",
            Self::Hazard => "hazard",
            Self::Route => "route",
            Self::Audio => "audio",
            Self::Recall => "recall",
        }
    }

    /// Lower is stronger.
    pub fn priority(&self) -> usize {
        ROLE_PRIORITY
            .iter()
            .position(|r| r == self)
            .unwrap_or(ROLE_PRIORITY.len())
    }

    /// Derived roles compute from sibling results and own no reasoning handle.
    pub fn is_derived(&self) -> bool {
        matches!(self, Self::Audio)
    }

    /// Roles that open a reasoning session when a connection opens.
    pub fn with_handles() -> impl Iterator<Item = AgentRole> {
        Self::ALL.into_iter().filter(|r| !r.is_derived())
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tag on a context entry.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextRole {
    Observation,
    Landmark,
    Hazard,
    Instruction,
}

impl ContextRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Observation => "observation",
            Self::Landmark => "landmark",
            Self::Hazard => "hazard",
            Self::Instruction => "instruction",
        }
    }
}
