use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NaviSettings {
    pub orchestrator: OrchestratorSettings,
    pub relay: RelaySettings,
    pub context: ContextSettings,
    pub agents: AgentSettings,
    pub backend: BackendSettings,
    pub store: StoreSettings,
    pub logging: LoggingSettings,
}

/// Orchestration endpoint and per-session lifecycle bounds.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub host: String,
    pub port: u16,
    /// Ceiling on one whole fan-out.
    pub dispatch_timeout_ms: u64,
    /// Ceiling on opening all reasoning sessions for a connection.
    pub open_timeout_ms: u64,
    /// How long `close` waits for an admitted dispatch before abandoning it.
    pub close_grace_ms: u64,
    /// Minimum spacing between attempts to reopen a failed handle.
    pub reopen_interval_ms: u64,
    /// Outbound frames buffered per connection before dropping.
    pub max_send_queue: usize,
    pub heartbeat_interval_ms: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8000,
            dispatch_timeout_ms: 3_000,
            open_timeout_ms: 10_000,
            close_grace_ms: 2_000,
            reopen_interval_ms: 5_000,
            max_send_queue: 256,
            heartbeat_interval_ms: 30_000,
        }
    }
}

impl OrchestratorSettings {
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    pub fn reopen_interval(&self) -> Duration {
        Duration::from_millis(self.reopen_interval_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    pub host: String,
    pub port: u16,
    pub upstream_url: String,
    /// Client messages held while the upstream connection is not ready.
    pub max_pending: usize,
    pub connect_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 3000,
            upstream_url: "ws://127.0.0.1:8000/agent/stream".into(),
            max_pending: 64,
            connect_timeout_ms: 10_000,
            heartbeat_interval_ms: 30_000,
        }
    }
}

/// Context store budget and eviction policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextSettings {
    pub max_tokens: usize,
    /// Fraction of `max_tokens` above which unpinned entries are evicted.
    pub prune_ratio: f64,
    /// Fallback estimate when the backend cannot count tokens.
    pub chars_per_token: usize,
    /// Budget for the context slice included in each agent turn.
    pub window_tokens: usize,
    /// Most recent pinned entries included in each agent turn.
    pub pinned_view_limit: usize,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            max_tokens: 1_048_576,
            prune_ratio: 0.9,
            chars_per_token: 4,
            window_tokens: 32_000,
            pinned_view_limit: 50,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Previous routing steps fed back into the route agent.
    pub route_history: usize,
    /// Prior detections kept by the hazard agent.
    pub hazard_history: usize,
    /// Max age of a prior detection used for approach estimation.
    pub hazard_window_secs: f64,
    /// Store matches gathered per recall query.
    pub recall_limit: u32,
    /// Radius for proximity recall.
    pub recall_radius_m: f64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            route_history: 20,
            hazard_history: 32,
            hazard_window_secs: 10.0,
            recall_limit: 5,
            recall_radius_m: 50.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    /// `gemini` or `mock`.
    pub provider: String,
    pub model: String,
    pub api_base: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub request_timeout_ms: u64,
    pub max_retries: u32,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown_ms: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            provider: "gemini".into(),
            model: "gemini-2.0-flash".into(),
            api_base: "https://generativelanguage.googleapis.com/v1beta".into(),
            api_key_env: "GEMINI_API_KEY".into(),
            temperature: 0.3,
            max_output_tokens: 500,
            request_timeout_ms: 15_000,
            max_retries: 2,
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown_ms: 30_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// `~` expands to `$HOME`. `:memory:` keeps everything in process.
    pub db_path: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            db_path: "~/.navisound/database/navisound.db".into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
    pub log_to_sqlite: bool,
    pub log_db_path: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: true,
            log_to_sqlite: true,
            log_db_path: "~/.navisound/database/logs.db".into(),
        }
    }
}
