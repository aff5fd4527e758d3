//! Settings loading with deep merge and environment overrides.
//!
//! Merge rules: objects merge per key, arrays and primitives are replaced,
//! and nulls in the user file are skipped.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::NaviSettings;

/// `~/.navisound/settings.json`.
pub fn settings_path() -> PathBuf {
    expand_home("~/.navisound/settings.json")
}

/// Expand a leading `~/` to `$HOME`.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(rest)
        }
        None => PathBuf::from(path),
    }
}

pub fn load_settings() -> Result<NaviSettings> {
    load_settings_from_path(&settings_path())
}

/// Missing file means defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<NaviSettings> {
    let defaults = serde_json::to_value(NaviSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: NaviSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Invalid values are ignored with a warning.
pub fn apply_env_overrides(settings: &mut NaviSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

fn apply_overrides_from(settings: &mut NaviSettings, lookup: impl Fn(&str) -> Option<String>) {
    let string = |name: &str| lookup(name).filter(|v| !v.is_empty());
    let number = |name: &str, min: u64, max: u64| -> Option<u64> {
        let raw = string(name)?;
        let parsed = parse_u64_range(&raw, min, max);
        if parsed.is_none() {
            tracing::warn!(key = name, value = %raw, "invalid numeric env var, ignoring");
        }
        parsed
    };

    if let Some(v) = number("NAVI_ORCHESTRATOR_PORT", 1, 65_535) {
        settings.orchestrator.port = v as u16;
    }
    if let Some(v) = number("NAVI_RELAY_PORT", 1, 65_535) {
        settings.relay.port = v as u16;
    }
    if let Some(v) = string("NAVI_HOST") {
        settings.orchestrator.host.clone_from(&v);
        settings.relay.host = v;
    }
    if let Some(v) = string("NAVI_UPSTREAM_URL") {
        settings.relay.upstream_url = v;
    }
    if let Some(v) = number("NAVI_DISPATCH_TIMEOUT_MS", 50, 120_000) {
        settings.orchestrator.dispatch_timeout_ms = v;
    }
    if let Some(v) = string("NAVI_DB_PATH") {
        settings.store.db_path = v;
    }
    if let Some(v) = string("NAVI_MODEL") {
        settings.backend.model = v;
    }
    if let Some(v) = string("NAVI_BACKEND") {
        settings.backend.provider = v;
    }
    if let Some(v) = string("NAVI_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
