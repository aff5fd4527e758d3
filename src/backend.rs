//! Builds the reasoning backend named in settings.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use navi_core::reasoning::ReasoningBackend;
use navi_llm::{GeminiBackend, GeminiConfig, MockBackend, ReliableBackend, ReliableConfig};
use navi_settings::BackendSettings;
use secrecy::SecretString;

pub fn reliable_config(s: &BackendSettings) -> ReliableConfig {
    ReliableConfig {
        max_retries: s.max_retries,
        circuit_breaker_threshold: s.circuit_breaker_threshold,
        circuit_breaker_cooldown: Duration::from_millis(s.circuit_breaker_cooldown_ms),
        ..ReliableConfig::default()
    }
}

/// `gemini` talks to the REST API, wrapped in retry and circuit breaking.
/// `mock` answers nothing, so every dispatch degrades to the safe fallback.
pub fn build(s: &BackendSettings) -> Result<Arc<dyn ReasoningBackend>> {
    match s.provider.as_str() {
        "gemini" => {
            let key = std::env::var(&s.api_key_env)
                .with_context(|| format!("{} is not set", s.api_key_env))?;
            let config = GeminiConfig {
                api_base: s.api_base.clone(),
                model: s.model.clone(),
                api_key: SecretString::from(key),
                timeout: Duration::from_millis(s.request_timeout_ms),
            };
            let gemini = GeminiBackend::new(config).context("failed to build Gemini backend")?;
            tracing::info!(model = %s.model, "reasoning backend: gemini");
            Ok(Arc::new(ReliableBackend::new(gemini, reliable_config(s))))
        }
        "mock" => {
            tracing::warn!("reasoning backend: mock, responses will be safe fallbacks");
            Ok(Arc::new(MockBackend::new()))
        }
        other => bail!("unknown backend provider: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_provider_is_rejected() {
        let settings = BackendSettings {
            provider: "carrier-pigeon".into(),
            ..Default::default()
        };
        let err = build(&settings).err().unwrap();
        assert!(err.to_string().contains("carrier-pigeon"));
    }

    #[test]
    fn mock_provider_needs_no_key() {
        let settings = BackendSettings {
            provider: "mock".into(),
            ..Default::default()
        };
        assert!(build(&settings).is_ok());
    }

    #[test]
    fn retry_settings_carry_over() {
        let settings = BackendSettings {
            max_retries: 7,
            circuit_breaker_cooldown_ms: 1_500,
            ..Default::default()
        };
        let config = reliable_config(&settings);
        assert_eq!(config.max_retries, 7);
        assert_eq!(config.circuit_breaker_cooldown, Duration::from_millis(1_500));
    }
}
