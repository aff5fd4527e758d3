use std::sync::Arc;

use tracing::debug;

use navi_core::reasoning::ReasoningBackend;

/// Heuristic token count: characters divided by `chars_per_token`, minimum 1.
pub fn estimate_text_tokens(text: &str, chars_per_token: usize) -> usize {
    text.chars().count().div_ceil(chars_per_token.max(1)).max(1)
}

/// Counts tokens with the backend when it answers, else falls back to the
/// character heuristic.
#[derive(Clone)]
pub struct TokenEstimator {
    backend: Option<Arc<dyn ReasoningBackend>>,
    chars_per_token: usize,
}

impl TokenEstimator {
    pub fn new(backend: Arc<dyn ReasoningBackend>, chars_per_token: usize) -> Self {
        Self {
            backend: Some(backend),
            chars_per_token,
        }
    }

    /// Estimator that never calls a backend.
    pub fn heuristic(chars_per_token: usize) -> Self {
        Self {
            backend: None,
            chars_per_token,
        }
    }

    pub fn chars_per_token(&self) -> usize {
        self.chars_per_token
    }

    pub async fn estimate(&self, text: &str) -> usize {
        if let Some(backend) = &self.backend {
            match backend.count_tokens(text).await {
                Ok(count) => return count.max(1),
                Err(e) => {
                    debug!(error = %e, "token count failed, estimating from characters");
                }
            }
        }
        self.fallback(text)
    }

    /// The character heuristic alone.
    pub fn fallback(&self, text: &str) -> usize {
        estimate_text_tokens(text, self.chars_per_token)
    }
}
