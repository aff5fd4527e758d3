use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::{info, warn};

use navi_core::errors::BackendError;
use navi_core::reasoning::{ReasoningBackend, ReasoningSession, SessionConfig};

#[derive(Clone, Debug)]
pub struct ReliableConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown: Duration,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
            jitter_factor: 0.2,
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open { since: Instant },
    HalfOpen,
}

/// Consecutive-failure circuit breaker: closed, then open for a cooldown,
/// then half-open until the next success or failure.
struct CircuitBreaker {
    state: RwLock<CircuitState>,
    consecutive_failures: AtomicU32,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: RwLock::new(CircuitState::Closed),
            consecutive_failures: AtomicU32::new(0),
            threshold: threshold.max(1),
            cooldown,
        }
    }

    fn admit(&self) -> Result<(), BackendError> {
        let current = *self.state.read();
        match current {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open { since } => {
                let elapsed = since.elapsed();
                if elapsed >= self.cooldown {
                    *self.state.write() = CircuitState::HalfOpen;
                    Ok(())
                } else {
                    Err(BackendError::CircuitOpen(self.cooldown - elapsed))
                }
            }
        }
    }

    fn on_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let mut state = self.state.write();
        if *state != CircuitState::Closed {
            info!("circuit breaker closed");
            *state = CircuitState::Closed;
        }
    }

    fn on_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        let mut state = self.state.write();
        let trip = match *state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => failures >= self.threshold,
            CircuitState::Open { .. } => false,
        };
        if trip {
            warn!(
                failures,
                cooldown_ms = self.cooldown.as_millis() as u64,
                "circuit breaker opened"
            );
            *state = CircuitState::Open { since: Instant::now() };
        }
    }

    fn name(&self) -> &'static str {
        match *self.state.read() {
            CircuitState::Closed => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Wraps a backend so that opening a reasoning session retries transient
/// failures and stops hammering a backend that keeps failing. Turns sent on
/// an open session are not retried; the dispatch deadline bounds them.
pub struct ReliableBackend<B: ReasoningBackend> {
    inner: B,
    config: ReliableConfig,
    breaker: Arc<CircuitBreaker>,
    total_retries: AtomicU64,
}

impl<B: ReasoningBackend> ReliableBackend<B> {
    pub fn new(inner: B, config: ReliableConfig) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(
            config.circuit_breaker_threshold,
            config.circuit_breaker_cooldown,
        ));
        Self {
            inner,
            config,
            breaker,
            total_retries: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(inner: B) -> Self {
        Self::new(inner, ReliableConfig::default())
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    pub fn circuit_state_name(&self) -> &'static str {
        self.breaker.name()
    }

    fn retry_delay(&self, attempt: u32, suggested: Option<Duration>) -> Duration {
        if let Some(delay) = suggested {
            return delay.min(self.config.max_delay);
        }
        let base = self.config.base_delay.as_millis() as f64 * 2f64.powi(attempt as i32);
        let capped = base.min(self.config.max_delay.as_millis() as f64);
        let spread = capped * self.config.jitter_factor;
        let offset = (unit_noise() * 2.0 - 1.0) * spread;
        Duration::from_millis((capped + offset).max(10.0) as u64)
    }
}

/// Cheap value in [0, 1) from the clock's sub-second nanos.
fn unit_noise() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    let mixed = nanos.wrapping_mul(2_654_435_761);
    f64::from(mixed) / (f64::from(u32::MAX) + 1.0)
}

#[async_trait]
impl<B: ReasoningBackend> ReasoningBackend for ReliableBackend<B> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn open(&self, config: SessionConfig) -> Result<Arc<dyn ReasoningSession>, BackendError> {
        self.breaker.admit()?;

        let mut attempt = 0;
        loop {
            match self.inner.open(config.clone()).await {
                Ok(session) => {
                    self.breaker.on_success();
                    return Ok(session);
                }
                Err(e) => {
                    if !e.is_retryable() || attempt >= self.config.max_retries {
                        self.breaker.on_failure();
                        return Err(e);
                    }
                    let delay = self.retry_delay(attempt, e.suggested_delay());
                    self.total_retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        role = %config.role,
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying session open"
                    );
                    tokio::time::sleep(delay).await;
                    self.breaker.admit()?;
                    attempt += 1;
                }
            }
        }
    }

    async fn count_tokens(&self, text: &str) -> Result<usize, BackendError> {
        self.inner.count_tokens(text).await
    }
}
