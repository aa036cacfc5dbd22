use log::{error, info};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
}

/// Point-in-time copy of a breaker, for health reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<Instant>,
}

/// Circuit breaker for one operation class.
///
/// The open to half-open transition is evaluated lazily on the next
/// `can_execute` once the cooldown has elapsed; no timer task is involved.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    inner: RwLock<BreakerInner>,
    failure_threshold: u32,
    cooldown: Duration,
    success_threshold: u32,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        failure_threshold: u32,
        cooldown: Duration,
        success_threshold: u32,
    ) -> Self {
        Self {
            name: name.into(),
            inner: RwLock::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                opened_at: None,
            }),
            failure_threshold: failure_threshold.max(1),
            cooldown,
            success_threshold: success_threshold.max(1),
        }
    }

    /// Check if a call is allowed
    pub async fn can_execute(&self) -> bool {
        self.can_execute_at(Instant::now()).await
    }

    pub async fn can_execute_at(&self, now: Instant) -> bool {
        let mut inner = self.inner.write().await;
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled_down = inner
                    .opened_at
                    .map(|opened| now.saturating_duration_since(opened) >= self.cooldown)
                    .unwrap_or(true);
                if cooled_down {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                    info!("Circuit breaker '{}' transitioning to half-open", self.name);
                }
                cooled_down
            }
        }
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.write().await;
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                    info!("Circuit breaker '{}' closed - service recovered", self.name);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub async fn record_failure(&self) {
        self.record_failure_at(Instant::now()).await;
    }

    pub async fn record_failure_at(&self, now: Instant) {
        let mut inner = self.inner.write().await;
        inner.consecutive_failures += 1;

        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    error!(
                        "Circuit breaker '{}' opened after {} consecutive failures",
                        self.name, inner.consecutive_failures
                    );
                }
            }
            CircuitState::HalfOpen => {
                // Probe failed, back to a full cooldown
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                error!("Circuit breaker '{}' re-opened from half-open", self.name);
            }
            CircuitState::Open => {
                inner.opened_at = Some(now);
            }
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.read().await.state
    }

    pub async fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.read().await;
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            opened_at: inner.opened_at,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
