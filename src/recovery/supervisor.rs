use dashmap::DashMap;
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{EngineError, Result};
use crate::recovery::circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitState};
use crate::traits::Reauthenticator;

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per call, including the first
    pub max_attempts: u32,
    #[serde(with = "crate::config::millis")]
    pub initial_delay: Duration,
    #[serde(with = "crate::config::millis")]
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retrying after the given failed attempt (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Supervisor configuration, shared by every operation class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub retry: RetryConfig,
    /// Consecutive ultimate failures before a breaker opens
    pub failure_threshold: u32,
    /// Time an open breaker waits before letting a probe through
    #[serde(with = "crate::config::millis")]
    pub cooldown: Duration,
    /// Successful probes needed to close a half-open breaker
    pub success_threshold: u32,
    /// Deadline for a single attempt
    #[serde(with = "crate::config::millis")]
    pub call_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            failure_threshold: 5,
            cooldown: Duration::from_secs(300), // 5 minutes
            success_threshold: 1,
            call_timeout: Duration::from_secs(10),
        }
    }
}

/// Wraps remote calls with bounded retry and a per-class circuit breaker.
///
/// Knows nothing about trading; an operation class is any string the caller
/// uses to group calls that fail together.
pub struct ErrorRecoverySupervisor {
    config: SupervisorConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    reauthenticator: Option<Arc<dyn Reauthenticator>>,
}

impl ErrorRecoverySupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
            reauthenticator: None,
        }
    }

    pub fn with_reauthenticator(mut self, reauthenticator: Arc<dyn Reauthenticator>) -> Self {
        self.reauthenticator = Some(reauthenticator);
        self
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    fn breaker(&self, class: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(class.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    class,
                    self.config.failure_threshold,
                    self.config.cooldown,
                    self.config.success_threshold,
                ))
            })
            .clone()
    }

    /// Run `operation` under the breaker for `class`.
    ///
    /// Fails with `CircuitOpen` without invoking `operation` while the breaker
    /// is open. Retryable failures are retried with exponential backoff and
    /// only the ultimate failure counts against the breaker. An expired
    /// session triggers one re-authentication and one extra attempt; neither
    /// that nor a `Rejected` response touches the breaker.
    pub async fn execute_with_recovery<T, F, Fut>(&self, class: &str, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run(class, false, operation).await
    }

    /// Like [`execute_with_recovery`](Self::execute_with_recovery), but a
    /// `RateLimited` failure is returned at once instead of retried, so the
    /// caller can back off on its own schedule. It still counts against the
    /// breaker.
    pub async fn execute_yielding_rate_limits<T, F, Fut>(&self, class: &str, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run(class, true, operation).await
    }

    async fn run<T, F, Fut>(&self, class: &str, yield_rate_limits: bool, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = self.breaker(class);
        if !breaker.can_execute().await {
            debug!("Breaker open for '{}', failing fast", class);
            return Err(EngineError::CircuitOpen(class.to_string()));
        }

        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut attempt = 0;
        let mut reauthenticated = false;

        loop {
            attempt += 1;

            let result = match tokio::time::timeout(self.config.call_timeout, operation()).await {
                Ok(result) => result,
                Err(_) => Err(EngineError::timeout(format!(
                    "{} exceeded {:?}",
                    class, self.config.call_timeout
                ))),
            };

            let err = match result {
                Ok(value) => {
                    breaker.record_success().await;
                    return Ok(value);
                }
                Err(err) => err,
            };

            if err.is_auth_expired() {
                let reauthenticator = match (&self.reauthenticator, reauthenticated) {
                    (Some(reauthenticator), false) => reauthenticator,
                    _ => return Err(err),
                };
                warn!("Session expired during '{}', re-authenticating", class);
                reauthenticator.reauthenticate().await?;
                reauthenticated = true;
                // The extra attempt does not consume the retry budget
                attempt -= 1;
                continue;
            }

            if !err.is_retryable() {
                return Err(err);
            }

            if yield_rate_limits && err.is_rate_limited() {
                debug!("'{}' rate limited, returning to caller", class);
                breaker.record_failure().await;
                return Err(err);
            }

            if attempt >= max_attempts {
                error!(
                    "'{}' failed after {} attempts: {}",
                    class, attempt, err
                );
                breaker.record_failure().await;
                return Err(err);
            }

            let delay = self.config.retry.delay_for_attempt(attempt);
            warn!(
                "'{}' failed (attempt {}/{}), retrying in {:?}: {}",
                class, attempt, max_attempts, delay, err
            );
            tokio::time::sleep(delay).await;
        }
    }

    pub async fn circuit_state(&self, class: &str) -> CircuitState {
        match self.breakers.get(class).map(|entry| entry.value().clone()) {
            Some(breaker) => breaker.state().await,
            None => CircuitState::Closed,
        }
    }

    /// Snapshot of every breaker created so far
    pub async fn breaker_snapshots(&self) -> Vec<(String, BreakerSnapshot)> {
        let breakers: Vec<(String, Arc<CircuitBreaker>)> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut snapshots = Vec::with_capacity(breakers.len());
        for (class, breaker) in breakers {
            snapshots.push((class, breaker.snapshot().await));
        }
        snapshots.sort_by(|a, b| a.0.cmp(&b.0));
        snapshots
    }
}
