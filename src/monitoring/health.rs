use chrono::Utc;
use log::warn;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tokio::sync::RwLock;

use crate::feed::{FeedHealth, FeedMode, MarketDataFeedManager};
use crate::recovery::{BreakerSnapshot, CircuitState, ErrorRecoverySupervisor};

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub status: HealthStatus,
    pub message: String,
    /// Unix seconds
    pub timestamp: i64,
    pub checks: Vec<ComponentHealth>,
}

/// Component health
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: String,
}

impl ComponentHealth {
    fn new(name: impl Into<String>, status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            message: message.into(),
        }
    }
}

/// Feed status as a component check
pub fn feed_component(health: &FeedHealth) -> ComponentHealth {
    let liveness = health
        .last_liveness_ms
        .map(|ms| format!("{}ms since last liveness", ms))
        .unwrap_or_else(|| "no liveness yet".to_string());

    let (status, message) = match (health.mode, health.healthy) {
        (FeedMode::Disconnected, _) => (HealthStatus::Unhealthy, "disconnected".to_string()),
        (_, false) => (
            HealthStatus::Unhealthy,
            format!("{} mode stalled, {}", mode_name(health.mode), liveness),
        ),
        // Polling keeps prices flowing but the push path is down
        (FeedMode::Poll, true) => (HealthStatus::Degraded, format!("poll fallback, {}", liveness)),
        (FeedMode::Push, true) => (HealthStatus::Healthy, format!("push, {}", liveness)),
    };
    ComponentHealth::new("market_data_feed", status, message)
}

fn mode_name(mode: FeedMode) -> &'static str {
    match mode {
        FeedMode::Push => "push",
        FeedMode::Poll => "poll",
        FeedMode::Disconnected => "disconnected",
    }
}

/// One check per operation class
pub fn breaker_components(snapshots: &[(String, BreakerSnapshot)]) -> Vec<ComponentHealth> {
    snapshots
        .iter()
        .map(|(class, snapshot)| {
            let (status, message) = match snapshot.state {
                CircuitState::Closed => (
                    HealthStatus::Healthy,
                    format!("closed, {} consecutive failures", snapshot.consecutive_failures),
                ),
                CircuitState::HalfOpen => (HealthStatus::Degraded, "half-open, probing".to_string()),
                CircuitState::Open => {
                    let open_for = snapshot
                        .opened_at
                        .map(|at| at.elapsed().as_secs())
                        .unwrap_or(0);
                    (HealthStatus::Unhealthy, format!("open for {}s", open_for))
                }
            };
            ComponentHealth::new(format!("breaker:{}", class), status, message)
        })
        .collect()
}

impl HealthStatus {
    fn worse(self, other: HealthStatus) -> HealthStatus {
        match (self, other) {
            (HealthStatus::Unhealthy, _) | (_, HealthStatus::Unhealthy) => HealthStatus::Unhealthy,
            (HealthStatus::Degraded, _) | (_, HealthStatus::Degraded) => HealthStatus::Degraded,
            _ => HealthStatus::Healthy,
        }
    }
}

#[derive(Default)]
struct CheckerState {
    components: Vec<ComponentHealth>,
    last_check: Option<Instant>,
}

/// Rolls component checks up into one status; the worst component wins.
#[derive(Default)]
pub struct HealthChecker {
    state: RwLock<CheckerState>,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a component check
    pub async fn register_component(&self, name: String, status: HealthStatus, message: String) {
        self.update(ComponentHealth::new(name, status, message)).await;
    }

    async fn update(&self, health: ComponentHealth) {
        let mut state = self.state.write().await;
        match state.components.iter_mut().find(|c| c.name == health.name) {
            Some(existing) => *existing = health,
            None => state.components.push(health),
        }
    }

    /// Refresh the feed and breaker checks from live components
    pub async fn observe(
        &self,
        feed: Option<&MarketDataFeedManager>,
        supervisor: &ErrorRecoverySupervisor,
    ) {
        if let Some(feed) = feed {
            self.update(feed_component(&feed.health().await)).await;
        }
        for component in breaker_components(&supervisor.breaker_snapshots().await) {
            self.update(component).await;
        }
    }

    pub async fn check(&self) -> HealthCheckResult {
        let mut state = self.state.write().await;
        state.last_check = Some(Instant::now());

        let status = state
            .components
            .iter()
            .fold(HealthStatus::Healthy, |acc, c| acc.worse(c.status));
        let problems: Vec<String> = state
            .components
            .iter()
            .filter(|c| c.status != HealthStatus::Healthy)
            .map(|c| format!("{}: {}", c.name, c.message))
            .collect();

        let message = if problems.is_empty() {
            "feed and brokerage paths healthy".to_string()
        } else {
            problems.join("; ")
        };
        if status == HealthStatus::Unhealthy {
            warn!("Health check failing: {}", message);
        }

        HealthCheckResult {
            status,
            message,
            timestamp: Utc::now().timestamp(),
            checks: state.components.clone(),
        }
    }

    pub async fn last_check_time(&self) -> Option<Instant> {
        self.state.read().await.last_check
    }
}
