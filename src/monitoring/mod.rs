/// Health reporting for the feed and remote-call breakers
pub mod health;

pub use health::{
    breaker_components, feed_component, ComponentHealth, HealthCheckResult, HealthChecker,
    HealthStatus,
};
