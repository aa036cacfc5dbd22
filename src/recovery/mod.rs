pub mod circuit_breaker;
pub mod supervisor;

pub use circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitState};
pub use supervisor::{ErrorRecoverySupervisor, RetryConfig, SupervisorConfig};
