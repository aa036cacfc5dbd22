//! Error recovery supervisor tests
//!
//! Covers:
//! - Breaker opening after consecutive ultimate failures
//! - Fail-fast while open, without invoking the operation
//! - Lazy half-open after cooldown and closing on a successful probe
//! - Re-authentication on expired sessions

use options_oms::connectors::SimulatedBrokerage;
use options_oms::recovery::CircuitBreaker;
use options_oms::{
    CircuitState, EngineError, ErrorRecoverySupervisor, RemoteErrorKind, RetryConfig,
    SupervisorConfig,
};
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn single_attempt_config(cooldown: Duration) -> SupervisorConfig {
    SupervisorConfig {
        retry: RetryConfig {
            max_attempts: 1,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 2.0,
        },
        failure_threshold: 5,
        cooldown,
        success_threshold: 1,
        call_timeout: Duration::from_millis(200),
    }
}

// =============================================================================
// Breaker transitions through the supervisor
// =============================================================================

#[tokio::test]
async fn test_sixth_call_fails_fast_after_five_failures() {
    let supervisor = ErrorRecoverySupervisor::new(single_attempt_config(Duration::from_secs(300)));
    let calls = AtomicU32::new(0);

    for _ in 0..5 {
        let result: Result<(), _> = supervisor
            .execute_with_recovery("orders", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(EngineError::transient("503 Service Unavailable"))
            })
            .await;
        assert!(result.is_err());
    }
    assert_eq!(supervisor.circuit_state("orders").await, CircuitState::Open);
    assert_eq!(calls.load(Ordering::SeqCst), 5);

    let result: Result<(), _> = supervisor
        .execute_with_recovery("orders", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;

    assert!(matches!(result, Err(EngineError::CircuitOpen(class)) if class == "orders"));
    assert_eq!(calls.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_breakers_are_independent_per_class() {
    let supervisor = ErrorRecoverySupervisor::new(single_attempt_config(Duration::from_secs(300)));

    for _ in 0..5 {
        let _: Result<(), _> = supervisor
            .execute_with_recovery("quotes", || async { Err(EngineError::timeout("slow")) })
            .await;
    }
    assert_eq!(supervisor.circuit_state("quotes").await, CircuitState::Open);

    let result = supervisor
        .execute_with_recovery("orders", || async { Ok(7) })
        .await;
    assert_eq!(result.unwrap(), 7);
    assert_eq!(supervisor.circuit_state("orders").await, CircuitState::Closed);
}

#[tokio::test]
async fn test_cooldown_half_open_then_close() {
    let supervisor = ErrorRecoverySupervisor::new(single_attempt_config(Duration::from_millis(50)));

    for _ in 0..5 {
        let _: Result<(), _> = supervisor
            .execute_with_recovery("ledger", || async { Err(EngineError::transient("502")) })
            .await;
    }
    assert_eq!(supervisor.circuit_state("ledger").await, CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(80)).await;
    // Still reported open until a call arrives
    assert_eq!(supervisor.circuit_state("ledger").await, CircuitState::Open);

    let result = supervisor
        .execute_with_recovery("ledger", || async { Ok("probe") })
        .await;
    assert_eq!(result.unwrap(), "probe");
    assert_eq!(supervisor.circuit_state("ledger").await, CircuitState::Closed);
}

#[tokio::test]
async fn test_rejections_do_not_trip_breaker() {
    let supervisor = ErrorRecoverySupervisor::new(single_attempt_config(Duration::from_secs(300)));

    for _ in 0..10 {
        let result: Result<(), _> = supervisor
            .execute_with_recovery("orders", || async {
                Err(EngineError::rejected("insufficient margin"))
            })
            .await;
        assert_eq!(result.unwrap_err().remote_kind(), Some(RemoteErrorKind::Rejected));
    }
    assert_eq!(supervisor.circuit_state("orders").await, CircuitState::Closed);
}

// =============================================================================
// Breaker state machine
// =============================================================================

#[tokio::test]
async fn test_failed_probe_reopens() {
    let breaker = CircuitBreaker::new("quotes", 2, Duration::from_secs(10), 1);
    let start = Instant::now();

    breaker.record_failure_at(start).await;
    breaker.record_failure_at(start).await;
    assert_eq!(breaker.state().await, CircuitState::Open);
    assert!(!breaker.can_execute_at(start + Duration::from_secs(5)).await);

    assert!(breaker.can_execute_at(start + Duration::from_secs(11)).await);
    assert_eq!(breaker.state().await, CircuitState::HalfOpen);

    let probe_failed_at = start + Duration::from_secs(12);
    breaker.record_failure_at(probe_failed_at).await;
    assert_eq!(breaker.state().await, CircuitState::Open);
    assert!(!breaker.can_execute_at(probe_failed_at + Duration::from_secs(5)).await);
}

// =============================================================================
// Re-authentication
// =============================================================================

#[tokio::test]
async fn test_expired_session_reauthenticates_once() {
    let brokerage = Arc::new(SimulatedBrokerage::new(dec!(100000)));
    let supervisor = ErrorRecoverySupervisor::new(single_attempt_config(Duration::from_secs(300)))
        .with_reauthenticator(brokerage.clone());
    let calls = AtomicU32::new(0);

    let result = supervisor
        .execute_with_recovery("account", || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(EngineError::auth_expired("TokenException"))
            } else {
                Ok(1)
            }
        })
        .await;

    assert_eq!(result.unwrap(), 1);
    assert_eq!(brokerage.reauthentication_count(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // A second expiry inside the same call is returned to the caller
    let result: Result<(), _> = supervisor
        .execute_with_recovery("account", || async {
            Err(EngineError::auth_expired("TokenException"))
        })
        .await;
    assert!(result.unwrap_err().is_auth_expired());
    assert_eq!(supervisor.circuit_state("account").await, CircuitState::Closed);
}
