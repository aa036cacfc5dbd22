//! Order lifecycle manager tests
//!
//! Covers:
//! - Paper orders filling locally and exiting on live prices
//! - Exactly-once exit handling across repeated reconciliation passes
//! - One open order per instrument
//! - Identical admission decisions in paper and real mode
//! - Real orders reconciled against the brokerage ledgers
//! - Daily position cap and intraday loss limit
//! - Cancellation in both modes
//! - Forced exits and stale-order cleanup

use chrono::{Duration as ChronoDuration, Utc};
use options_oms::connectors::simulated::{OP_CANCEL, OP_FILL_LEDGER, OP_ORDER_LEDGER};
use options_oms::connectors::SimulatedBrokerage;
use options_oms::traits::{FillLedgerEntry, LedgerStatus, OrderSide};
use options_oms::{
    Direction, EngineError, ErrorRecoverySupervisor, ExecutionMode, ExitReason, FeedConfig, IntentOutcome,
    MarketDataFeedManager, OptionType, Order, OrderEvent, OrderLifecycleManager,
    OrderManagerConfig, OrderState, Price, PriceUpdate, RemoteErrorKind, RetryConfig, RiskConfig,
    RiskEngine, SupervisorConfig, TradeIntent,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

struct Harness {
    manager: Arc<OrderLifecycleManager>,
    brokerage: Arc<SimulatedBrokerage>,
    feed: Arc<MarketDataFeedManager>,
}

fn supervisor() -> Arc<ErrorRecoverySupervisor> {
    Arc::new(ErrorRecoverySupervisor::new(SupervisorConfig {
        retry: RetryConfig {
            max_attempts: 1,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 2.0,
        },
        ..SupervisorConfig::default()
    }))
}

fn harness_with(config: OrderManagerConfig) -> Harness {
    harness_with_risk(config, RiskConfig::default())
}

fn harness_with_risk(config: OrderManagerConfig, risk: RiskConfig) -> Harness {
    let brokerage = Arc::new(SimulatedBrokerage::new(dec!(100000)));
    let supervisor = supervisor();
    let feed = MarketDataFeedManager::new(
        FeedConfig::default(),
        vec!["NIFTY".to_string()],
        None,
        None,
        supervisor.clone(),
    );
    let manager = OrderLifecycleManager::new(
        config,
        RiskEngine::new(risk, dec!(100000)),
        brokerage.clone(),
        supervisor,
        Some(feed.clone()),
    );
    Harness {
        manager,
        brokerage,
        feed,
    }
}

fn harness(mode: ExecutionMode) -> Harness {
    harness_with(OrderManagerConfig {
        mode,
        paper_fill_delay: Duration::from_millis(10),
        ..OrderManagerConfig::default()
    })
}

fn paper_with_risk(risk: RiskConfig) -> Harness {
    harness_with_risk(
        OrderManagerConfig {
            mode: ExecutionMode::Paper,
            paper_fill_delay: Duration::from_millis(10),
            ..OrderManagerConfig::default()
        },
        risk,
    )
}

// A 600 stop-out on a 100000 account crosses this
fn tight_loss_limit() -> RiskConfig {
    RiskConfig {
        intraday_exit_loss_fraction: 0.005,
        ..RiskConfig::default()
    }
}

fn nifty_intent() -> TradeIntent {
    TradeIntent::new(
        "NIFTY",
        Direction::Bullish,
        OptionType::Call,
        Price::new(dec!(50)),
        Price::new(dec!(57.5)),
        Price::new(dec!(42.5)),
        85.0,
    )
}

fn tick(symbol: &str, price: Decimal) -> PriceUpdate {
    PriceUpdate {
        symbol: symbol.to_string(),
        price: Price::new(price),
        volume: 100,
        timestamp: Utc::now(),
    }
}

fn submitted(outcome: IntentOutcome) -> Order {
    match outcome {
        IntentOutcome::Submitted(order) => order,
        other => panic!("expected a submitted order, got {:?}", other),
    }
}

async fn next_event(events: &mut broadcast::Receiver<OrderEvent>) -> OrderEvent {
    tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("event within a second")
        .expect("event bus open")
}

fn banknifty_intent() -> TradeIntent {
    let mut intent = nifty_intent();
    intent.instrument = "BANKNIFTY".to_string();
    intent
}

fn drain(events: &mut broadcast::Receiver<OrderEvent>) -> Vec<&'static str> {
    let mut names = Vec::new();
    while let Ok(event) = events.try_recv() {
        names.push(event.name());
    }
    names
}

// =============================================================================
// Paper lifecycle
// =============================================================================

#[tokio::test]
async fn test_paper_order_exits_at_target_exactly_once() {
    let h = harness(ExecutionMode::Paper);
    let mut events = h.manager.subscribe();

    let order = submitted(h.manager.handle_intent(nifty_intent()).await);
    assert_eq!(order.quantity, 75);
    assert_eq!(order.lot_size, 75);
    assert_eq!(order.mode, ExecutionMode::Paper);

    assert_eq!(next_event(&mut events).await.name(), "order-filled");

    h.feed.update_price(tick("NIFTY", dec!(58)));
    let report = h.manager.reconcile_at(Utc::now()).await.unwrap();
    assert_eq!(report.exited, 1);

    let exited = h.manager.get_order(&order.id).await.unwrap();
    assert_eq!(exited.state, OrderState::ExitedTarget);
    let exit = exited.exit.clone().unwrap();
    assert_eq!(exit.reason, ExitReason::Target);
    assert!(exit.price <= Price::new(dec!(58)));
    assert!(exit.pnl > Decimal::ZERO);

    // Later passes leave the recorded exit untouched
    for _ in 0..3 {
        let report = h.manager.reconcile_at(Utc::now()).await.unwrap();
        assert_eq!(report.exited, 0);
    }
    assert_eq!(h.manager.get_order(&order.id).await.unwrap().exit, Some(exit));

    assert_eq!(drain(&mut events), vec!["order-exited"]);
    assert!(h.brokerage.placed_orders().await.is_empty());
}

#[tokio::test]
async fn test_paper_order_exits_at_stop_loss() {
    let h = harness(ExecutionMode::Paper);
    let mut events = h.manager.subscribe();
    let order = submitted(h.manager.handle_intent(nifty_intent()).await);
    next_event(&mut events).await;

    h.feed.update_price(tick("NIFTY", dec!(42)));
    h.manager.reconcile_at(Utc::now()).await.unwrap();

    let exited = h.manager.get_order(&order.id).await.unwrap();
    assert_eq!(exited.state, OrderState::ExitedStopLoss);
    assert!(exited.exit.unwrap().pnl < Decimal::ZERO);
    assert_eq!(
        h.manager.risk_snapshot(|r| r.ledger().open_positions()).await,
        0
    );
}

#[tokio::test]
async fn test_implausible_price_is_skipped() {
    let h = harness(ExecutionMode::Paper);
    let mut events = h.manager.subscribe();
    let order = submitted(h.manager.handle_intent(nifty_intent()).await);
    next_event(&mut events).await;

    // Six times the fill price is bad data, not a target hit
    h.feed.update_price(tick("NIFTY", dec!(300)));
    let report = h.manager.reconcile_at(Utc::now()).await.unwrap();

    assert_eq!(report.skipped, 1);
    assert_eq!(report.exited, 0);
    assert_eq!(
        h.manager.get_order(&order.id).await.unwrap().state,
        OrderState::Filled
    );
}

#[tokio::test]
async fn test_price_between_levels_keeps_position_open() {
    let h = harness(ExecutionMode::Paper);
    let mut events = h.manager.subscribe();
    let order = submitted(h.manager.handle_intent(nifty_intent()).await);
    next_event(&mut events).await;

    h.feed.update_price(tick("NIFTY", dec!(53)));
    h.manager.reconcile_at(Utc::now()).await.unwrap();

    assert_eq!(
        h.manager.get_order(&order.id).await.unwrap().state,
        OrderState::Filled
    );
    assert_eq!(h.manager.active_orders().await.len(), 1);
}

// =============================================================================
// Admission
// =============================================================================

#[tokio::test]
async fn test_one_open_order_per_instrument() {
    let h = harness(ExecutionMode::Paper);
    let mut events = h.manager.subscribe();

    submitted(h.manager.handle_intent(nifty_intent()).await);
    let second = h.manager.handle_intent(nifty_intent()).await;
    assert!(matches!(second, IntentOutcome::Rejected(_)));

    let mut banknifty = nifty_intent();
    banknifty.instrument = "BANKNIFTY".to_string();
    submitted(h.manager.handle_intent(banknifty).await);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let names = drain(&mut events);
    assert_eq!(names.iter().filter(|n| **n == "order-rejected").count(), 1);
    assert_eq!(h.manager.orders().await.len(), 2);
}

#[tokio::test]
async fn test_instrument_free_again_after_exit() {
    let h = harness(ExecutionMode::Paper);
    let mut events = h.manager.subscribe();
    submitted(h.manager.handle_intent(nifty_intent()).await);
    next_event(&mut events).await;

    h.feed.update_price(tick("NIFTY", dec!(58)));
    h.manager.reconcile_at(Utc::now()).await.unwrap();
    assert!(h.manager.open_order_for("NIFTY").await.is_none());

    submitted(h.manager.handle_intent(nifty_intent()).await);
}

#[tokio::test]
async fn test_plans_match_across_modes() {
    let paper = harness(ExecutionMode::Paper);
    let real = harness(ExecutionMode::Real);
    let intent = nifty_intent();
    let now = Utc::now();

    let paper_plan = paper.manager.plan_order_at(&intent, now).await;
    let real_plan = real.manager.plan_order_at(&intent, now).await;

    assert_eq!(paper_plan, real_plan);
    assert_eq!(paper_plan.quantity, 75);
    assert!(paper_plan.estimated_cost > Decimal::ZERO);
}

#[tokio::test]
async fn test_low_account_value_blocks_intent() {
    let h = harness(ExecutionMode::Paper);
    h.brokerage.set_account_value(dec!(15000)).await;
    let mut events = h.manager.subscribe();

    // 3750 is a quarter of a 15000 account
    let outcome = h.manager.handle_intent(nifty_intent()).await;
    match outcome {
        IntentOutcome::Blocked(assessment) => assert!(assessment.hard_block),
        other => panic!("expected a block, got {:?}", other),
    }
    assert_eq!(next_event(&mut events).await.name(), "order-blocked");
    assert!(h.manager.orders().await.is_empty());
}

#[tokio::test]
async fn test_daily_position_cap_rejects_intent() {
    let h = paper_with_risk(RiskConfig {
        max_daily_positions: 1,
        ..RiskConfig::default()
    });
    submitted(h.manager.handle_intent(nifty_intent()).await);

    match h.manager.handle_intent(banknifty_intent()).await {
        IntentOutcome::Rejected(reason) => assert_eq!(reason, "daily position cap reached"),
        other => panic!("expected a rejection, got {:?}", other),
    }
    assert_eq!(h.manager.orders().await.len(), 1);
}

#[tokio::test]
async fn test_intraday_loss_limit_rejects_new_intent() {
    let h = paper_with_risk(tight_loss_limit());
    let mut events = h.manager.subscribe();
    submitted(h.manager.handle_intent(nifty_intent()).await);
    next_event(&mut events).await;

    h.feed.update_price(tick("NIFTY", dec!(42)));
    h.manager.reconcile_at(Utc::now()).await.unwrap();
    assert!(h.manager.open_order_for("NIFTY").await.is_none());

    match h.manager.handle_intent(banknifty_intent()).await {
        IntentOutcome::Rejected(reason) => assert_eq!(reason, "intraday loss limit reached"),
        other => panic!("expected a rejection, got {:?}", other),
    }
    assert_eq!(h.manager.orders().await.len(), 1);
    assert!(h.brokerage.placed_orders().await.is_empty());
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test]
async fn test_paper_cancel_before_fill() {
    let h = harness_with(OrderManagerConfig {
        mode: ExecutionMode::Paper,
        paper_fill_delay: Duration::from_secs(3600),
        ..OrderManagerConfig::default()
    });
    let mut events = h.manager.subscribe();
    let order = submitted(h.manager.handle_intent(nifty_intent()).await);

    h.manager.cancel_order(&order.id).await.unwrap();

    assert_eq!(
        h.manager.get_order(&order.id).await.unwrap().state,
        OrderState::Cancelled
    );
    assert_eq!(next_event(&mut events).await.name(), "order-cancelled");
    assert_eq!(h.brokerage.call_count(OP_CANCEL).await, 0);
    assert!(h.manager.open_order_for("NIFTY").await.is_none());
    h.manager.stop().await;
}

#[tokio::test]
async fn test_real_cancel_reaches_brokerage() {
    let h = harness(ExecutionMode::Real);
    let mut events = h.manager.subscribe();
    let order = submitted(h.manager.handle_intent(nifty_intent()).await);

    h.manager.cancel_order(&order.id).await.unwrap();

    assert_eq!(h.brokerage.call_count(OP_CANCEL).await, 1);
    assert_eq!(
        h.manager.get_order(&order.id).await.unwrap().state,
        OrderState::Cancelled
    );
    assert_eq!(next_event(&mut events).await.name(), "order-cancelled");

    // Already cancelled remotely
    let report = h.manager.reconcile_at(Utc::now()).await.unwrap();
    assert_eq!(report.filled, 0);
}

#[tokio::test]
async fn test_filled_order_cannot_be_cancelled() {
    let h = harness(ExecutionMode::Paper);
    let mut events = h.manager.subscribe();
    let order = submitted(h.manager.handle_intent(nifty_intent()).await);
    assert_eq!(next_event(&mut events).await.name(), "order-filled");

    let result = h.manager.cancel_order(&order.id).await;

    assert!(matches!(result, Err(EngineError::InvalidState(_))));
    assert_eq!(
        h.manager.get_order(&order.id).await.unwrap().state,
        OrderState::Filled
    );
    assert!(drain(&mut events).is_empty());
}

// =============================================================================
// Real lifecycle
// =============================================================================

#[tokio::test]
async fn test_real_order_reconciled_from_ledgers() {
    let h = harness(ExecutionMode::Real);
    let mut events = h.manager.subscribe();

    let order = submitted(h.manager.handle_intent(nifty_intent()).await);
    let remote_id = order.remote_id.clone().unwrap();
    let placed = h.brokerage.placed_orders().await;
    assert_eq!(placed.len(), 1);
    assert_eq!(placed[0].side, OrderSide::Buy);
    assert_eq!(placed[0].quantity, 75);

    // Still resting at the brokerage
    let report = h.manager.reconcile_at(Utc::now()).await.unwrap();
    assert_eq!(report.filled, 0);

    assert!(h.brokerage.complete_order(&remote_id, Price::new(dec!(50.5))).await);
    let report = h.manager.reconcile_at(Utc::now()).await.unwrap();
    assert_eq!(report.filled, 1);
    let filled = h.manager.get_order(&order.id).await.unwrap();
    assert_eq!(filled.state, OrderState::Filled);
    assert_eq!(filled.fill_price, Some(Price::new(dec!(50.5))));
    assert_eq!(next_event(&mut events).await.name(), "order-filled");

    h.brokerage
        .add_fill(FillLedgerEntry {
            trade_id: "T900".to_string(),
            remote_order_id: "MANUAL1".to_string(),
            symbol: "NIFTY".to_string(),
            side: OrderSide::Sell,
            price: Price::new(dec!(57.8)),
            quantity: 75,
            timestamp: Utc::now() + ChronoDuration::seconds(1),
        })
        .await;

    for _ in 0..2 {
        h.manager.reconcile_at(Utc::now()).await.unwrap();
    }

    let exited = h.manager.get_order(&order.id).await.unwrap();
    assert_eq!(exited.state, OrderState::ExitedTarget);
    let exit = exited.exit.unwrap();
    assert_eq!(exit.price, Price::new(dec!(57.8)));
    assert!(exit.pnl > Decimal::ZERO);
    assert_eq!(drain(&mut events), vec!["order-exited"]);

    let stats = h.manager.daily_stats().await;
    assert_eq!(stats.trades, 1);
    assert_eq!(stats.wins, 1);
}

#[tokio::test]
async fn test_brokerage_rejection_releases_instrument() {
    let h = harness(ExecutionMode::Real);
    let order = submitted(h.manager.handle_intent(nifty_intent()).await);
    let remote_id = order.remote_id.clone().unwrap();

    h.brokerage
        .set_order_status(&remote_id, LedgerStatus::Rejected, "Insufficient funds")
        .await;
    let report = h.manager.reconcile_at(Utc::now()).await.unwrap();

    assert_eq!(report.rejected, 1);
    let rejected = h.manager.get_order(&order.id).await.unwrap();
    assert_eq!(rejected.state, OrderState::Rejected);
    assert_eq!(rejected.status_message.as_deref(), Some("Insufficient funds"));
    assert!(h.manager.open_order_for("NIFTY").await.is_none());
}

#[tokio::test]
async fn test_rate_limited_ledger_backs_off_one_interval() {
    let h = harness(ExecutionMode::Real);
    submitted(h.manager.handle_intent(nifty_intent()).await);

    h.brokerage
        .fail_next(OP_ORDER_LEDGER, RemoteErrorKind::RateLimited, 1)
        .await;
    let report = h.manager.reconcile_at(Utc::now()).await.unwrap();
    assert!(report.ledger_unavailable);

    let report = h.manager.reconcile_at(Utc::now()).await.unwrap();
    assert!(report.backed_off);
    assert_eq!(h.brokerage.call_count(OP_FILL_LEDGER).await, 1);
}

#[tokio::test]
async fn test_running_loop_skips_one_interval_after_rate_limit() {
    let h = harness_with(OrderManagerConfig {
        mode: ExecutionMode::Real,
        reconcile_interval: Duration::from_millis(100),
        ..OrderManagerConfig::default()
    });
    submitted(h.manager.handle_intent(nifty_intent()).await);
    h.brokerage
        .fail_next(OP_ORDER_LEDGER, RemoteErrorKind::RateLimited, 1)
        .await;

    h.manager.start().await;

    // Pass at 0ms is rate limited, pass at 100ms stays off the ledgers
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.brokerage.call_count(OP_ORDER_LEDGER).await, 1);

    // Pass at 200ms resumes
    tokio::time::sleep(Duration::from_millis(110)).await;
    assert_eq!(h.brokerage.call_count(OP_ORDER_LEDGER).await, 2);

    h.manager.stop().await;
}

// =============================================================================
// Forced exits and cleanup
// =============================================================================

#[tokio::test]
async fn test_holding_limit_forces_timeout_exit() {
    let h = harness(ExecutionMode::Paper);
    let mut events = h.manager.subscribe();
    let order = submitted(h.manager.handle_intent(nifty_intent()).await);
    next_event(&mut events).await;
    h.feed.update_price(tick("NIFTY", dec!(51)));

    let later = Utc::now() + ChronoDuration::hours(5);
    let report = h.manager.reconcile_at(later).await.unwrap();

    assert_eq!(report.exited, 1);
    let exited = h.manager.get_order(&order.id).await.unwrap();
    assert_eq!(exited.state, OrderState::ExitedTimeout);
    assert_eq!(exited.exit.unwrap().price, Price::new(dec!(51)));
}

#[tokio::test]
async fn test_stale_unfilled_order_is_cleaned_up() {
    let h = harness_with(OrderManagerConfig {
        mode: ExecutionMode::Paper,
        paper_fill_delay: Duration::from_secs(3600),
        ..OrderManagerConfig::default()
    });
    let mut events = h.manager.subscribe();
    let order = submitted(h.manager.handle_intent(nifty_intent()).await);

    assert_eq!(h.manager.cleanup_stale_orders_at(Utc::now()).await, 0);
    let cleaned = h
        .manager
        .cleanup_stale_orders_at(Utc::now() + ChronoDuration::hours(3))
        .await;
    assert_eq!(cleaned, 1);

    assert_eq!(
        h.manager.get_order(&order.id).await.unwrap().state,
        OrderState::Cancelled
    );
    match next_event(&mut events).await {
        OrderEvent::Exited { pnl, .. } => assert_eq!(pnl, Decimal::ZERO),
        other => panic!("expected order-exited, got {}", other.name()),
    }

    h.manager.stop().await;
    submitted(h.manager.handle_intent(nifty_intent()).await);
}

#[tokio::test]
async fn test_loss_limit_forces_remaining_positions_out() {
    let h = paper_with_risk(tight_loss_limit());
    let mut events = h.manager.subscribe();
    let nifty = submitted(h.manager.handle_intent(nifty_intent()).await);
    let banknifty = submitted(h.manager.handle_intent(banknifty_intent()).await);
    next_event(&mut events).await;
    next_event(&mut events).await;

    h.feed.update_price(tick("BANKNIFTY", dec!(51)));
    h.feed.update_price(tick("NIFTY", dec!(42)));
    for _ in 0..2 {
        h.manager.reconcile_at(Utc::now()).await.unwrap();
    }

    assert_eq!(
        h.manager.get_order(&nifty.id).await.unwrap().state,
        OrderState::ExitedStopLoss
    );
    let forced = h.manager.get_order(&banknifty.id).await.unwrap();
    assert_eq!(forced.state, OrderState::ExitedRiskManagement);
    let exit = forced.exit.unwrap();
    assert_eq!(exit.reason, ExitReason::RiskManagement);
    assert_eq!(exit.price, Price::new(dec!(51)));
    assert!(h.manager.active_orders().await.is_empty());
}

#[tokio::test]
async fn test_real_forced_exit_places_closing_sell() {
    let h = harness(ExecutionMode::Real);
    let order = submitted(h.manager.handle_intent(nifty_intent()).await);
    let remote_id = order.remote_id.clone().unwrap();
    assert!(h.brokerage.complete_order(&remote_id, Price::new(dec!(50))).await);
    h.manager.reconcile_at(Utc::now()).await.unwrap();
    h.feed.update_price(tick("NIFTY", dec!(51)));

    let later = Utc::now() + ChronoDuration::hours(5);
    let report = h.manager.reconcile_at(later).await.unwrap();

    assert_eq!(report.exited, 1);
    let placed = h.brokerage.placed_orders().await;
    assert_eq!(placed.len(), 2);
    assert_eq!(placed[1].side, OrderSide::Sell);
    assert_eq!(placed[1].quantity, order.quantity);
    assert_eq!(
        h.manager.get_order(&order.id).await.unwrap().state,
        OrderState::ExitedTimeout
    );

    // The closing sell's fill does not exit the order twice
    let report = h.manager.reconcile_at(later).await.unwrap();
    assert_eq!(report.exited, 0);
}
