use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::error::{EngineError, Result};
use crate::feed::MarketDataFeedManager;
use crate::logging::ThrottledLogger;
use crate::oms::costs::{CostConfig, SlippageConfig, SlippageModel, TransactionCostModel};
use crate::oms::events::{OrderEvent, OrderEventBus};
use crate::oms::order::{Order, OrderState};
use crate::recovery::ErrorRecoverySupervisor;
use crate::risk::{RiskAssessment, RiskEngine, SizingRecommendation, TradeEvent};
use crate::traits::{BrokerageClient, OptionContractQuery, OrderRequest, OrderSide};
use crate::types::{ExecutionMode, TradeIntent};

pub const ACCOUNT_CLASS: &str = "account";
pub const INSTRUMENT_LOOKUP_CLASS: &str = "instrument_lookup";
pub const ORDER_PLACEMENT_CLASS: &str = "order_placement";
pub const ORDER_CANCEL_CLASS: &str = "order_cancel";
pub const ORDER_LEDGER_CLASS: &str = "order_ledger";
pub const FILL_LEDGER_CLASS: &str = "fill_ledger";
pub const QUOTE_CLASS: &str = "quote";

/// Order lifecycle configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderManagerConfig {
    pub mode: ExecutionMode,
    #[serde(with = "crate::config::millis")]
    pub reconcile_interval: Duration,
    /// Delay before a paper order fills at the intent price
    #[serde(with = "crate::config::millis")]
    pub paper_fill_delay: Duration,
    /// Filled orders older than this are closed regardless of price
    #[serde(with = "crate::config::millis")]
    pub max_holding: Duration,
    /// Age past which stale-order cleanup force-terminates orders
    #[serde(with = "crate::config::millis")]
    pub stale_order_age: Duration,
    #[serde(with = "crate::config::millis")]
    pub stale_cleanup_interval: Duration,
    /// Live/fill price ratios outside this band are treated as bad data
    pub min_price_ratio: Decimal,
    pub max_price_ratio: Decimal,
    /// Series volatility above which sizing is scaled down
    pub volatility_reference: f64,
    #[serde(with = "crate::config::millis")]
    pub log_throttle_interval: Duration,
    pub costs: CostConfig,
    pub slippage: SlippageConfig,
}

impl Default for OrderManagerConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Paper,
            reconcile_interval: Duration::from_secs(3),
            paper_fill_delay: Duration::from_secs(1),
            max_holding: Duration::from_secs(4 * 3600 + 1800), // 4.5 hours
            stale_order_age: Duration::from_secs(2 * 3600),
            stale_cleanup_interval: Duration::from_secs(300),
            min_price_ratio: Decimal::new(2, 1), // 0.2
            max_price_ratio: Decimal::from(5),
            volatility_reference: 0.02,
            log_throttle_interval: Duration::from_secs(60),
            costs: CostConfig::default(),
            slippage: SlippageConfig::default(),
        }
    }
}

/// Mode-independent admission decision for an intent
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderPlan {
    pub symbol: String,
    pub account_value: Decimal,
    pub assessment: RiskAssessment,
    /// `None` when the order is blocked
    pub sizing: Option<SizingRecommendation>,
    pub volatility_multiplier: f64,
    pub quantity: u32,
    pub lot_size: u32,
    pub estimated_cost: Decimal,
}

/// What happened to an intent
#[derive(Debug, Clone)]
pub enum IntentOutcome {
    Submitted(Order),
    Blocked(RiskAssessment),
    Rejected(String),
}

/// Holds an instrument while its intent is being admitted
struct Reservation<'a> {
    reserved: &'a std::sync::Mutex<HashSet<String>>,
    instrument: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        let mut reserved = match self.reserved.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        reserved.remove(&self.instrument);
    }
}

/// Turns trade intents into orders and tracks them to completion.
///
/// Paper and real orders share every decision up to submission; paper orders
/// fill locally and exit against live feed prices, real orders are
/// reconciled against the brokerage order and fill ledgers.
pub struct OrderLifecycleManager {
    pub(super) config: OrderManagerConfig,
    pub(super) mode: RwLock<ExecutionMode>,
    pub(super) brokerage: Arc<dyn BrokerageClient>,
    pub(super) supervisor: Arc<ErrorRecoverySupervisor>,
    pub(super) feed: Option<Arc<MarketDataFeedManager>>,
    pub(super) risk: RwLock<RiskEngine>,
    pub(super) orders: RwLock<HashMap<String, Order>>,
    reserved: std::sync::Mutex<HashSet<String>>,
    pub(super) events: OrderEventBus,
    pub(super) costs: TransactionCostModel,
    pub(super) slippage: SlippageModel,
    /// Set after a rate-limited reconciliation pass
    pub(super) skip_next_pass: AtomicBool,
    pub(super) throttle: ThrottledLogger,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: AtomicBool,
}

impl OrderLifecycleManager {
    pub fn new(
        config: OrderManagerConfig,
        risk: RiskEngine,
        brokerage: Arc<dyn BrokerageClient>,
        supervisor: Arc<ErrorRecoverySupervisor>,
        feed: Option<Arc<MarketDataFeedManager>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            mode: RwLock::new(config.mode),
            costs: TransactionCostModel::new(config.costs.clone()),
            slippage: SlippageModel::new(config.slippage.clone()),
            throttle: ThrottledLogger::new(config.log_throttle_interval),
            config,
            brokerage,
            supervisor,
            feed,
            risk: RwLock::new(risk),
            orders: RwLock::new(HashMap::new()),
            reserved: std::sync::Mutex::new(HashSet::new()),
            events: OrderEventBus::default(),
            skip_next_pass: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn events(&self) -> &OrderEventBus {
        &self.events
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<OrderEvent> {
        self.events.subscribe()
    }

    pub async fn execution_mode(&self) -> ExecutionMode {
        *self.mode.read().await
    }

    /// Mode used for new orders; existing orders keep theirs
    pub async fn set_execution_mode(&self, mode: ExecutionMode) {
        let mut current = self.mode.write().await;
        if *current != mode {
            warn!("Execution mode switched from {} to {}", *current, mode);
            *current = mode;
        }
    }

    pub async fn get_order(&self, order_id: &str) -> Option<Order> {
        self.orders.read().await.get(order_id).cloned()
    }

    pub async fn orders(&self) -> Vec<Order> {
        self.orders.read().await.values().cloned().collect()
    }

    pub async fn open_order_for(&self, instrument: &str) -> Option<Order> {
        self.orders
            .read()
            .await
            .values()
            .find(|order| order.is_open() && order.instrument() == instrument)
            .cloned()
    }

    /// Read access to the risk engine
    pub async fn risk_snapshot<T>(&self, f: impl FnOnce(&RiskEngine) -> T) -> T {
        f(&*self.risk.read().await)
    }

    fn try_reserve(&self, instrument: &str) -> Option<Reservation<'_>> {
        let mut reserved = match self.reserved.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !reserved.insert(instrument.to_string()) {
            return None;
        }
        Some(Reservation {
            reserved: &self.reserved,
            instrument: instrument.to_string(),
        })
    }

    fn reject(&self, intent: TradeIntent, reason: String) -> IntentOutcome {
        info!("Intent {} for {} rejected: {}", intent.id, intent.instrument, reason);
        self.events.publish(OrderEvent::Rejected {
            intent,
            reason: reason.clone(),
        });
        IntentOutcome::Rejected(reason)
    }

    /// Admit, size and submit one intent.
    ///
    /// Intents for an instrument that already has an open order are rejected,
    /// never queued.
    pub async fn handle_intent(self: &Arc<Self>, intent: TradeIntent) -> IntentOutcome {
        let _reservation = match self.try_reserve(&intent.instrument) {
            Some(reservation) => reservation,
            None => {
                let reason = format!("intent for {} already in progress", intent.instrument);
                return self.reject(intent, reason);
            }
        };

        if let Some(open) = self.open_order_for(&intent.instrument).await {
            let reason = format!("order {} already open for {}", open.id, intent.instrument);
            return self.reject(intent, reason);
        }

        let now = Utc::now();
        if !self.risk.read().await.can_open_new_position(now) {
            return self.reject(intent, "daily position cap reached".to_string());
        }

        self.refresh_account_value().await;

        // Anything opened now would be closed by the next reconciliation pass
        if self.risk.read().await.should_force_risk_exit(now) {
            return self.reject(intent, "intraday loss limit reached".to_string());
        }

        let mut intent = intent;
        if let Err(e) = self.resolve_contract(&mut intent).await {
            let reason = format!("contract lookup failed: {}", e);
            return self.reject(intent, reason);
        }

        let plan = self.plan_order_at(&intent, now).await;
        if plan.assessment.blocked {
            self.events.publish(OrderEvent::Blocked {
                intent,
                assessment: plan.assessment.clone(),
            });
            return IntentOutcome::Blocked(plan.assessment);
        }
        if plan.quantity == 0 {
            let reason = plan
                .sizing
                .as_ref()
                .and_then(|s| s.warnings.last().cloned())
                .unwrap_or_else(|| "position size below one lot".to_string());
            return self.reject(intent, reason);
        }
        if let Some(sizing) = &plan.sizing {
            for warning in &sizing.warnings {
                warn!("Sizing {}: {}", intent.instrument, warning);
            }
        }

        let mode = self.execution_mode().await;
        let mut order = Order::new(
            intent,
            plan.quantity,
            plan.lot_size,
            mode,
            plan.assessment.score,
            plan.estimated_cost,
            now,
        );
        self.risk
            .write()
            .await
            .record_trade_at(TradeEvent::Opened, &order.intent, now);

        match mode {
            ExecutionMode::Paper => {
                self.orders.write().await.insert(order.id.clone(), order.clone());
                self.schedule_paper_fill(order.id.clone()).await;
            }
            ExecutionMode::Real => {
                let request = OrderRequest::market(order.symbol.clone(), OrderSide::Buy, order.quantity)
                    .with_tag(order.id.chars().take(8).collect::<String>());
                let placed = self
                    .supervisor
                    .execute_with_recovery(ORDER_PLACEMENT_CLASS, || {
                        self.brokerage.place_order(&request)
                    })
                    .await;

                match placed {
                    Ok(remote_id) => {
                        order.remote_id = Some(remote_id);
                        self.orders.write().await.insert(order.id.clone(), order.clone());
                    }
                    Err(e) => {
                        let reason = e.to_string();
                        error!("Order placement for {} failed: {}", order.instrument(), reason);
                        if let Err(e) = order.mark_rejected(reason.clone()) {
                            error!("{}", e);
                        }
                        self.risk
                            .write()
                            .await
                            .record_trade_at(TradeEvent::Released, &order.intent, now);
                        let intent = order.intent.clone();
                        self.orders.write().await.insert(order.id.clone(), order);
                        return self.reject(intent, reason);
                    }
                }
            }
        }

        info!(
            "Placed {} order {} for {} x{} (score {:.1}, est. cost {})",
            mode,
            order.id,
            order.symbol,
            order.quantity,
            order.risk_score,
            order.estimated_cost
        );
        IntentOutcome::Submitted(order)
    }

    async fn refresh_account_value(&self) {
        let result = self
            .supervisor
            .execute_with_recovery(ACCOUNT_CLASS, || self.brokerage.account_value())
            .await;

        match result {
            Ok(value) => self.risk.write().await.set_account_value(value),
            Err(e) => warn!("Account value unavailable, using cached value: {}", e),
        }
    }

    async fn resolve_contract(&self, intent: &mut TradeIntent) -> Result<()> {
        if intent.option_symbol.is_some() {
            return Ok(());
        }
        let (strike, expiry) = match (intent.strike, intent.expiry) {
            (Some(strike), Some(expiry)) => (strike, expiry),
            _ => return Ok(()),
        };

        let query = OptionContractQuery {
            instrument: intent.instrument.clone(),
            strike,
            option_type: intent.option_type,
            expiry,
        };
        let contract = self
            .supervisor
            .execute_with_recovery(INSTRUMENT_LOOKUP_CLASS, || {
                self.brokerage.lookup_option_contract(&query)
            })
            .await?;

        debug!(
            "Resolved {} {} {} to {}",
            intent.instrument, strike, intent.option_type, contract.trading_symbol
        );
        intent.option_symbol = Some(contract.trading_symbol);
        Ok(())
    }

    fn volatility_multiplier(&self, symbol: &str) -> f64 {
        let volatility = self.feed.as_ref().and_then(|feed| feed.volatility(symbol));
        match volatility {
            Some(v) if v > self.config.volatility_reference => {
                (self.config.volatility_reference / v).clamp(0.5, 1.0)
            }
            _ => 1.0,
        }
    }

    /// Risk check, sizing and cost estimate for an intent.
    ///
    /// Independent of execution mode.
    pub async fn plan_order_at(&self, intent: &TradeIntent, now: DateTime<Utc>) -> OrderPlan {
        let risk = self.risk.read().await;
        let symbol = intent.market_symbol().to_string();
        let account_value = risk.account_value();
        let lot_size = risk.lot_size(&intent.instrument);
        let volatility_multiplier = self.volatility_multiplier(&symbol);

        let assessment = risk.assess_order_risk_at(
            intent,
            risk.daily_pnl(now),
            risk.ledger().open_positions(),
            now,
        );

        if assessment.blocked {
            return OrderPlan {
                symbol,
                account_value,
                assessment,
                sizing: None,
                volatility_multiplier,
                quantity: 0,
                lot_size,
                estimated_cost: Decimal::ZERO,
            };
        }

        let sizing = risk.calculate_optimal_position_size(
            intent,
            volatility_multiplier,
            account_value,
            assessment.score,
        );
        let quantity = sizing.quantity;
        let estimated_cost = self.costs.estimate_round_trip(intent.entry_price, quantity);

        OrderPlan {
            symbol,
            account_value,
            assessment,
            sizing: Some(sizing),
            volatility_multiplier,
            quantity,
            lot_size,
            estimated_cost,
        }
    }

    async fn schedule_paper_fill(self: &Arc<Self>, order_id: String) {
        let manager = self.clone();
        let delay = self.config.paper_fill_delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.complete_paper_fill(&order_id).await;
        });

        let mut tasks = self.tasks.lock().await;
        tasks.retain(|handle| !handle.is_finished());
        tasks.push(handle);
    }

    async fn complete_paper_fill(&self, order_id: &str) {
        let filled = {
            let mut orders = self.orders.write().await;
            let order = match orders.get_mut(order_id) {
                Some(order) if order.state == OrderState::Placed => order,
                _ => return,
            };
            let price = order.intent.entry_price;
            let cost = self.costs.leg_cost(OrderSide::Buy, price, order.quantity);
            if let Err(e) = order.mark_filled(price, Utc::now(), cost) {
                error!("Paper fill failed: {}", e);
                return;
            }
            order.clone()
        };

        info!("Paper order {} filled at {}", filled.id, filled.intent.entry_price);
        self.events.publish(OrderEvent::Filled {
            message: format!(
                "Paper BUY {} x{} filled at {}",
                filled.symbol, filled.quantity, filled.intent.entry_price
            ),
            order: filled,
        });
    }

    /// Cancel an order that has not filled yet.
    ///
    /// Refused locally, without a remote call, when the order's mode differs
    /// from the manager's current mode.
    pub async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let order = self
            .get_order(order_id)
            .await
            .ok_or_else(|| EngineError::OrderNotFound(order_id.to_string()))?;

        let mode = self.execution_mode().await;
        if order.mode != mode {
            error!(
                "Refusing to cancel {} order {} while running in {} mode",
                order.mode, order.id, mode
            );
            return Err(EngineError::ModeMismatch {
                manager: mode,
                order: order.mode,
            });
        }
        if order.state != OrderState::Placed {
            error!("Refusing to cancel order {} in state {}", order.id, order.state);
            return Err(EngineError::InvalidState(format!(
                "order {} is {}, only placed orders can be cancelled",
                order.id, order.state
            )));
        }

        if order.mode == ExecutionMode::Real {
            if let Some(remote_id) = &order.remote_id {
                self.supervisor
                    .execute_with_recovery(ORDER_CANCEL_CLASS, || {
                        self.brokerage.cancel_order(remote_id)
                    })
                    .await?;
            }
        }

        let cancelled = {
            let mut orders = self.orders.write().await;
            let order = orders
                .get_mut(order_id)
                .ok_or_else(|| EngineError::OrderNotFound(order_id.to_string()))?;
            order.mark_cancelled("cancelled by request")?;
            order.clone()
        };

        self.risk
            .write()
            .await
            .record_trade_at(TradeEvent::Released, &cancelled.intent, Utc::now());
        info!("Order {} cancelled", cancelled.id);
        self.events.publish(OrderEvent::Cancelled {
            message: format!("Order for {} cancelled", cancelled.symbol),
            order: cancelled,
        });
        Ok(())
    }

    /// Start the reconciliation and stale-order cleanup loops
    pub async fn start(self: &Arc<Self>) {
        self.shutdown.store(false, Ordering::SeqCst);

        let reconcile = {
            let manager = self.clone();
            tokio::spawn(async move {
                while !manager.shutdown.load(Ordering::SeqCst) {
                    if let Err(e) = manager.reconcile_at(Utc::now()).await {
                        warn!("Reconciliation pass failed: {}", e);
                    }
                    tokio::time::sleep(manager.config.reconcile_interval).await;
                }
            })
        };

        let cleanup = {
            let manager = self.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(manager.config.stale_cleanup_interval).await;
                    if manager.shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    manager.cleanup_stale_orders_at(Utc::now()).await;
                }
            })
        };

        let mut tasks = self.tasks.lock().await;
        tasks.push(reconcile);
        tasks.push(cleanup);
        info!(
            "Order manager started in {} mode, reconciling every {:?}",
            self.execution_mode().await,
            self.config.reconcile_interval
        );
    }

    /// Stop all loops and pending paper fills
    pub async fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for handle in self.tasks.lock().await.drain(..) {
            handle.abort();
        }
        info!("Order manager stopped");
    }
}
