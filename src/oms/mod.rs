pub mod costs;
pub mod events;
pub mod manager;
pub mod order;
pub mod reconciliation;
pub mod reporting;

pub use costs::{CostConfig, SlippageConfig, SlippageModel, TransactionCostModel};
pub use events::{OrderEvent, OrderEventBus};
pub use manager::{IntentOutcome, OrderLifecycleManager, OrderManagerConfig, OrderPlan};
pub use order::{ExitReason, ExitRecord, Order, OrderState};
pub use reconciliation::{classify_exit, ReconcileReport};
pub use reporting::{ActiveOrderView, DailyStats};
