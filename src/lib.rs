//! Options order execution and risk gating.
//!
//! Trade intents are risk-checked and sized, submitted in paper or real
//! mode and tracked to exit by a reconciliation loop. Remote calls go through
//! a retry and circuit-breaker supervisor; live prices come from a push feed
//! that fails over to snapshot polling.

pub mod config;
pub mod connectors;
pub mod error;
pub mod feed;
pub mod logging;
pub mod monitoring;
pub mod oms;
pub mod recovery;
pub mod risk;
pub mod traits;
pub mod types;

pub use config::{BrokerageSettings, EngineConfig, Secret};
pub use error::{EngineError, RemoteErrorKind, Result};
pub use feed::{FeedConfig, FeedHealth, FeedMode, MarketDataFeedManager, PriceCallback};
pub use logging::{init_logging, ThrottledLogger};
pub use monitoring::{HealthCheckResult, HealthChecker, HealthStatus};
pub use oms::{
    ActiveOrderView, DailyStats, ExitReason, IntentOutcome, Order, OrderEvent, OrderEventBus,
    OrderLifecycleManager, OrderManagerConfig, OrderState,
};
pub use recovery::{CircuitState, ErrorRecoverySupervisor, RetryConfig, SupervisorConfig};
pub use risk::{RiskAssessment, RiskConfig, RiskEngine, SizingRecommendation, TradeEvent};
pub use traits::{BrokerageClient, PriceUpdate, PushTransport, Reauthenticator, SnapshotSource};
pub use types::{Direction, ExecutionMode, OptionType, Price, TradeIntent};
