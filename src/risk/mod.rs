pub mod engine;
pub mod ledger;
pub mod session;

pub use engine::{
    RiskAssessment, RiskComponents, RiskConfig, RiskEngine, SizingRecommendation, StatsSource,
};
pub use ledger::{RiskLedger, StrategyStats, TradeEvent, TradeOutcome};
pub use session::TradingSession;
