use crate::types::Price;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Option class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionType {
    #[serde(rename = "CE")]
    Call,
    #[serde(rename = "PE")]
    Put,
}

impl fmt::Display for OptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionType::Call => write!(f, "CE"),
            OptionType::Put => write!(f, "PE"),
        }
    }
}

/// Directional view on the underlying
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Bullish,
    Bearish,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Bullish => write!(f, "bullish"),
            Direction::Bearish => write!(f, "bearish"),
        }
    }
}

/// Whether orders are simulated locally or routed to the brokerage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Paper,
    Real,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Paper => write!(f, "paper"),
            ExecutionMode::Real => write!(f, "real"),
        }
    }
}

pub const DEFAULT_STRATEGY: &str = "default";

/// A candidate trade produced by the strategy layer.
///
/// Immutable once built; the order manager consumes each intent at most once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeIntent {
    pub id: String,
    /// Underlying instrument, e.g. `NIFTY`. One open order per instrument.
    pub instrument: String,
    /// Exchange trading symbol of the option contract, when already resolved
    pub option_symbol: Option<String>,
    pub strike: Option<Decimal>,
    pub expiry: Option<NaiveDate>,
    pub direction: Direction,
    pub option_type: OptionType,
    pub entry_price: Price,
    pub target_price: Price,
    pub stop_loss: Price,
    /// Signal confidence, 0-100
    pub confidence: f64,
    /// Strategy bucket used for win-rate statistics
    pub strategy: String,
    pub timestamp: DateTime<Utc>,
}

impl TradeIntent {
    pub fn new(
        instrument: impl Into<String>,
        direction: Direction,
        option_type: OptionType,
        entry_price: Price,
        target_price: Price,
        stop_loss: Price,
        confidence: f64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            instrument: instrument.into(),
            option_symbol: None,
            strike: None,
            expiry: None,
            direction,
            option_type,
            entry_price,
            target_price,
            stop_loss,
            confidence,
            strategy: DEFAULT_STRATEGY.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_option_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.option_symbol = Some(symbol.into());
        self
    }

    pub fn with_contract(mut self, strike: Decimal, expiry: NaiveDate) -> Self {
        self.strike = Some(strike);
        self.expiry = Some(expiry);
        self
    }

    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = strategy.into();
        self
    }

    /// Symbol under which live prices for this trade are published
    pub fn market_symbol(&self) -> &str {
        self.option_symbol.as_deref().unwrap_or(&self.instrument)
    }

    /// Reward over risk, `0.0` when the stop sits on the entry price
    pub fn risk_reward_ratio(&self) -> f64 {
        let reward = (self.target_price.value() - self.entry_price.value()).abs();
        let risk = (self.entry_price.value() - self.stop_loss.value()).abs();
        if risk.is_zero() {
            return 0.0;
        }
        (reward / risk).to_f64().unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_intent() -> TradeIntent {
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

    #[test]
    fn test_market_symbol_falls_back_to_instrument() {
        let intent = sample_intent();
        assert_eq!(intent.market_symbol(), "NIFTY");

        let intent = intent.with_option_symbol("NIFTY25OCT25000CE");
        assert_eq!(intent.market_symbol(), "NIFTY25OCT25000CE");
    }

    #[test]
    fn test_risk_reward_ratio() {
        let intent = sample_intent();
        assert!((intent.risk_reward_ratio() - 1.0).abs() < 1e-9);

        let mut flat = sample_intent();
        flat.stop_loss = flat.entry_price;
        assert_eq!(flat.risk_reward_ratio(), 0.0);
    }

    #[test]
    fn test_option_type_serializes_as_exchange_code() {
        assert_eq!(serde_json::to_string(&OptionType::Put).unwrap(), "\"PE\"");
        assert_eq!(ExecutionMode::Real.to_string(), "real");
    }
}
