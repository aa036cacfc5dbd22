use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{EngineError, Result};
use crate::types::{ExecutionMode, Price, TradeIntent};

/// Order lifecycle state.
///
/// `Placed` and `Filled` are the only non-terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderState {
    Placed,
    Filled,
    ExitedTarget,
    ExitedStopLoss,
    ExitedTimeout,
    ExitedRiskManagement,
    Cancelled,
    Rejected,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderState::Placed | OrderState::Filled)
    }

    /// Allowed forward transitions
    pub fn can_transition_to(&self, next: OrderState) -> bool {
        match self {
            OrderState::Placed => matches!(
                next,
                OrderState::Filled | OrderState::Cancelled | OrderState::Rejected
            ),
            OrderState::Filled => matches!(
                next,
                OrderState::ExitedTarget
                    | OrderState::ExitedStopLoss
                    | OrderState::ExitedTimeout
                    | OrderState::ExitedRiskManagement
            ),
            _ => false,
        }
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Why a position was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Target,
    StopLoss,
    Timeout,
    RiskManagement,
    /// Force-terminated by stale-order cleanup
    StaleCleanup,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExitReason::Target => "target",
            ExitReason::StopLoss => "stop-loss",
            ExitReason::Timeout => "timeout",
            ExitReason::RiskManagement => "risk-management",
            ExitReason::StaleCleanup => "stale-cleanup",
        };
        write!(f, "{}", name)
    }
}

/// Exit fields, written once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitRecord {
    pub price: Price,
    pub time: DateTime<Utc>,
    pub reason: ExitReason,
    /// Realized P&L net of transaction costs
    pub pnl: Decimal,
}

/// An order owned by the lifecycle manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub remote_id: Option<String>,
    pub intent: TradeIntent,
    /// Symbol the order trades and is priced under
    pub symbol: String,
    pub quantity: u32,
    pub lot_size: u32,
    pub mode: ExecutionMode,
    pub state: OrderState,
    /// Risk score at admission
    pub risk_score: f64,
    /// Round-trip cost estimated at admission
    pub estimated_cost: Decimal,
    /// Costs accrued on executed legs
    pub transaction_cost: Decimal,
    pub placed_at: DateTime<Utc>,
    pub fill_price: Option<Price>,
    pub filled_at: Option<DateTime<Utc>>,
    pub exit: Option<ExitRecord>,
    pub status_message: Option<String>,
}

impl Order {
    pub fn new(
        intent: TradeIntent,
        quantity: u32,
        lot_size: u32,
        mode: ExecutionMode,
        risk_score: f64,
        estimated_cost: Decimal,
        placed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            remote_id: None,
            symbol: intent.market_symbol().to_string(),
            intent,
            quantity,
            lot_size,
            mode,
            state: OrderState::Placed,
            risk_score,
            estimated_cost,
            transaction_cost: Decimal::ZERO,
            placed_at,
            fill_price: None,
            filled_at: None,
            exit: None,
            status_message: None,
        }
    }

    pub fn instrument(&self) -> &str {
        &self.intent.instrument
    }

    pub fn is_open(&self) -> bool {
        !self.state.is_terminal()
    }

    pub fn has_exited(&self) -> bool {
        self.exit.is_some()
    }

    fn transition(&mut self, next: OrderState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(EngineError::InvalidState(format!(
                "order {} cannot move from {} to {}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    pub fn mark_filled(&mut self, price: Price, time: DateTime<Utc>, entry_cost: Decimal) -> Result<()> {
        self.transition(OrderState::Filled)?;
        self.fill_price = Some(price);
        self.filled_at = Some(time);
        self.transaction_cost += entry_cost;
        Ok(())
    }

    pub fn mark_cancelled(&mut self, message: impl Into<String>) -> Result<()> {
        self.transition(OrderState::Cancelled)?;
        self.status_message = Some(message.into());
        Ok(())
    }

    pub fn mark_rejected(&mut self, message: impl Into<String>) -> Result<()> {
        self.transition(OrderState::Rejected)?;
        self.status_message = Some(message.into());
        Ok(())
    }

    /// Record the exit of a filled order.
    ///
    /// Fails if exit fields are already set; they are never overwritten.
    pub fn record_exit(
        &mut self,
        price: Price,
        time: DateTime<Utc>,
        reason: ExitReason,
        exit_cost: Decimal,
    ) -> Result<&ExitRecord> {
        if self.exit.is_some() {
            return Err(EngineError::InvalidState(format!(
                "order {} already exited",
                self.id
            )));
        }
        let fill_price = self.fill_price.ok_or_else(|| {
            EngineError::InvalidState(format!("order {} exited without a fill", self.id))
        })?;

        let next = match reason {
            ExitReason::Target => OrderState::ExitedTarget,
            ExitReason::StopLoss => OrderState::ExitedStopLoss,
            ExitReason::Timeout | ExitReason::StaleCleanup => OrderState::ExitedTimeout,
            ExitReason::RiskManagement => OrderState::ExitedRiskManagement,
        };
        self.transition(next)?;

        self.transaction_cost += exit_cost;
        let gross = (price - fill_price).notional(self.quantity);
        let record = self.exit.insert(ExitRecord {
            price,
            time,
            reason,
            pnl: gross - self.transaction_cost,
        });
        Ok(&*record)
    }

    /// Entry notional at the fill price, or the intended entry before a fill
    pub fn entry_notional(&self) -> Decimal {
        self.fill_price
            .unwrap_or(self.intent.entry_price)
            .notional(self.quantity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, OptionType};
    use rust_decimal_macros::dec;

    fn order() -> Order {
        let intent = TradeIntent::new(
            "NIFTY",
            Direction::Bullish,
            OptionType::Call,
            Price::new(dec!(50)),
            Price::new(dec!(57.5)),
            Price::new(dec!(42.5)),
            85.0,
        );
        Order::new(intent, 75, 75, ExecutionMode::Paper, 25.0, dec!(40), Utc::now())
    }

    #[test]
    fn test_states_are_monotonic() {
        assert!(OrderState::Placed.can_transition_to(OrderState::Filled));
        assert!(!OrderState::Filled.can_transition_to(OrderState::Placed));
        assert!(!OrderState::Filled.can_transition_to(OrderState::Cancelled));
        assert!(!OrderState::ExitedTarget.can_transition_to(OrderState::ExitedStopLoss));
        assert!(OrderState::Cancelled.is_terminal());
        assert!(!OrderState::Filled.is_terminal());
    }

    #[test]
    fn test_exit_is_written_once() {
        let mut order = order();
        order.mark_filled(Price::new(dec!(50)), Utc::now(), dec!(10)).unwrap();

        let pnl = order
            .record_exit(Price::new(dec!(58)), Utc::now(), ExitReason::Target, dec!(15))
            .unwrap()
            .pnl;
        // (58 - 50) * 75 - 25
        assert_eq!(pnl, dec!(575));
        assert_eq!(order.state, OrderState::ExitedTarget);

        let again = order.record_exit(Price::new(dec!(40)), Utc::now(), ExitReason::StopLoss, dec!(0));
        assert!(matches!(again, Err(EngineError::InvalidState(_))));
        assert_eq!(order.exit.as_ref().unwrap().price, Price::new(dec!(58)));
    }

    #[test]
    fn test_cannot_exit_unfilled_order() {
        let mut order = order();
        assert!(order
            .record_exit(Price::new(dec!(58)), Utc::now(), ExitReason::Target, dec!(0))
            .is_err());
        assert!(order.exit.is_none());
        assert_eq!(order.state, OrderState::Placed);
    }

    #[test]
    fn test_cancel_only_from_placed() {
        let mut order = order();
        order.mark_filled(Price::new(dec!(50)), Utc::now(), dec!(0)).unwrap();
        assert!(order.mark_cancelled("user").is_err());
        assert_eq!(order.state, OrderState::Filled);
    }
}
