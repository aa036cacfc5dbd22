use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use crate::risk::session::TradingSession;
use crate::types::{Direction, TradeIntent};

pub const DEFAULT_OUTCOME_WINDOW: usize = 200;

/// Ledger update reported by the order manager
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TradeEvent {
    /// Order admitted; counts as an open position
    Opened,
    /// Position closed with realized P&L
    Closed { pnl: Decimal },
    /// Admitted order that never became a position (cancelled or rejected)
    Released,
}

/// One realized trade in the sliding window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeOutcome {
    pub strategy: String,
    pub instrument: String,
    pub pnl: Decimal,
    pub closed_at: DateTime<Utc>,
}

/// Aggregates over a set of outcomes
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StrategyStats {
    pub samples: usize,
    pub wins: usize,
    pub losses: usize,
    /// Closed at exactly zero P&L; neither a win nor a loss
    pub scratches: usize,
    /// Wins over decided (non-scratch) trades
    pub win_rate: f64,
    pub avg_win: f64,
    /// Average loss magnitude, positive
    pub avg_loss: f64,
    pub profit_factor: f64,
    pub expectancy: f64,
}

impl StrategyStats {
    const MAX_PROFIT_FACTOR: f64 = 10.0;

    pub fn from_outcomes<'a>(outcomes: impl Iterator<Item = &'a TradeOutcome>) -> Self {
        let mut wins = 0usize;
        let mut losses = 0usize;
        let mut scratches = 0usize;
        let mut gross_win = 0.0;
        let mut gross_loss = 0.0;

        for outcome in outcomes {
            let pnl = outcome.pnl.to_f64().unwrap_or(0.0);
            if pnl > 0.0 {
                wins += 1;
                gross_win += pnl;
            } else if pnl < 0.0 {
                losses += 1;
                gross_loss += -pnl;
            } else {
                scratches += 1;
            }
        }

        let samples = wins + losses + scratches;
        let decided = wins + losses;
        if decided == 0 {
            return Self {
                samples,
                scratches,
                ..Self::default()
            };
        }

        let win_rate = wins as f64 / decided as f64;
        let avg_win = if wins > 0 { gross_win / wins as f64 } else { 0.0 };
        let avg_loss = if losses > 0 { gross_loss / losses as f64 } else { 0.0 };
        let profit_factor = if gross_loss > 0.0 {
            (gross_win / gross_loss).min(Self::MAX_PROFIT_FACTOR)
        } else if gross_win > 0.0 {
            Self::MAX_PROFIT_FACTOR
        } else {
            0.0
        };

        Self {
            samples,
            wins,
            losses,
            scratches,
            win_rate,
            avg_win,
            avg_loss,
            profit_factor,
            expectancy: win_rate * avg_win - (1.0 - win_rate) * avg_loss,
        }
    }

    /// Average win over average loss, `None` when either side is empty
    pub fn payoff_ratio(&self) -> Option<f64> {
        if self.avg_win > 0.0 && self.avg_loss > 0.0 {
            Some(self.avg_win / self.avg_loss)
        } else {
            None
        }
    }
}

/// Running P&L and exposure counters.
///
/// Day and week rollover happen lazily: readers compare the stored boundary
/// with `now`, and the next write resets the stale counters. Open-position
/// counts never roll over.
#[derive(Debug, Clone, Serialize)]
pub struct RiskLedger {
    daily_pnl: Decimal,
    weekly_pnl: Decimal,
    daily_trades: u32,
    open_positions: u32,
    #[serde(skip)]
    correlation: HashMap<(String, Direction), u32>,
    outcomes: VecDeque<TradeOutcome>,
    window: usize,
    day: Option<NaiveDate>,
    week: Option<(i32, u32)>,
}

impl RiskLedger {
    pub fn new(window: usize) -> Self {
        Self {
            daily_pnl: Decimal::ZERO,
            weekly_pnl: Decimal::ZERO,
            daily_trades: 0,
            open_positions: 0,
            correlation: HashMap::new(),
            outcomes: VecDeque::with_capacity(window),
            window: window.max(1),
            day: None,
            week: None,
        }
    }

    fn is_current_day(&self, session: &TradingSession, now: DateTime<Utc>) -> bool {
        self.day == Some(session.local_date(now))
    }

    fn is_current_week(&self, session: &TradingSession, now: DateTime<Utc>) -> bool {
        self.week == Some(session.local_week(now))
    }

    /// Reset counters whose period has ended
    pub fn roll_over(&mut self, session: &TradingSession, now: DateTime<Utc>) {
        if !self.is_current_day(session, now) {
            self.daily_pnl = Decimal::ZERO;
            self.daily_trades = 0;
            self.day = Some(session.local_date(now));
        }
        if !self.is_current_week(session, now) {
            self.weekly_pnl = Decimal::ZERO;
            self.week = Some(session.local_week(now));
        }
    }

    pub fn daily_pnl_at(&self, session: &TradingSession, now: DateTime<Utc>) -> Decimal {
        if self.is_current_day(session, now) {
            self.daily_pnl
        } else {
            Decimal::ZERO
        }
    }

    pub fn weekly_pnl_at(&self, session: &TradingSession, now: DateTime<Utc>) -> Decimal {
        if self.is_current_week(session, now) {
            self.weekly_pnl
        } else {
            Decimal::ZERO
        }
    }

    /// Positions opened during the current day
    pub fn daily_trades_at(&self, session: &TradingSession, now: DateTime<Utc>) -> u32 {
        if self.is_current_day(session, now) {
            self.daily_trades
        } else {
            0
        }
    }

    pub fn open_positions(&self) -> u32 {
        self.open_positions
    }

    pub fn correlated_positions(&self, instrument: &str, direction: Direction) -> u32 {
        self.correlation
            .get(&(instrument.to_string(), direction))
            .copied()
            .unwrap_or(0)
    }

    pub fn record(
        &mut self,
        event: TradeEvent,
        intent: &TradeIntent,
        session: &TradingSession,
        now: DateTime<Utc>,
    ) {
        self.roll_over(session, now);
        let key = (intent.instrument.clone(), intent.direction);

        match event {
            TradeEvent::Opened => {
                self.open_positions += 1;
                self.daily_trades += 1;
                *self.correlation.entry(key).or_insert(0) += 1;
            }
            TradeEvent::Closed { pnl } => {
                self.release(key);
                self.daily_pnl += pnl;
                self.weekly_pnl += pnl;
                if self.outcomes.len() == self.window {
                    self.outcomes.pop_front();
                }
                self.outcomes.push_back(TradeOutcome {
                    strategy: intent.strategy.clone(),
                    instrument: intent.instrument.clone(),
                    pnl,
                    closed_at: now,
                });
            }
            TradeEvent::Released => self.release(key),
        }
    }

    fn release(&mut self, key: (String, Direction)) {
        self.open_positions = self.open_positions.saturating_sub(1);
        if let Some(count) = self.correlation.get_mut(&key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.correlation.remove(&key);
            }
        }
    }

    pub fn outcomes(&self) -> impl Iterator<Item = &TradeOutcome> {
        self.outcomes.iter()
    }

    pub fn strategy_stats(&self, strategy: &str) -> StrategyStats {
        StrategyStats::from_outcomes(self.outcomes.iter().filter(|o| o.strategy == strategy))
    }

    pub fn pooled_stats(&self) -> StrategyStats {
        StrategyStats::from_outcomes(self.outcomes.iter())
    }
}

impl Default for RiskLedger {
    fn default() -> Self {
        Self::new(DEFAULT_OUTCOME_WINDOW)
    }
}
