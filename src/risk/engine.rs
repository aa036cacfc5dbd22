use chrono::{DateTime, Utc};
use log::{debug, warn};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::risk::ledger::{RiskLedger, StrategyStats, TradeEvent, DEFAULT_OUTCOME_WINDOW};
use crate::risk::session::TradingSession;
use crate::types::TradeIntent;

/// Risk engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Daily loss, as a fraction of account value, that hard-blocks new orders
    pub max_daily_loss_fraction: f64,
    /// One-lot position value, as a fraction of account value, that hard-blocks
    pub max_position_fraction: f64,
    /// Daily loss fraction that forces open positions out
    pub intraday_exit_loss_fraction: f64,
    /// Scores at or above this block the order
    pub block_score: f64,
    /// New positions allowed per day
    pub max_daily_positions: u32,
    /// Open positions at which the concentration component saturates
    pub max_open_positions: u32,
    /// Open positions per (instrument, direction) before the correlation penalty
    pub max_correlated_positions: u32,
    /// Minutes after open / before close treated as volatile
    pub session_edge_minutes: i64,
    pub kelly_multiplier: f64,
    pub max_capital_fraction: f64,
    pub kelly_floor: f64,
    /// Strategy samples needed before its own statistics are used
    pub min_strategy_samples: usize,
    pub default_win_probability: f64,
    pub default_payoff_ratio: f64,
    pub min_viable_notional: Decimal,
    pub outcome_window: usize,
    pub lot_sizes: HashMap<String, u32>,
    pub default_lot_size: u32,
    pub session: TradingSession,
}

impl Default for RiskConfig {
    fn default() -> Self {
        let lot_sizes = [
            ("NIFTY", 75),
            ("BANKNIFTY", 35),
            ("FINNIFTY", 65),
            ("MIDCPNIFTY", 140),
            ("SENSEX", 20),
        ]
        .into_iter()
        .map(|(name, lot)| (name.to_string(), lot))
        .collect();

        Self {
            max_daily_loss_fraction: 0.05,     // 5% of account
            max_position_fraction: 0.20,       // 20% of account
            intraday_exit_loss_fraction: 0.03, // 3% of account
            block_score: 70.0,
            max_daily_positions: 10,
            max_open_positions: 5,
            max_correlated_positions: 2,
            session_edge_minutes: 30,
            kelly_multiplier: 0.25, // quarter Kelly
            max_capital_fraction: 0.15,
            kelly_floor: 0.02,
            min_strategy_samples: 20,
            default_win_probability: 0.5,
            default_payoff_ratio: 1.2,
            min_viable_notional: Decimal::from(2_000),
            outcome_window: DEFAULT_OUTCOME_WINDOW,
            lot_sizes,
            default_lot_size: 1,
            session: TradingSession::default(),
        }
    }
}

/// Per-factor contributions to a risk score
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RiskComponents {
    pub daily_loss: f64,
    pub position_value: f64,
    pub time_of_day: f64,
    pub signal_quality: f64,
    pub concentration: f64,
}

impl RiskComponents {
    fn total(&self) -> f64 {
        self.daily_loss + self.position_value + self.time_of_day + self.signal_quality + self.concentration
    }
}

/// Result of `assess_order_risk`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskAssessment {
    /// 0-100
    pub score: f64,
    pub blocked: bool,
    /// Score forced to 100 by a hard limit
    pub hard_block: bool,
    pub reasons: Vec<String>,
    pub components: RiskComponents,
    /// One lot at the entry price
    pub position_value: Decimal,
}

/// Which statistics fed the Kelly estimate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatsSource {
    Strategy,
    Pooled,
    Default,
}

/// Result of `calculate_optimal_position_size`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SizingRecommendation {
    pub kelly_fraction: f64,
    pub capital_fraction: f64,
    pub confidence_multiplier: f64,
    pub volatility_multiplier: f64,
    pub dampening: f64,
    /// Target notional before rounding to lots
    pub target_notional: Decimal,
    pub lot_size: u32,
    pub lots: u32,
    /// Zero when not even one lot fits under the capital cap
    pub quantity: u32,
    pub stats_source: StatsSource,
    pub warnings: Vec<String>,
}

/// Gates and sizes orders against the risk ledger.
///
/// Every check is a function of the ledger, the cached account value and the
/// `now` it is given.
#[derive(Debug)]
pub struct RiskEngine {
    config: RiskConfig,
    ledger: RiskLedger,
    account_value: Decimal,
}

fn to_decimal(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or(Decimal::ZERO)
}

impl RiskEngine {
    pub fn new(config: RiskConfig, account_value: Decimal) -> Self {
        let ledger = RiskLedger::new(config.outcome_window);
        Self {
            config,
            ledger,
            account_value,
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn session(&self) -> &TradingSession {
        &self.config.session
    }

    pub fn ledger(&self) -> &RiskLedger {
        &self.ledger
    }

    pub fn account_value(&self) -> Decimal {
        self.account_value
    }

    pub fn set_account_value(&mut self, value: Decimal) {
        self.account_value = value;
    }

    pub fn lot_size(&self, instrument: &str) -> u32 {
        self.config
            .lot_sizes
            .get(instrument)
            .copied()
            .unwrap_or(self.config.default_lot_size)
            .max(1)
    }

    pub fn daily_pnl(&self, now: DateTime<Utc>) -> Decimal {
        self.ledger.daily_pnl_at(&self.config.session, now)
    }

    pub fn assess_order_risk(
        &self,
        intent: &TradeIntent,
        current_daily_pnl: Decimal,
        open_position_count: u32,
    ) -> RiskAssessment {
        self.assess_order_risk_at(intent, current_daily_pnl, open_position_count, Utc::now())
    }

    /// Score an intent from 0 to 100; callers block at `block_score`
    pub fn assess_order_risk_at(
        &self,
        intent: &TradeIntent,
        current_daily_pnl: Decimal,
        open_position_count: u32,
        now: DateTime<Utc>,
    ) -> RiskAssessment {
        let config = &self.config;
        let lot_size = self.lot_size(&intent.instrument);
        let position_value = intent.entry_price.notional(lot_size);
        let mut reasons = Vec::new();
        let mut components = RiskComponents::default();

        if self.account_value <= Decimal::ZERO {
            return RiskAssessment {
                score: 100.0,
                blocked: true,
                hard_block: true,
                reasons: vec!["Account value unavailable".to_string()],
                components,
                position_value,
            };
        }

        let daily_loss = (-current_daily_pnl).max(Decimal::ZERO);
        let loss_fraction = (daily_loss / self.account_value).to_f64().unwrap_or(0.0);
        let position_fraction = (position_value / self.account_value).to_f64().unwrap_or(0.0);

        // Daily loss, up to 30
        components.daily_loss = (loss_fraction / config.max_daily_loss_fraction * 30.0).min(30.0);

        // Position value, up to 25
        components.position_value =
            (position_fraction / config.max_position_fraction * 25.0).min(25.0);

        // Time of day
        components.time_of_day = match config.session.minutes_to_boundary(now) {
            None => {
                reasons.push("Outside trading session".to_string());
                10.0
            }
            Some(minutes) if minutes < config.session_edge_minutes => {
                reasons.push("Near session open/close".to_string());
                15.0
            }
            Some(_) => 0.0,
        };

        // Signal quality
        let risk_reward = intent.risk_reward_ratio();
        if risk_reward < 1.0 {
            components.signal_quality += 20.0;
            reasons.push(format!("Poor risk:reward {:.2}", risk_reward));
        } else if risk_reward < 1.5 {
            components.signal_quality += 10.0;
        }
        if intent.confidence < 60.0 {
            components.signal_quality += 10.0;
            reasons.push(format!("Low confidence {:.0}", intent.confidence));
        }

        // Concentration
        let max_open = config.max_open_positions.max(1) as f64;
        components.concentration = (open_position_count as f64 / max_open * 20.0).min(20.0);
        let correlated = self
            .ledger
            .correlated_positions(&intent.instrument, intent.direction);
        if correlated >= config.max_correlated_positions {
            components.concentration += 15.0;
            reasons.push(format!(
                "{} open {} positions on {}",
                correlated, intent.direction, intent.instrument
            ));
        }

        let mut hard_block = false;
        if loss_fraction >= config.max_daily_loss_fraction {
            hard_block = true;
            reasons.push(format!(
                "Daily loss {} at or beyond {:.1}% of account",
                daily_loss,
                config.max_daily_loss_fraction * 100.0
            ));
        }
        if position_fraction > config.max_position_fraction {
            hard_block = true;
            reasons.push(format!(
                "Position value {} exceeds {:.1}% of account",
                position_value,
                config.max_position_fraction * 100.0
            ));
        }

        let score = if hard_block {
            100.0
        } else {
            components.total().clamp(0.0, 100.0)
        };
        let blocked = hard_block || score >= config.block_score;

        if blocked {
            warn!(
                "Order for {} blocked: score {:.1}, reasons {:?}",
                intent.instrument, score, reasons
            );
        } else {
            debug!("Order for {} risk score {:.1}", intent.instrument, score);
        }

        RiskAssessment {
            score,
            blocked,
            hard_block,
            reasons,
            components,
            position_value,
        }
    }

    fn stats_for(&self, strategy: &str) -> (StrategyStats, StatsSource) {
        let own = self.ledger.strategy_stats(strategy);
        if own.samples >= self.config.min_strategy_samples {
            return (own, StatsSource::Strategy);
        }
        let pooled = self.ledger.pooled_stats();
        if pooled.samples > 0 {
            return (pooled, StatsSource::Pooled);
        }
        (StrategyStats::default(), StatsSource::Default)
    }

    fn confidence_multiplier(stats: &StrategyStats, source: StatsSource) -> f64 {
        if source == StatsSource::Default {
            return 0.75;
        }

        let mut multiplier: f64 = 1.0;
        if stats.win_rate > 0.55 {
            multiplier += 0.1;
        } else if stats.win_rate < 0.45 {
            multiplier -= 0.2;
        }
        if stats.profit_factor > 1.5 {
            multiplier += 0.1;
        } else if stats.profit_factor < 1.0 {
            multiplier -= 0.2;
        }
        if stats.expectancy <= 0.0 {
            multiplier -= 0.1;
        }
        multiplier.clamp(0.5, 1.2)
    }

    /// Raw Kelly fraction `(p*b - q) / b`
    pub fn kelly_fraction(win_probability: f64, payoff_ratio: f64) -> f64 {
        if payoff_ratio <= 0.0 {
            return 0.0;
        }
        let q = 1.0 - win_probability;
        (win_probability * payoff_ratio - q) / payoff_ratio
    }

    /// Quarter-Kelly size, capped at the configured share of capital and
    /// rounded down to whole lots.
    pub fn calculate_optimal_position_size(
        &self,
        intent: &TradeIntent,
        volatility_multiplier: f64,
        available_capital: Decimal,
        risk_score: f64,
    ) -> SizingRecommendation {
        let config = &self.config;
        let mut warnings = Vec::new();
        let (stats, stats_source) = self.stats_for(&intent.strategy);

        let (p, b) = match (stats_source, stats.payoff_ratio()) {
            (StatsSource::Default, _) => {
                (config.default_win_probability, config.default_payoff_ratio)
            }
            (_, Some(b)) => (stats.win_rate, b),
            // All wins or all losses, payoff undefined
            (_, None) => (stats.win_rate, config.default_payoff_ratio),
        };

        let mut kelly_fraction = Self::kelly_fraction(p, b);
        if kelly_fraction <= 0.0 {
            warnings.push(format!(
                "Negative edge (p={:.2}, b={:.2}), using {:.0}% floor",
                p,
                b,
                config.kelly_floor * 100.0
            ));
            kelly_fraction = config.kelly_floor;
        }

        let confidence_multiplier = Self::confidence_multiplier(&stats, stats_source);
        let volatility_multiplier = if volatility_multiplier.is_finite() {
            volatility_multiplier.max(0.0)
        } else {
            1.0
        };
        let dampening = (1.0 - risk_score / 200.0).clamp(0.5, 1.0);

        let base_fraction = (kelly_fraction * config.kelly_multiplier).min(config.max_capital_fraction);
        let capital_fraction = (base_fraction
            * confidence_multiplier
            * volatility_multiplier
            * dampening)
            .min(config.max_capital_fraction);

        let capital = available_capital.max(Decimal::ZERO);
        let cap = capital * to_decimal(config.max_capital_fraction);
        let target_notional = (capital * to_decimal(capital_fraction))
            .max(config.min_viable_notional)
            .min(cap);

        let lot_size = self.lot_size(&intent.instrument);
        let lot_value = intent.entry_price.notional(lot_size);

        let lots = if lot_value <= Decimal::ZERO {
            warnings.push("Entry price is not positive".to_string());
            0
        } else if lot_value > cap {
            warnings.push(format!(
                "One lot ({}) exceeds {:.0}% of capital",
                lot_value,
                config.max_capital_fraction * 100.0
            ));
            0
        } else {
            (target_notional / lot_value)
                .floor()
                .to_u32()
                .unwrap_or(0)
                .max(1)
        };

        SizingRecommendation {
            kelly_fraction,
            capital_fraction,
            confidence_multiplier,
            volatility_multiplier,
            dampening,
            target_notional,
            lot_size,
            lots,
            quantity: lots * lot_size,
            stats_source,
            warnings,
        }
    }

    pub fn record_trade(&mut self, event: TradeEvent, intent: &TradeIntent) {
        self.record_trade_at(event, intent, Utc::now());
    }

    pub fn record_trade_at(&mut self, event: TradeEvent, intent: &TradeIntent, now: DateTime<Utc>) {
        self.ledger.record(event, intent, &self.config.session, now);
    }

    /// Whether today's position cap still has room
    pub fn can_open_new_position(&self, now: DateTime<Utc>) -> bool {
        self.ledger.daily_trades_at(&self.config.session, now) < self.config.max_daily_positions
    }

    /// Daily loss has crossed the intraday exit threshold
    pub fn should_force_risk_exit(&self, now: DateTime<Utc>) -> bool {
        if self.account_value <= Decimal::ZERO {
            return false;
        }
        let limit = self.account_value * to_decimal(self.config.intraday_exit_loss_fraction);
        self.daily_pnl(now) <= -limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, OptionType, Price};
    use chrono::{FixedOffset, TimeZone};
    use rust_decimal_macros::dec;

    fn midday() -> DateTime<Utc> {
        FixedOffset::east_opt(19_800)
            .unwrap()
            .with_ymd_and_hms(2025, 10, 14, 12, 0, 0)
            .unwrap()
            .with_timezone(&Utc)
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

    #[test]
    fn test_kelly_fraction() {
        let kelly = RiskEngine::kelly_fraction(0.6, 1.5);
        assert!((kelly - 1.0 / 3.0).abs() < 1e-9);
        assert!(RiskEngine::kelly_fraction(0.3, 1.0) < 0.0);
    }

    #[test]
    fn test_confidence_multiplier_bounds() {
        let weak = StrategyStats {
            samples: 20,
            wins: 6,
            losses: 14,
            win_rate: 0.3,
            avg_win: 50.0,
            avg_loss: 100.0,
            profit_factor: 0.2,
            expectancy: -55.0,
            ..StrategyStats::default()
        };
        let strong = StrategyStats {
            samples: 20,
            wins: 14,
            losses: 6,
            win_rate: 0.7,
            avg_win: 150.0,
            avg_loss: 100.0,
            profit_factor: 3.5,
            expectancy: 75.0,
            ..StrategyStats::default()
        };

        let low = RiskEngine::confidence_multiplier(&weak, StatsSource::Strategy);
        let high = RiskEngine::confidence_multiplier(&strong, StatsSource::Pooled);
        assert!((low - 0.5).abs() < 1e-9);
        assert!((high - 1.2).abs() < 1e-9);
        assert_eq!(
            RiskEngine::confidence_multiplier(&strong, StatsSource::Default),
            0.75
        );
    }

    #[test]
    fn test_score_components_midday() {
        let engine = RiskEngine::new(RiskConfig::default(), dec!(100000));
        let assessment = engine.assess_order_risk_at(&nifty_intent(), Decimal::ZERO, 0, midday());

        assert!(!assessment.blocked);
        assert_eq!(assessment.components.time_of_day, 0.0);
        assert_eq!(assessment.components.signal_quality, 10.0);
        // 3750 / 100000 = 3.75% of a 20% limit
        assert!((assessment.components.position_value - 4.6875).abs() < 1e-9);
        assert_eq!(assessment.position_value, dec!(3750));
    }

    #[test]
    fn test_missing_account_value_blocks() {
        let engine = RiskEngine::new(RiskConfig::default(), Decimal::ZERO);
        let assessment = engine.assess_order_risk_at(&nifty_intent(), Decimal::ZERO, 0, midday());
        assert!(assessment.blocked);
        assert_eq!(assessment.score, 100.0);
    }

    #[test]
    fn test_default_sizing_for_new_engine() {
        let engine = RiskEngine::new(RiskConfig::default(), dec!(100000));
        let sizing = engine.calculate_optimal_position_size(&nifty_intent(), 1.0, dec!(100000), 30.0);

        assert_eq!(sizing.stats_source, StatsSource::Default);
        assert_eq!(sizing.lot_size, 75);
        assert_eq!(sizing.lots, 1);
        assert_eq!(sizing.quantity, 75);
        assert_eq!(sizing.target_notional, dec!(2000));
    }

    #[test]
    fn test_lot_larger_than_cap_yields_zero_quantity() {
        let engine = RiskEngine::new(RiskConfig::default(), dec!(10000));
        let sizing = engine.calculate_optimal_position_size(&nifty_intent(), 1.0, dec!(10000), 0.0);
        assert_eq!(sizing.quantity, 0);
        assert!(!sizing.warnings.is_empty());
    }

    #[test]
    fn test_force_risk_exit_threshold() {
        let mut engine = RiskEngine::new(RiskConfig::default(), dec!(100000));
        let now = midday();
        let intent = nifty_intent();

        engine.record_trade_at(TradeEvent::Opened, &intent, now);
        engine.record_trade_at(TradeEvent::Closed { pnl: dec!(-2999) }, &intent, now);
        assert!(!engine.should_force_risk_exit(now));

        engine.record_trade_at(TradeEvent::Opened, &intent, now);
        engine.record_trade_at(TradeEvent::Closed { pnl: dec!(-1) }, &intent, now);
        assert!(engine.should_force_risk_exit(now));
    }
}
