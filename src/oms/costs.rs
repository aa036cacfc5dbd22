use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::oms::order::ExitReason;
use crate::traits::OrderSide;
use crate::types::Price;

/// F&O charge schedule, rates as fractions of turnover
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostConfig {
    pub brokerage_rate: Decimal,
    /// Brokerage ceiling per executed order
    pub brokerage_cap: Decimal,
    /// Securities transaction tax, sell leg only
    pub stt_sell_rate: Decimal,
    pub exchange_txn_rate: Decimal,
    pub sebi_rate: Decimal,
    /// Stamp duty, buy leg only
    pub stamp_buy_rate: Decimal,
    /// GST on brokerage, exchange and SEBI charges
    pub gst_rate: Decimal,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            brokerage_rate: dec!(0.0003),       // 0.03%
            brokerage_cap: dec!(20),            // ₹20 per order
            stt_sell_rate: dec!(0.001),         // 0.1% on premium
            exchange_txn_rate: dec!(0.0003503), // NSE options
            sebi_rate: dec!(0.000001),          // ₹10 per crore
            stamp_buy_rate: dec!(0.00003),      // 0.003%
            gst_rate: dec!(0.18),
        }
    }
}

/// Charges on option premium turnover
#[derive(Debug, Clone, Default)]
pub struct TransactionCostModel {
    config: CostConfig,
}

impl TransactionCostModel {
    pub fn new(config: CostConfig) -> Self {
        Self { config }
    }

    /// Charges for one executed leg
    pub fn leg_cost(&self, side: OrderSide, price: Price, quantity: u32) -> Decimal {
        let c = &self.config;
        let turnover = price.notional(quantity);
        if turnover <= Decimal::ZERO {
            return Decimal::ZERO;
        }

        let brokerage = (turnover * c.brokerage_rate).min(c.brokerage_cap);
        let stt = match side {
            OrderSide::Sell => turnover * c.stt_sell_rate,
            OrderSide::Buy => Decimal::ZERO,
        };
        let txn = turnover * c.exchange_txn_rate;
        let sebi = turnover * c.sebi_rate;
        let stamp = match side {
            OrderSide::Buy => turnover * c.stamp_buy_rate,
            OrderSide::Sell => Decimal::ZERO,
        };
        let gst = (brokerage + txn + sebi) * c.gst_rate;

        (brokerage + stt + txn + sebi + stamp + gst).round_dp(2)
    }

    /// Buy at entry and sell at exit
    pub fn round_trip(&self, entry: Price, exit: Price, quantity: u32) -> Decimal {
        self.leg_cost(OrderSide::Buy, entry, quantity) + self.leg_cost(OrderSide::Sell, exit, quantity)
    }

    /// Admission-time estimate: both legs at the entry price
    pub fn estimate_round_trip(&self, entry: Price, quantity: u32) -> Decimal {
        self.round_trip(entry, entry, quantity)
    }
}

/// Synthetic slippage applied to paper exits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlippageConfig {
    /// Base slippage as a fraction of price
    pub base_fraction: f64,
    pub stop_loss_multiplier: f64,
    /// Applied when the series is volatile or the premium is low
    pub illiquid_multiplier: f64,
    /// Return volatility above which the regime counts as volatile
    pub volatility_threshold: f64,
    /// Premiums below this count as illiquid
    pub low_premium_threshold: Decimal,
    pub outside_hours_multiplier: f64,
    pub max_fraction: f64,
}

impl Default for SlippageConfig {
    fn default() -> Self {
        Self {
            base_fraction: 0.002, // 0.2%
            stop_loss_multiplier: 2.0,
            illiquid_multiplier: 1.5,
            volatility_threshold: 0.02,
            low_premium_threshold: dec!(20),
            outside_hours_multiplier: 2.0,
            max_fraction: 0.03,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SlippageModel {
    config: SlippageConfig,
}

impl SlippageModel {
    pub fn new(config: SlippageConfig) -> Self {
        Self { config }
    }

    pub fn slippage_fraction(
        &self,
        reason: ExitReason,
        price: Price,
        volatility: Option<f64>,
        in_session: bool,
    ) -> f64 {
        let c = &self.config;
        let mut fraction = c.base_fraction;

        if reason == ExitReason::StopLoss {
            fraction *= c.stop_loss_multiplier;
        }
        let volatile = volatility.map(|v| v > c.volatility_threshold).unwrap_or(false);
        if volatile || price.value() < c.low_premium_threshold {
            fraction *= c.illiquid_multiplier;
        }
        if !in_session {
            fraction *= c.outside_hours_multiplier;
        }

        fraction.clamp(0.0, c.max_fraction)
    }

    /// Price received when selling at `price` after slippage
    pub fn apply_to_exit(
        &self,
        reason: ExitReason,
        price: Price,
        volatility: Option<f64>,
        in_session: bool,
    ) -> Price {
        let fraction = self.slippage_fraction(reason, price, volatility, in_session);
        let factor = Decimal::ONE - Decimal::from_f64(fraction).unwrap_or(Decimal::ZERO);
        Price::new((price.value() * factor).round_dp(2))
    }
}

/// Slippage as a fraction, for logging
pub fn slippage_between(quoted: Price, executed: Price) -> f64 {
    if quoted.is_zero() {
        return 0.0;
    }
    ((quoted.value() - executed.value()) / quoted.value())
        .to_f64()
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buy_leg_charges() {
        let model = TransactionCostModel::default();
        // 50 x 75 = 3750 turnover
        // brokerage 1.125, txn 1.313625, sebi 0.00375, stamp 0.1125, gst 0.4396275
        let cost = model.leg_cost(OrderSide::Buy, Price::new(dec!(50)), 75);
        assert_eq!(cost, dec!(2.99));
    }

    #[test]
    fn test_sell_leg_pays_stt() {
        let model = TransactionCostModel::default();
        let buy = model.leg_cost(OrderSide::Buy, Price::new(dec!(50)), 75);
        let sell = model.leg_cost(OrderSide::Sell, Price::new(dec!(50)), 75);
        assert!(sell > buy);
    }

    #[test]
    fn test_brokerage_is_capped() {
        let model = TransactionCostModel::default();
        let small = model.leg_cost(OrderSide::Buy, Price::new(dec!(100)), 1000);
        let large = model.leg_cost(OrderSide::Buy, Price::new(dec!(100)), 2000);
        // Above the cap only the proportional charges grow
        assert!(large < small * dec!(2));
    }

    #[test]
    fn test_stop_loss_slips_more_than_target() {
        let model = SlippageModel::default();
        let price = Price::new(dec!(50));
        let target = model.slippage_fraction(ExitReason::Target, price, None, true);
        let stop = model.slippage_fraction(ExitReason::StopLoss, price, None, true);
        let after_hours = model.slippage_fraction(ExitReason::Target, price, None, false);
        let cheap = model.slippage_fraction(ExitReason::Target, Price::new(dec!(5)), None, true);

        assert!(stop > target);
        assert!(after_hours > target);
        assert!(cheap > target);
        assert_eq!(
            model.apply_to_exit(ExitReason::Target, price, None, true),
            Price::new(dec!(49.9))
        );
    }
}
