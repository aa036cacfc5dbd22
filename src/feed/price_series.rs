use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::types::Price;

pub const DEFAULT_SERIES_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceSample {
    pub price: Price,
    pub volume: u64,
    pub timestamp: DateTime<Utc>,
}

/// Bounded ring buffer of recent prices for one instrument
#[derive(Debug, Clone)]
pub struct PriceSeries {
    samples: VecDeque<PriceSample>,
    capacity: usize,
}

impl PriceSeries {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: PriceSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn latest(&self) -> Option<&PriceSample> {
        self.samples.back()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> impl Iterator<Item = &PriceSample> {
        self.samples.iter()
    }

    pub fn to_vec(&self) -> Vec<PriceSample> {
        self.samples.iter().copied().collect()
    }

    /// Standard deviation of sample-to-sample returns.
    ///
    /// `None` with fewer than three samples.
    pub fn volatility(&self) -> Option<f64> {
        if self.samples.len() < 3 {
            return None;
        }

        let returns: Vec<f64> = self
            .samples
            .iter()
            .zip(self.samples.iter().skip(1))
            .filter_map(|(prev, next)| {
                let prev = prev.price.value().to_f64()?;
                let next = next.price.value().to_f64()?;
                if prev <= 0.0 {
                    return None;
                }
                Some((next - prev) / prev)
            })
            .collect();

        if returns.len() < 2 {
            return None;
        }

        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let variance =
            returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (returns.len() - 1) as f64;
        Some(variance.sqrt())
    }
}

impl Default for PriceSeries {
    fn default() -> Self {
        Self::new(DEFAULT_SERIES_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample(price: Price) -> PriceSample {
        PriceSample {
            price,
            volume: 0,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_series_is_bounded() {
        let mut series = PriceSeries::new(100);
        for i in 1..=150 {
            series.push(sample(Price::new(rust_decimal::Decimal::from(i))));
        }

        assert_eq!(series.len(), 100);
        assert_eq!(series.samples().next().unwrap().price.value(), dec!(51));
        assert_eq!(series.latest().unwrap().price.value(), dec!(150));
    }

    #[test]
    fn test_volatility_of_flat_series_is_zero() {
        let mut series = PriceSeries::default();
        assert!(series.volatility().is_none());

        for _ in 0..5 {
            series.push(sample(Price::new(dec!(50))));
        }
        assert_eq!(series.volatility(), Some(0.0));
    }
}
