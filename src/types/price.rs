use rust_decimal::Decimal;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::{Div, Sub};
use std::str::FromStr;

/// Option premium per unit, in rupees.
///
/// Kept apart from quantities, P&L amounts and fractions, which stay plain
/// `Decimal`/`u32`/`f64`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Price(Decimal);

impl Price {
    pub fn new(value: Decimal) -> Self {
        Self(value)
    }

    pub fn zero() -> Self {
        Self(Decimal::ZERO)
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_positive(&self) -> bool {
        self.0 > Decimal::ZERO
    }

    /// Premium paid or received for `quantity` units
    pub fn notional(&self, quantity: u32) -> Decimal {
        self.0 * Decimal::from(quantity)
    }
}

impl FromStr for Price {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Decimal::from_str(s.trim()).map(Self)
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Written as a string so no precision is lost
impl Serialize for Price {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

struct PriceVisitor;

impl<'de> Visitor<'de> for PriceVisitor {
    type Value = Price;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a premium as a decimal string or number")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Price, E> {
        Price::from_str(v).map_err(E::custom)
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Price, E> {
        Ok(Price(Decimal::from(v)))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Price, E> {
        Ok(Price(Decimal::from(v)))
    }

    // Via the shortest text form, so 52.35 stays 52.35
    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Price, E> {
        Price::from_str(&v.to_string()).map_err(E::custom)
    }
}

/// Accepts `"52.35"` as well as `52.35`; brokerage payloads use both.
impl<'de> Deserialize<'de> for Price {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(PriceVisitor)
    }
}

impl Sub for Price {
    type Output = Price;

    fn sub(self, rhs: Price) -> Price {
        Price(self.0 - rhs.0)
    }
}

/// Ratio of two premiums, used for plausibility checks
impl Div for Price {
    type Output = Decimal;

    fn div(self, rhs: Price) -> Decimal {
        if rhs.0.is_zero() {
            return Decimal::ZERO;
        }
        self.0 / rhs.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_is_zero() {
        assert!(Price::default().is_zero());
        assert!(!Price::default().is_positive());
    }

    #[test]
    fn test_notional_and_ratio() {
        let entry = Price::new(dec!(50));
        assert_eq!(entry.notional(75), dec!(3750));
        assert_eq!(Price::new(dec!(250)) / entry, dec!(5));
        assert_eq!(entry / Price::zero(), Decimal::ZERO);
    }

    #[test]
    fn test_serializes_as_string_reads_either() {
        let json = serde_json::to_string(&Price::new(dec!(100.50))).unwrap();
        assert_eq!(json, "\"100.50\"");

        let from_string: Price = serde_json::from_str("\"57.5\"").unwrap();
        let from_number: Price = serde_json::from_str("57.5").unwrap();
        let from_integer: Price = serde_json::from_str("57").unwrap();
        assert_eq!(from_string, Price::new(dec!(57.5)));
        assert_eq!(from_number, from_string);
        assert_eq!(from_integer, Price::new(dec!(57)));
        assert!(serde_json::from_str::<Price>("\"abc\"").is_err());
    }
}
