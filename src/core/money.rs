//! Exact monetary amounts.
//!
//! Budget checks compare sums against hard limits, so amounts are held as
//! integer micro-dollars rather than `f64`.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

const MICROS_PER_DOLLAR: i64 = 1_000_000;
const MICROS_PER_CENT: i64 = 10_000;

/// An amount of US dollars with micro-dollar precision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Usd(i64);

impl Usd {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    #[must_use]
    pub const fn from_cents(cents: i64) -> Self {
        Self(cents * MICROS_PER_CENT)
    }

    /// Convert from a floating dollar amount, rounding to the nearest micro-dollar.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_dollars(dollars: f64) -> Self {
        Self((dollars * MICROS_PER_DOLLAR as f64).round() as i64)
    }

    #[must_use]
    pub const fn micros(self) -> i64 {
        self.0
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_dollars(self) -> f64 {
        self.0 as f64 / MICROS_PER_DOLLAR as f64
    }

    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Subtraction clamped at zero.
    #[must_use]
    pub const fn saturating_sub(self, other: Self) -> Self {
        let v = self.0 - other.0;
        if v < 0 { Self(0) } else { Self(v) }
    }

    /// Scale by a factor, rounding to the nearest micro-dollar.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    pub fn scale(self, factor: f64) -> Self {
        Self((self.0 as f64 * factor).round() as i64)
    }

    /// Fraction of `limit` this amount represents (0.0 when the limit is zero).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn ratio_of(self, limit: Self) -> f64 {
        if limit.0 <= 0 {
            0.0
        } else {
            self.0 as f64 / limit.0 as f64
        }
    }
}

impl fmt::Display for Usd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let dollars = abs / MICROS_PER_DOLLAR.unsigned_abs();
        let frac = abs % MICROS_PER_DOLLAR.unsigned_abs();
        if frac % MICROS_PER_CENT.unsigned_abs() == 0 {
            write!(f, "{sign}${dollars}.{:02}", frac / MICROS_PER_CENT.unsigned_abs())
        } else {
            write!(f, "{sign}${dollars}.{frac:06}")
        }
    }
}

impl Add for Usd {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl AddAssign for Usd {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sub for Usd {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self(self.0 - rhs.0)
    }
}

impl SubAssign for Usd {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl Sum for Usd {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Add::add)
    }
}

// Serialized as dollars so JSON output and TOML config stay readable.
impl Serialize for Usd {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_dollars())
    }
}

impl<'de> Deserialize<'de> for Usd {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let dollars = f64::deserialize(deserializer)?;
        if !dollars.is_finite() {
            return Err(serde::de::Error::custom("amount must be finite"));
        }
        Ok(Self::from_dollars(dollars))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shortfall_is_exact() {
        let remaining = Usd::from_dollars(0.30);
        let estimate = Usd::from_dollars(0.50);
        assert_eq!(estimate - remaining, Usd::from_cents(20));
    }

    #[test]
    fn display_formats() {
        assert_eq!(Usd::from_cents(20).to_string(), "$0.20");
        assert_eq!(Usd::from_dollars(12.5).to_string(), "$12.50");
        assert_eq!(Usd::from_micros(1_234).to_string(), "$0.001234");
        assert_eq!(Usd::from_cents(-5).to_string(), "-$0.05");
    }

    #[test]
    fn saturating_and_ratio() {
        assert_eq!(Usd::from_cents(5).saturating_sub(Usd::from_cents(9)), Usd::ZERO);
        let r = Usd::from_cents(80).ratio_of(Usd::from_cents(100));
        assert!((r - 0.8).abs() < 1e-9);
        assert!(Usd::from_cents(1).ratio_of(Usd::ZERO).abs() < f64::EPSILON);
    }

    #[test]
    fn serde_uses_dollars() {
        let json = serde_json::to_string(&Usd::from_cents(125)).unwrap();
        assert_eq!(json, "1.25");
        let back: Usd = serde_json::from_str("0.2").unwrap();
        assert_eq!(back, Usd::from_cents(20));
    }
}
