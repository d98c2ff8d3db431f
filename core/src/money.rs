//! Fixed-point money and rate types.
//!
//! RULE: Monetary values are stored as integer cents. Any floating-point
//! intermediate is rounded to the cent before it is persisted, so values
//! never drift across years. Rates are integer basis points.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};

/// An amount of money in integer cents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cents(pub i64);

impl Cents {
    pub const ZERO: Cents = Cents(0);

    /// Round a dollar amount to the nearest cent (half away from zero).
    pub fn from_dollars(dollars: f64) -> Self {
        Cents((dollars * 100.0).round() as i64)
    }

    pub fn as_dollars(self) -> f64 {
        self.0 as f64 / 100.0
    }

    /// Multiply by a rate in basis points, rounding half away from zero.
    pub fn apply_rate(self, rate: BasisPoints) -> Self {
        Cents(div_round(self.0 as i128 * rate.0 as i128, 10_000))
    }

    /// Scale by `num / den`, rounding half away from zero.
    /// Used for proration by months worked.
    pub fn prorate(self, num: u32, den: u32) -> Self {
        if den == 0 {
            return Cents::ZERO;
        }
        Cents(div_round(self.0 as i128 * num as i128, den as i128))
    }

    /// Scale by a floating-point factor and round back to the cent.
    pub fn scale(self, factor: f64) -> Self {
        Cents::from_dollars(self.as_dollars() * factor)
    }
}

fn div_round(num: i128, den: i128) -> i64 {
    let half = den / 2;
    let q = if num >= 0 { (num + half) / den } else { (num - half) / den };
    q as i64
}

impl Add for Cents {
    type Output = Cents;
    fn add(self, rhs: Cents) -> Cents { Cents(self.0 + rhs.0) }
}

impl Sub for Cents {
    type Output = Cents;
    fn sub(self, rhs: Cents) -> Cents { Cents(self.0 - rhs.0) }
}

impl AddAssign for Cents {
    fn add_assign(&mut self, rhs: Cents) { self.0 += rhs.0; }
}

impl SubAssign for Cents {
    fn sub_assign(&mut self, rhs: Cents) { self.0 -= rhs.0; }
}

impl Neg for Cents {
    type Output = Cents;
    fn neg(self) -> Cents { Cents(-self.0) }
}

impl Sum for Cents {
    fn sum<I: Iterator<Item = Cents>>(iter: I) -> Cents {
        iter.fold(Cents::ZERO, |acc, c| acc + c)
    }
}

impl<'a> Sum<&'a Cents> for Cents {
    fn sum<I: Iterator<Item = &'a Cents>>(iter: I) -> Cents {
        iter.fold(Cents::ZERO, |acc, c| acc + *c)
    }
}

impl fmt::Display for Cents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

/// A rate in basis points (1 bp = 0.01%).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BasisPoints(pub u32);

impl BasisPoints {
    pub const ZERO: BasisPoints = BasisPoints(0);

    /// Round a fraction (0.06 = 6%) to whole basis points.
    pub fn from_fraction(fraction: f64) -> Self {
        BasisPoints((fraction * 10_000.0).round().max(0.0) as u32)
    }
}

impl fmt::Display for BasisPoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}%", self.0 / 100, self.0 % 100)
    }
}
