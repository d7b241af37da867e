//! Fixed-point currency amount in integer minor units.
//!
//! # Scale
//!
//! 1 major unit = 100 minor units (`MINOR_PER_MAJOR`). Every monetary value in
//! the ledger (order totals, installment amounts, unit prices, tax) uses this
//! scale. Quantities, sequence numbers and identifiers stay plain integers and
//! never convert implicitly.
//!
//! `Amount` wraps the raw `i64` so the type system prevents:
//! - Implicit construction from raw `i64` (no `From<i64>` impl).
//! - Mixing amounts with unrelated integers in arithmetic.
//!
//! # Arithmetic
//!
//! - `Add`, `Sub`, `Neg`, `AddAssign`, `SubAssign` and `Sum` are closed over
//!   `Amount` and follow Rust's integer overflow semantics.
//! - `saturating_add` / `saturating_sub` clamp at the `i64` extremes.
//! - `checked_mul_qty(qty)` multiplies a per-unit price by a quantity and
//!   returns `None` on overflow.

use std::iter::Sum;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};

use serde::{Deserialize, Serialize};

/// Minor units per major currency unit.
pub const MINOR_PER_MAJOR: i64 = 100;

/// A monetary amount in integer minor units.
///
/// Use [`Amount::new`] for explicit construction and [`Amount::raw`] when
/// crossing a boundary (database column, CLI output) that needs the integer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(i64);

impl Amount {
    pub const ZERO: Amount = Amount(0);
    pub const MAX: Amount = Amount(i64::MAX);
    pub const MIN: Amount = Amount(i64::MIN);

    #[inline]
    pub const fn new(raw: i64) -> Self {
        Amount(raw)
    }

    /// Whole major units, e.g. `Amount::major(12)` == 1200 minor units.
    /// Saturates on overflow.
    #[inline]
    pub const fn major(units: i64) -> Self {
        Amount(units.saturating_mul(MINOR_PER_MAJOR))
    }

    #[inline]
    pub const fn raw(self) -> i64 {
        self.0
    }

    #[inline]
    pub fn saturating_add(self, rhs: Amount) -> Amount {
        Amount(self.0.saturating_add(rhs.0))
    }

    #[inline]
    pub fn saturating_sub(self, rhs: Amount) -> Amount {
        Amount(self.0.saturating_sub(rhs.0))
    }

    #[inline]
    pub fn checked_add(self, rhs: Amount) -> Option<Amount> {
        self.0.checked_add(rhs.0).map(Amount)
    }

    /// Absolute value. `Amount::MIN.abs()` saturates to `Amount::MAX`.
    #[inline]
    pub fn abs(self) -> Amount {
        Amount(self.0.saturating_abs())
    }

    #[inline]
    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    #[inline]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// `max(self, 0)`.
    #[inline]
    pub fn clamp_non_negative(self) -> Amount {
        Amount(self.0.max(0))
    }

    /// Multiply a per-unit price by an integer quantity.
    ///
    /// Returns `None` on overflow. Callers decide whether that is a
    /// validation error or a saturation; there is no implicit clamp here.
    #[inline]
    pub fn checked_mul_qty(self, qty: i64) -> Option<Amount> {
        self.0.checked_mul(qty).map(Amount)
    }
}

impl Add for Amount {
    type Output = Amount;
    #[inline]
    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0 + rhs.0)
    }
}

impl Sub for Amount {
    type Output = Amount;
    #[inline]
    fn sub(self, rhs: Amount) -> Amount {
        Amount(self.0 - rhs.0)
    }
}

impl Neg for Amount {
    type Output = Amount;
    #[inline]
    fn neg(self) -> Amount {
        Amount(-self.0)
    }
}

impl AddAssign for Amount {
    #[inline]
    fn add_assign(&mut self, rhs: Amount) {
        self.0 += rhs.0;
    }
}

impl SubAssign for Amount {
    #[inline]
    fn sub_assign(&mut self, rhs: Amount) {
        self.0 -= rhs.0;
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Amount {
        iter.fold(Amount::ZERO, |acc, a| acc.saturating_add(a))
    }
}

impl<'a> Sum<&'a Amount> for Amount {
    fn sum<I: Iterator<Item = &'a Amount>>(iter: I) -> Amount {
        iter.copied().sum()
    }
}

impl std::fmt::Display for Amount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let major = self.0 / MINOR_PER_MAJOR;
        let minor = (self.0 % MINOR_PER_MAJOR).abs();
        // -0.50 truncates `major` to 0 and loses the sign.
        if self.0 < 0 && major == 0 {
            write!(f, "-{major}.{minor:02}")
        } else {
            write!(f, "{major}.{minor:02}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_additive_identity() {
        let a = Amount::new(42_00);
        assert_eq!(a + Amount::ZERO, a);
        assert_eq!(Amount::ZERO + a, a);
    }

    #[test]
    fn major_scales_by_hundred() {
        assert_eq!(Amount::major(12).raw(), 1_200);
        assert_eq!(Amount::major(i64::MAX), Amount::MAX);
    }

    #[test]
    fn sum_saturates_instead_of_wrapping() {
        let total: Amount = [Amount::MAX, Amount::new(1)].iter().sum();
        assert_eq!(total, Amount::MAX);
    }

    #[test]
    fn clamp_non_negative_floors_at_zero() {
        assert_eq!(Amount::new(-5).clamp_non_negative(), Amount::ZERO);
        assert_eq!(Amount::new(5).clamp_non_negative(), Amount::new(5));
    }

    #[test]
    fn checked_mul_qty_overflow_returns_none() {
        assert_eq!(Amount::MAX.checked_mul_qty(2), None);
        assert_eq!(Amount::new(250).checked_mul_qty(4), Some(Amount::new(1_000)));
    }

    #[test]
    fn display_uses_two_decimal_places() {
        assert_eq!(Amount::new(150).to_string(), "1.50");
        assert_eq!(Amount::new(-275).to_string(), "-2.75");
        assert_eq!(Amount::new(-50).to_string(), "-0.50");
        assert_eq!(Amount::new(2_000_000).to_string(), "20000.00");
    }
}
