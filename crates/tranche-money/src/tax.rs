//! Tax categories, rates and per-line tax splitting.
//!
//! # Rounding rule
//!
//! Tax is floored at the **line subtotal** level:
//!
//! ```text
//! exclusive_subtotal = unit_price * quantity
//! tax_amount         = floor(exclusive_subtotal * rate)
//! inclusive_subtotal = exclusive_subtotal + tax_amount
//! ```
//!
//! The unit-level inclusive price is floored independently from the unit
//! price. It is informational only and is never multiplied back up into a
//! subtotal: `unit_inclusive_price * quantity` may differ from
//! `inclusive_subtotal`, and that divergence is expected.
//!
//! Order-level totals are sums of line-level values ([`TaxBuckets`]).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::rounding::{floor_div, round_minor_units};

/// Tax treatment of a line.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaxCategory {
    Standard,
    Reduced,
    ZeroRated,
    Exempt,
}

impl TaxCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaxCategory::Standard => "standard",
            TaxCategory::Reduced => "reduced",
            TaxCategory::ZeroRated => "zero_rated",
            TaxCategory::Exempt => "exempt",
        }
    }

    /// Lenient parse. Unknown labels fall back to [`TaxCategory::Standard`];
    /// a line is never rejected for its category.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "reduced" => TaxCategory::Reduced,
            "zero_rated" | "zero" => TaxCategory::ZeroRated,
            "exempt" => TaxCategory::Exempt,
            _ => TaxCategory::Standard,
        }
    }

    pub fn rate(&self) -> TaxRate {
        tax_rate(*self)
    }
}

/// A tax rate as an exact rational `num / den`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaxRate {
    pub num: i64,
    pub den: i64,
}

impl TaxRate {
    pub const STANDARD: TaxRate = TaxRate { num: 10, den: 100 };
    pub const REDUCED: TaxRate = TaxRate { num: 8, den: 100 };
    pub const ZERO: TaxRate = TaxRate { num: 0, den: 100 };

    pub fn is_zero(&self) -> bool {
        self.num == 0
    }

    /// `floor(amount * rate)`.
    pub fn floor_tax(&self, amount: Amount) -> Amount {
        Amount::new(floor_div(
            amount.raw() as i128 * self.num as i128,
            self.den as i128,
        ))
    }

    /// Rate in basis points, rounded (10% -> 1000).
    pub fn basis_points(&self) -> i64 {
        round_minor_units(self.num as i128 * 10_000, self.den as i128)
    }
}

/// Rate for a category: standard 10%, reduced 8%, zero-rated/exempt 0%.
pub fn tax_rate(category: TaxCategory) -> TaxRate {
    match category {
        TaxCategory::Standard => TaxRate::STANDARD,
        TaxCategory::Reduced => TaxRate::REDUCED,
        TaxCategory::ZeroRated | TaxCategory::Exempt => TaxRate::ZERO,
    }
}

/// `round(amount * (1 + rate))`, round-half-up.
///
/// This is the tax-inclusive gross of a tax-exclusive amount as a whole,
/// used when correcting order totals (not for line items, which floor).
pub fn gross_up(amount: Amount, rate: TaxRate) -> Amount {
    Amount::new(round_minor_units(
        amount.raw() as i128 * (rate.den as i128 + rate.num as i128),
        rate.den as i128,
    ))
}

/// Result of splitting one line into its tax components.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineSplit {
    pub category: TaxCategory,
    pub quantity: i64,
    pub unit_exclusive_price: Amount,
    /// `floor(unit_exclusive_price * rate)`, independent of the subtotal.
    pub unit_tax: Amount,
    pub unit_inclusive_price: Amount,
    pub exclusive_subtotal: Amount,
    pub tax_amount: Amount,
    pub inclusive_subtotal: Amount,
}

/// Split a line into exclusive subtotal, tax and inclusive subtotal.
///
/// Never fails: the subtotal product is computed in `i128` and saturates to
/// the `Amount` range.
pub fn split_line(unit_price: Amount, quantity: i64, category: TaxCategory) -> LineSplit {
    let rate = tax_rate(category);

    let exclusive_subtotal = Amount::new(floor_div(unit_price.raw() as i128 * quantity as i128, 1));
    let tax_amount = rate.floor_tax(exclusive_subtotal);
    let unit_tax = rate.floor_tax(unit_price);

    LineSplit {
        category,
        quantity,
        unit_exclusive_price: unit_price,
        unit_tax,
        unit_inclusive_price: unit_price.saturating_add(unit_tax),
        exclusive_subtotal,
        tax_amount,
        inclusive_subtotal: exclusive_subtotal.saturating_add(tax_amount),
    }
}

/// Per-category totals.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketTotals {
    pub exclusive: Amount,
    pub tax: Amount,
    pub inclusive: Amount,
    pub lines: u32,
}

/// Accumulates [`LineSplit`]s into tax buckets.
///
/// Only line-level (already floored) values are summed; nothing is
/// re-rounded at the bucket level.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TaxBuckets {
    buckets: BTreeMap<TaxCategory, BucketTotals>,
}

impl TaxBuckets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_lines<'a>(lines: impl IntoIterator<Item = &'a LineSplit>) -> Self {
        let mut b = Self::new();
        for l in lines {
            b.add(l);
        }
        b
    }

    pub fn add(&mut self, line: &LineSplit) {
        let t = self.buckets.entry(line.category).or_default();
        t.exclusive = t.exclusive.saturating_add(line.exclusive_subtotal);
        t.tax = t.tax.saturating_add(line.tax_amount);
        t.inclusive = t.inclusive.saturating_add(line.inclusive_subtotal);
        t.lines += 1;
    }

    pub fn get(&self, category: TaxCategory) -> Option<&BucketTotals> {
        self.buckets.get(&category)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TaxCategory, &BucketTotals)> {
        self.buckets.iter()
    }

    pub fn total(&self) -> BucketTotals {
        self.buckets
            .values()
            .fold(BucketTotals::default(), |acc, t| BucketTotals {
                exclusive: acc.exclusive.saturating_add(t.exclusive),
                tax: acc.tax.saturating_add(t.tax),
                inclusive: acc.inclusive.saturating_add(t.inclusive),
                lines: acc.lines + t.lines,
            })
    }
}
