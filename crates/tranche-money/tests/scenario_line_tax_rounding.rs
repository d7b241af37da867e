//! Scenario: line-level tax splitting and rounding.
//!
//! # Invariants under test
//!
//! 1. Quantity 1 at 1000 minor units, standard rate: tax 100, inclusive 1100.
//! 2. Tax is floored on the line subtotal, never on the unit price first.
//! 3. The unit-level inclusive price is floored independently and may not
//!    equal `inclusive_subtotal / quantity`.
//! 4. Bucket totals are plain sums of line values.
//!
//! All tests are pure; no IO.

use tranche_money::{split_line, Amount, TaxBuckets, TaxCategory};

#[test]
fn standard_rate_single_unit_rounding_law() {
    let s = split_line(Amount::new(1_000), 1, TaxCategory::Standard);
    assert_eq!(s.exclusive_subtotal, Amount::new(1_000));
    assert_eq!(s.tax_amount, Amount::new(100));
    assert_eq!(s.inclusive_subtotal, Amount::new(1_100));
}

#[test]
fn tax_is_floored_on_subtotal_not_unit() {
    // unit 105 * 3 = 315; floor(31.5) = 31.
    // Unit-first rounding would give floor(10.5) * 3 = 30.
    let s = split_line(Amount::new(105), 3, TaxCategory::Standard);
    assert_eq!(s.exclusive_subtotal, Amount::new(315));
    assert_eq!(s.tax_amount, Amount::new(31));
    assert_eq!(s.inclusive_subtotal, Amount::new(346));
}

#[test]
fn unit_inclusive_price_diverges_from_subtotal_division() {
    let s = split_line(Amount::new(105), 3, TaxCategory::Standard);
    // floor(105 * 0.1) = 10 -> unit inclusive 115; 115 * 3 = 345 != 346.
    assert_eq!(s.unit_tax, Amount::new(10));
    assert_eq!(s.unit_inclusive_price, Amount::new(115));
    assert_ne!(
        s.unit_inclusive_price.checked_mul_qty(s.quantity),
        Some(s.inclusive_subtotal),
        "divergence between unit-level and subtotal-level rounding is expected"
    );
}

#[test]
fn reduced_rate_floors() {
    // 999 * 0.08 = 79.92 -> 79
    let s = split_line(Amount::new(999), 1, TaxCategory::Reduced);
    assert_eq!(s.tax_amount, Amount::new(79));
    assert_eq!(s.inclusive_subtotal, Amount::new(1_078));
}

#[test]
fn zero_rated_and_exempt_carry_no_tax() {
    for cat in [TaxCategory::ZeroRated, TaxCategory::Exempt] {
        let s = split_line(Amount::new(12_345), 7, cat);
        assert_eq!(s.tax_amount, Amount::ZERO);
        assert_eq!(s.inclusive_subtotal, s.exclusive_subtotal);
    }
}

#[test]
fn unknown_category_label_uses_standard_rate() {
    let s = split_line(Amount::new(1_000), 1, TaxCategory::parse("mystery"));
    assert_eq!(s.tax_amount, Amount::new(100));
}

#[test]
fn overflowing_line_saturates_instead_of_panicking() {
    let s = split_line(Amount::MAX, 3, TaxCategory::Standard);
    assert_eq!(s.exclusive_subtotal, Amount::MAX);
    assert_eq!(s.inclusive_subtotal, Amount::MAX);
}

#[test]
fn buckets_sum_line_values_per_category() {
    let lines = [
        split_line(Amount::new(105), 3, TaxCategory::Standard),
        split_line(Amount::new(1_000), 1, TaxCategory::Standard),
        split_line(Amount::new(999), 1, TaxCategory::Reduced),
        split_line(Amount::new(500), 2, TaxCategory::Exempt),
    ];
    let buckets = TaxBuckets::from_lines(lines.iter());

    let std = buckets.get(TaxCategory::Standard).copied().unwrap_or_default();
    assert_eq!(std.exclusive, Amount::new(1_315));
    assert_eq!(std.tax, Amount::new(131));
    assert_eq!(std.inclusive, Amount::new(1_446));
    assert_eq!(std.lines, 2);

    let total = buckets.total();
    assert_eq!(total.tax, Amount::new(131 + 79));
    assert_eq!(total.exclusive, Amount::new(1_315 + 999 + 1_000));
    assert_eq!(total.inclusive, total.exclusive + total.tax);
    assert_eq!(total.lines, 4);
}
