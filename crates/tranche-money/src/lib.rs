//! tranche-money
//!
//! Amount & tax utilities for the installment ledger.
//! - `Amount`: integer minor units, no implicit integer conversion
//! - Round-half-up rational rounding and decimal-string parsing
//! - Tax categories, rates and line-subtotal-level tax splitting
//!
//! Deterministic, pure logic. No IO, no floating point.

mod amount;
mod rounding;
mod tax;

pub use amount::{Amount, MINOR_PER_MAJOR};
pub use rounding::{floor_div, parse_amount, round_minor_units, scale_rounded, AmountParseError};
pub use tax::{
    gross_up, split_line, tax_rate, BucketTotals, LineSplit, TaxBuckets, TaxCategory, TaxRate,
};
