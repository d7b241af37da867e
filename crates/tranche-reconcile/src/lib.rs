//! tranche-reconcile
//!
//! Drift classification and repair planning for orders whose installment
//! totals no longer agree with the order total.
//!
//! Classification compares `allocated / total` against configured bands using
//! exact integer cross-multiplication in basis points:
//! - within `match_tolerance`, or under-allocated: clean
//! - total is zero, allocated is not: zero-total anomaly (operator decides)
//! - `[tax_band_low, tax_band_high]`: tax-inclusive mismatch
//! - `(tax_band_high, proportional_band_high)`: proportional over-allocation
//! - anything else: complex drift, manual investigation only
//!
//! Sequence gaps among valid installments are classified independently.
//!
//! Planning turns one issue plus a method into a concrete, reversible
//! [`RepairPlan`]. Applying the plan is the caller's job; the caller must
//! re-read and re-classify right before applying so stale plans are never
//! written.
//!
//! Deterministic, pure logic. No IO, no time.

mod classify;
mod plan;
mod types;

pub use classify::{classify_order, ratio_bps};
pub use plan::{plan_repair, proportional_amounts, tax_inclusive_total};
pub use types::*;
