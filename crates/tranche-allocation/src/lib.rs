//! tranche-allocation
//!
//! Remaining-amount calculator for installment orders.
//!
//! - `remaining()` is the single source of truth for "does this candidate
//!   fit". Every write path (submit, confirm, repair classification) calls it
//!   instead of re-deriving the arithmetic.
//! - `check_invariant()` verifies the confirmed-sum invariant of a snapshot.
//! - `sequence_gaps()` / `next_sequence_no()` cover the dense sequence rule.
//!
//! Deterministic, pure logic. No IO, no time.

mod engine;
mod types;

pub use engine::{
    allocated_total, check_invariant, confirmed_total, next_sequence_no, remaining,
    sequence_gaps, validate_candidate,
};
pub use types::*;
