use tranche_money::Amount;
use tranche_schemas::{Installment, InstallmentId, InstallmentStatus, Order, OrderId};

use crate::{CandidateError, CountingPolicy, InvariantViolation, RemainingResult, SequenceGap};

/// Guard: an installment amount must be strictly positive.
pub fn validate_candidate(amount: Amount) -> Result<(), CandidateError> {
    if amount.is_negative() {
        return Err(CandidateError::Negative(amount));
    }
    if amount.is_zero() {
        return Err(CandidateError::Zero);
    }
    Ok(())
}

/// Sum of counted installment amounts for `order_id`, skipping `exclude`.
///
/// Entries belonging to other orders are ignored so a caller passing a mixed
/// slice cannot inflate the total.
pub fn allocated_total(
    order_id: OrderId,
    installments: &[Installment],
    exclude: Option<InstallmentId>,
    policy: CountingPolicy,
) -> Amount {
    installments
        .iter()
        .filter(|i| i.order_id == order_id)
        .filter(|i| Some(i.installment_id) != exclude)
        .filter(|i| policy.counts(i.status))
        .map(|i| i.amount)
        .sum()
}

/// Compute the remaining allocatable amount for `order` if `candidate` were
/// accepted.
///
/// `exclude` removes one existing entry from the allocated sum; it is used
/// when an existing draft is being edited or confirmed and must not count
/// twice.
pub fn remaining(
    order: &Order,
    installments: &[Installment],
    candidate: Amount,
    exclude: Option<InstallmentId>,
    policy: CountingPolicy,
) -> RemainingResult {
    let order_total = order.total_amount;
    let allocated = allocated_total(order.order_id, installments, exclude, policy);
    let projected = allocated.saturating_add(candidate);
    let over = projected.saturating_sub(order_total);

    RemainingResult {
        order_total,
        allocated_total: allocated,
        candidate_amount: candidate,
        projected_total: projected,
        remaining_amount: order_total.saturating_sub(projected),
        is_exceeding: projected > order_total,
        exceeding_amount: over.clamp_non_negative(),
    }
}

/// Sum of confirmed installment amounts for `order_id`.
pub fn confirmed_total(order_id: OrderId, installments: &[Installment]) -> Amount {
    installments
        .iter()
        .filter(|i| i.order_id == order_id && i.status == InstallmentStatus::Confirmed)
        .map(|i| i.amount)
        .sum()
}

/// The hard invariant: confirmed installments never exceed the order total.
pub fn check_invariant(order: &Order, installments: &[Installment]) -> Result<(), InvariantViolation> {
    let confirmed = confirmed_total(order.order_id, installments);
    if confirmed > order.total_amount {
        return Err(InvariantViolation {
            order_id: order.order_id,
            order_total: order.total_amount,
            confirmed_total: confirmed,
            overage: confirmed.saturating_sub(order.total_amount),
        });
    }
    Ok(())
}

/// Entries whose sequence number differs from their dense position.
///
/// Valid entries are ordered by (sequence_no, created_at, id) and expected to
/// read 1, 2, 3, ... Duplicated numbers and holes both show up here.
/// Cancelled entries are ignored. Output is sorted by installment id.
pub fn sequence_gaps(installments: &[Installment]) -> Vec<SequenceGap> {
    let mut valid: Vec<&Installment> = installments.iter().filter(|i| i.status.is_valid()).collect();
    valid.sort_by(|a, b| {
        a.sequence_no
            .cmp(&b.sequence_no)
            .then(a.created_at_utc.cmp(&b.created_at_utc))
            .then(a.installment_id.cmp(&b.installment_id))
    });

    let mut gaps: Vec<SequenceGap> = valid
        .iter()
        .enumerate()
        .filter_map(|(idx, inst)| {
            let expected = idx as i32 + 1;
            (inst.sequence_no != expected).then(|| SequenceGap {
                installment_id: inst.installment_id,
                current: inst.sequence_no,
                expected,
            })
        })
        .collect();
    gaps.sort_by_key(|g| g.installment_id);
    gaps
}

/// Next sequence number for a new entry: one past the highest valid number.
pub fn next_sequence_no(installments: &[Installment]) -> i32 {
    installments
        .iter()
        .filter(|i| i.status.is_valid())
        .map(|i| i.sequence_no)
        .max()
        .unwrap_or(0)
        .saturating_add(1)
}
