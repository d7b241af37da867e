use tranche_allocation::{allocated_total, sequence_gaps, CountingPolicy};
use tranche_money::{gross_up, round_minor_units, Amount};
use tranche_schemas::{Installment, InstallmentId, Order};

use crate::{
    AmountChange, IssueKind, PlanError, RepairMethod, RepairPlan, RepairThresholds,
    SequenceChange,
};

/// Scale `entries` by `total / allocated`, rounding each to the nearest minor
/// unit, then trim any overshoot one unit at a time from the entries that were
/// rounded up the most. Returns the changed entries and the new sum, which is
/// never above `total`.
pub fn proportional_amounts(
    entries: &[(InstallmentId, Amount)],
    total: Amount,
    allocated: Amount,
) -> (Vec<AmountChange>, Amount) {
    if allocated.raw() <= 0 {
        let sum = entries.iter().map(|(_, a)| *a).sum();
        return (Vec::new(), sum);
    }
    let den = allocated.raw() as i128;

    // (id, old, new, round-up excess scaled by `den`)
    let mut scaled: Vec<(InstallmentId, Amount, i64, i128)> = entries
        .iter()
        .map(|(id, old)| {
            let num = old.raw() as i128 * total.raw() as i128;
            let new = round_minor_units(num, den);
            (*id, *old, new, new as i128 * den - num)
        })
        .collect();

    let mut sum: i128 = scaled.iter().map(|s| s.2 as i128).sum();
    let target = total.raw() as i128;

    if sum > target {
        let mut order: Vec<usize> = (0..scaled.len()).collect();
        order.sort_by(|&a, &b| {
            scaled[b]
                .3
                .cmp(&scaled[a].3)
                .then(scaled[a].0.cmp(&scaled[b].0))
        });
        'trim: while sum > target {
            let mut trimmed_any = false;
            for &i in &order {
                if sum <= target {
                    break 'trim;
                }
                if scaled[i].2 > 0 {
                    scaled[i].2 -= 1;
                    sum -= 1;
                    trimmed_any = true;
                }
            }
            if !trimmed_any {
                break;
            }
        }
    }

    let changes = scaled
        .iter()
        .filter(|(_, old, new, _)| old.raw() != *new)
        .map(|(id, old, new, _)| AmountChange {
            installment_id: *id,
            from: *old,
            to: Amount::new(*new),
        })
        .collect();

    let after = scaled.iter().map(|s| Amount::new(s.2)).sum();
    (changes, after)
}

/// The grossed-up order total, if adopting it is safe.
///
/// The new total must cover `allocated` (an order is never left
/// over-allocated) and stay within `tax_inclusive_tolerance` above it.
pub fn tax_inclusive_total(
    total: Amount,
    allocated: Amount,
    th: &RepairThresholds,
) -> Result<Amount, String> {
    let grossed = gross_up(total, th.tax_rate);
    if grossed < allocated {
        return Err(format!(
            "grossed-up total {grossed} is still {} below allocated {allocated}",
            allocated.saturating_sub(grossed)
        ));
    }
    let gap = grossed.saturating_sub(allocated);
    if gap >= th.tax_inclusive_tolerance {
        return Err(format!(
            "grossed-up total {grossed} exceeds allocated {allocated} by {gap}"
        ));
    }
    Ok(grossed)
}

/// Build the correction for `kind` on this snapshot using `method`.
///
/// The caller has already confirmed (by classifying the same snapshot) that
/// `kind` is present. Tolerances are re-checked here so a plan is never
/// produced outside the auto-correctable envelope.
pub fn plan_repair(
    kind: IssueKind,
    method: RepairMethod,
    order: &Order,
    installments: &[Installment],
    policy: CountingPolicy,
    th: &RepairThresholds,
) -> Result<RepairPlan, PlanError> {
    let own: Vec<&Installment> = installments
        .iter()
        .filter(|i| i.order_id == order.order_id)
        .collect();
    let owned: Vec<Installment> = own.iter().map(|i| (*i).clone()).collect();
    let total = order.total_amount;
    let allocated = allocated_total(order.order_id, &owned, None, policy);
    let mismatch = || PlanError::MethodMismatch { kind, method };

    match kind {
        IssueKind::ZeroTotalAnomaly => match method {
            RepairMethod::Auto => Err(PlanError::OperatorChoiceRequired { kind }),
            RepairMethod::AdoptAllocatedTotal => Ok(RepairPlan::SetOrderTotal {
                order_id: order.order_id,
                from: total,
                to: allocated,
            }),
            RepairMethod::ClearInstallments => {
                let mut ids: Vec<InstallmentId> = own
                    .iter()
                    .filter(|i| policy.counts(i.status))
                    .map(|i| i.installment_id)
                    .collect();
                ids.sort();
                Ok(RepairPlan::CancelInstallments {
                    order_id: order.order_id,
                    installment_ids: ids,
                })
            }
            _ => Err(mismatch()),
        },

        IssueKind::TaxInclusiveMismatch => match method {
            RepairMethod::Auto | RepairMethod::ScaleOrderTotal => {
                let grossed = tax_inclusive_total(total, allocated, th)
                    .map_err(|reason| PlanError::ManualReview { kind, reason })?;
                Ok(RepairPlan::SetOrderTotal {
                    order_id: order.order_id,
                    from: total,
                    to: grossed,
                })
            }
            _ => Err(mismatch()),
        },

        IssueKind::ProportionalOverAllocation => match method {
            RepairMethod::Auto | RepairMethod::ProportionalReduce => {
                let entries: Vec<(InstallmentId, Amount)> = own
                    .iter()
                    .filter(|i| policy.counts(i.status))
                    .map(|i| (i.installment_id, i.amount))
                    .collect();
                let (changes, after) = proportional_amounts(&entries, total, allocated);
                let residual = total.saturating_sub(after);
                if residual > th.max_rounding_residual {
                    return Err(PlanError::ManualReview {
                        kind,
                        reason: format!(
                            "rounding residual {residual} exceeds {}",
                            th.max_rounding_residual
                        ),
                    });
                }
                Ok(RepairPlan::ScaleInstallments {
                    order_id: order.order_id,
                    order_total: total,
                    changes,
                    allocated_before: allocated,
                    allocated_after: after,
                    residual,
                })
            }
            _ => Err(mismatch()),
        },

        IssueKind::SequenceGap => match method {
            RepairMethod::Auto | RepairMethod::Renumber => {
                let changes = sequence_gaps(&owned)
                    .into_iter()
                    .map(|g| SequenceChange {
                        installment_id: g.installment_id,
                        from: g.current,
                        to: g.expected,
                    })
                    .collect();
                Ok(RepairPlan::Renumber {
                    order_id: order.order_id,
                    changes,
                })
            }
            _ => Err(mismatch()),
        },

        IssueKind::ComplexDrift => Err(PlanError::ManualReview {
            kind,
            reason: format!("allocated {allocated} vs total {total} is outside every band"),
        }),
    }
}
