use tranche_allocation::{allocated_total, sequence_gaps, CountingPolicy};
use tranche_money::{round_minor_units, Amount};
use tranche_schemas::{Installment, Order};

use crate::plan::{proportional_amounts, tax_inclusive_total};
use crate::{Issue, IssueId, IssueKind, RepairThresholds, BPS_ONE};

/// Rounded `allocated / total` in basis points. Display only; band checks
/// never use the rounded value.
pub fn ratio_bps(allocated: Amount, total: Amount) -> Option<i64> {
    if total.is_zero() {
        return None;
    }
    Some(round_minor_units(
        allocated.raw() as i128 * BPS_ONE as i128,
        total.raw() as i128,
    ))
}

/// `allocated / total >= bps / 10_000`, exactly. `total` must be positive.
fn ratio_at_least(allocated: Amount, total: Amount, bps: i64) -> bool {
    allocated.raw() as i128 * BPS_ONE as i128 >= total.raw() as i128 * bps as i128
}

/// `allocated / total <= bps / 10_000`, exactly. `total` must be positive.
fn ratio_at_most(allocated: Amount, total: Amount, bps: i64) -> bool {
    allocated.raw() as i128 * BPS_ONE as i128 <= total.raw() as i128 * bps as i128
}

/// Classify one order snapshot. Returns at most one amount-drift issue plus
/// an optional sequence-gap issue; an empty vec means the order is clean.
///
/// `installments` may contain entries of other orders; they are ignored.
pub fn classify_order(
    order: &Order,
    installments: &[Installment],
    policy: CountingPolicy,
    th: &RepairThresholds,
) -> Vec<Issue> {
    let own: Vec<Installment> = installments
        .iter()
        .filter(|i| i.order_id == order.order_id)
        .cloned()
        .collect();

    let mut issues = Vec::new();
    if let Some(issue) = classify_amount(order, &own, policy, th) {
        issues.push(issue);
    }

    let gaps = sequence_gaps(&own);
    if !gaps.is_empty() {
        issues.push(Issue {
            id: IssueId {
                order_id: order.order_id,
                kind: IssueKind::SequenceGap,
            },
            order_total: order.total_amount,
            allocated_total: allocated_total(order.order_id, &own, None, policy),
            ratio_bps: None,
            auto_correctable: true,
            detail: format!("{} installment(s) out of the dense 1..N sequence", gaps.len()),
        });
    }

    issues
}

fn classify_amount(
    order: &Order,
    own: &[Installment],
    policy: CountingPolicy,
    th: &RepairThresholds,
) -> Option<Issue> {
    let total = order.total_amount;
    let allocated = allocated_total(order.order_id, own, None, policy);

    if allocated.saturating_sub(total).abs() < th.match_tolerance || allocated <= total {
        return None;
    }

    let issue = |kind: IssueKind, auto_correctable: bool, detail: String| Issue {
        id: IssueId {
            order_id: order.order_id,
            kind,
        },
        order_total: total,
        allocated_total: allocated,
        ratio_bps: ratio_bps(allocated, total),
        auto_correctable,
        detail,
    };

    if total.is_zero() {
        return Some(issue(
            IssueKind::ZeroTotalAnomaly,
            false,
            format!("order total is zero but {allocated} is allocated"),
        ));
    }
    if total.is_negative() {
        return Some(issue(
            IssueKind::ComplexDrift,
            false,
            format!("order total {total} is negative"),
        ));
    }

    if ratio_at_least(allocated, total, th.tax_band_low_bps)
        && ratio_at_most(allocated, total, th.tax_band_high_bps)
    {
        let (auto, detail) = match tax_inclusive_total(total, allocated, th) {
            Ok(grossed) => (
                true,
                format!("grossed-up total {grossed} covers allocated {allocated}"),
            ),
            Err(reason) => (false, reason),
        };
        return Some(issue(IssueKind::TaxInclusiveMismatch, auto, detail));
    }

    if !ratio_at_most(allocated, total, th.tax_band_high_bps)
        && !ratio_at_least(allocated, total, th.proportional_band_high_bps)
    {
        let entries: Vec<_> = own
            .iter()
            .filter(|i| policy.counts(i.status))
            .map(|i| (i.installment_id, i.amount))
            .collect();
        let (_, after) = proportional_amounts(&entries, total, allocated);
        let residual = total.saturating_sub(after);
        let auto = residual <= th.max_rounding_residual;
        return Some(issue(
            IssueKind::ProportionalOverAllocation,
            auto,
            format!("scaling {} installment(s) leaves residual {residual}", entries.len()),
        ));
    }

    Some(issue(
        IssueKind::ComplexDrift,
        false,
        format!("allocated {allocated} vs total {total} is outside every correctable band"),
    ))
}
