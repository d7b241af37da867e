use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tranche_money::{Amount, TaxRate};
use tranche_schemas::{InstallmentId, OrderId};

/// One basis point is 1/10_000; a ratio of 1.0 is 10_000 bps.
pub const BPS_ONE: i64 = 10_000;

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

/// Band edges and tolerances used by classification and planning.
///
/// These are empirically tuned values, not derived invariants. Every field
/// can be overridden from configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairThresholds {
    /// `|allocated - total|` below this is a match.
    pub match_tolerance: Amount,
    /// Inclusive lower edge of the tax-inclusive band.
    pub tax_band_low_bps: i64,
    /// Inclusive upper edge of the tax-inclusive band.
    pub tax_band_high_bps: i64,
    /// Exclusive upper edge of the proportional band.
    pub proportional_band_high_bps: i64,
    /// A grossed-up total must land within this distance of the allocated
    /// total to be applied automatically.
    pub tax_inclusive_tolerance: Amount,
    /// Largest under-allocation a proportional repair may leave behind.
    pub max_rounding_residual: Amount,
    /// Rate used to gross up a tax-exclusive total.
    pub tax_rate: TaxRate,
}

impl Default for RepairThresholds {
    fn default() -> Self {
        Self {
            match_tolerance: Amount::new(1),
            tax_band_low_bps: 10_500,
            tax_band_high_bps: 11_500,
            proportional_band_high_bps: 30_000,
            tax_inclusive_tolerance: Amount::new(1_000),
            max_rounding_residual: Amount::new(100),
            tax_rate: TaxRate::STANDARD,
        }
    }
}

// ---------------------------------------------------------------------------
// Issues
// ---------------------------------------------------------------------------

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    ZeroTotalAnomaly,
    TaxInclusiveMismatch,
    ProportionalOverAllocation,
    ComplexDrift,
    SequenceGap,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueKind::ZeroTotalAnomaly => "zero_total_anomaly",
            IssueKind::TaxInclusiveMismatch => "tax_inclusive_mismatch",
            IssueKind::ProportionalOverAllocation => "proportional_over_allocation",
            IssueKind::ComplexDrift => "complex_drift",
            IssueKind::SequenceGap => "sequence_gap",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "zero_total_anomaly" => Some(IssueKind::ZeroTotalAnomaly),
            "tax_inclusive_mismatch" => Some(IssueKind::TaxInclusiveMismatch),
            "proportional_over_allocation" => Some(IssueKind::ProportionalOverAllocation),
            "complex_drift" => Some(IssueKind::ComplexDrift),
            "sequence_gap" => Some(IssueKind::SequenceGap),
            _ => None,
        }
    }

    /// Amount-drift kinds are mutually exclusive for one order.
    pub fn is_amount_drift(&self) -> bool {
        !matches!(self, IssueKind::SequenceGap)
    }
}

/// Stable handle for an issue: `"<order_id>:<kind>"`.
///
/// It names what is wrong, not a particular snapshot, so it stays valid
/// across rescans and is what `apply_repair` takes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IssueId {
    pub order_id: OrderId,
    pub kind: IssueKind,
}

impl fmt::Display for IssueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.order_id, self.kind.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueIdParseError(pub String);

impl fmt::Display for IssueIdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid issue id '{}': expected <order_id>:<kind>", self.0)
    }
}

impl std::error::Error for IssueIdParseError {}

impl FromStr for IssueId {
    type Err = IssueIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || IssueIdParseError(s.to_string());
        let (order, kind) = s.split_once(':').ok_or_else(err)?;
        let order_id = order.trim().parse::<i64>().map_err(|_| err())?;
        let kind = IssueKind::parse(kind.trim()).ok_or_else(err)?;
        Ok(IssueId {
            order_id: OrderId(order_id),
            kind,
        })
    }
}

/// One classified problem on one order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub id: IssueId,
    pub order_total: Amount,
    pub allocated_total: Amount,
    /// Rounded `allocated / total` in bps; `None` when the total is zero.
    pub ratio_bps: Option<i64>,
    /// True when `RepairMethod::Auto` can fix it without an operator choice.
    pub auto_correctable: bool,
    pub detail: String,
}

// ---------------------------------------------------------------------------
// Methods and plans
// ---------------------------------------------------------------------------

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairMethod {
    /// The default correction for the issue kind.
    Auto,
    ScaleOrderTotal,
    ProportionalReduce,
    AdoptAllocatedTotal,
    ClearInstallments,
    Renumber,
}

impl RepairMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepairMethod::Auto => "auto",
            RepairMethod::ScaleOrderTotal => "scale_order_total",
            RepairMethod::ProportionalReduce => "proportional_reduce",
            RepairMethod::AdoptAllocatedTotal => "adopt_allocated_total",
            RepairMethod::ClearInstallments => "clear_installments",
            RepairMethod::Renumber => "renumber",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(RepairMethod::Auto),
            "scale_order_total" => Some(RepairMethod::ScaleOrderTotal),
            "proportional_reduce" => Some(RepairMethod::ProportionalReduce),
            "adopt_allocated_total" => Some(RepairMethod::AdoptAllocatedTotal),
            "clear_installments" => Some(RepairMethod::ClearInstallments),
            "renumber" => Some(RepairMethod::Renumber),
            _ => None,
        }
    }
}

impl fmt::Display for RepairMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmountChange {
    pub installment_id: InstallmentId,
    pub from: Amount,
    pub to: Amount,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceChange {
    pub installment_id: InstallmentId,
    pub from: i32,
    pub to: i32,
}

/// A concrete correction. Every variant carries the values it expects to
/// overwrite so it can be written compare-and-set and reversed by hand.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RepairPlan {
    SetOrderTotal {
        order_id: OrderId,
        from: Amount,
        to: Amount,
    },
    ScaleInstallments {
        order_id: OrderId,
        order_total: Amount,
        changes: Vec<AmountChange>,
        allocated_before: Amount,
        allocated_after: Amount,
        /// `order_total - allocated_after`, never negative.
        residual: Amount,
    },
    CancelInstallments {
        order_id: OrderId,
        installment_ids: Vec<InstallmentId>,
    },
    Renumber {
        order_id: OrderId,
        changes: Vec<SequenceChange>,
    },
}

impl RepairPlan {
    pub fn order_id(&self) -> OrderId {
        match self {
            RepairPlan::SetOrderTotal { order_id, .. }
            | RepairPlan::ScaleInstallments { order_id, .. }
            | RepairPlan::CancelInstallments { order_id, .. }
            | RepairPlan::Renumber { order_id, .. } => *order_id,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            RepairPlan::SetOrderTotal { .. } => "set_order_total",
            RepairPlan::ScaleInstallments { .. } => "scale_installments",
            RepairPlan::CancelInstallments { .. } => "cancel_installments",
            RepairPlan::Renumber { .. } => "renumber",
        }
    }

    /// Number of rows the plan writes.
    pub fn write_count(&self) -> usize {
        match self {
            RepairPlan::SetOrderTotal { .. } => 1,
            RepairPlan::ScaleInstallments { changes, .. } => changes.len(),
            RepairPlan::CancelInstallments { installment_ids, .. } => installment_ids.len(),
            RepairPlan::Renumber { changes, .. } => changes.len(),
        }
    }
}

/// Why no plan could be produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlanError {
    /// The method does not apply to this kind of issue.
    MethodMismatch { kind: IssueKind, method: RepairMethod },
    /// Zero-total anomalies need an explicit method.
    OperatorChoiceRequired { kind: IssueKind },
    /// Outside the auto-correctable envelope.
    ManualReview { kind: IssueKind, reason: String },
}

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanError::MethodMismatch { kind, method } => {
                write!(f, "method {} does not apply to {}", method, kind.as_str())
            }
            PlanError::OperatorChoiceRequired { kind } => write!(
                f,
                "{} requires an explicit method (adopt_allocated_total or clear_installments)",
                kind.as_str()
            ),
            PlanError::ManualReview { kind, reason } => {
                write!(f, "{} needs manual review: {}", kind.as_str(), reason)
            }
        }
    }
}

impl std::error::Error for PlanError {}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RepairOutcome {
    /// The plan was written.
    Applied { issue: IssueId, plan: RepairPlan },
    /// The order has no issue of any kind now.
    AlreadyConsistent { issue: IssueId },
    /// The order still has issues, but not this one.
    NotApplicable { issue: IssueId, current: Vec<IssueKind> },
}

impl RepairOutcome {
    pub fn changed_anything(&self) -> bool {
        matches!(self, RepairOutcome::Applied { .. })
    }
}

/// Output of a scan over a set of orders.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    pub orders_scanned: u64,
    pub issues: Vec<Issue>,
}

impl ScanReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn count(&self, kind: IssueKind) -> usize {
        self.issues.iter().filter(|i| i.id.kind == kind).count()
    }

    pub fn auto_correctable(&self) -> impl Iterator<Item = &Issue> {
        self.issues.iter().filter(|i| i.auto_correctable)
    }
}
