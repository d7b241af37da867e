use std::fmt;

use serde::{Deserialize, Serialize};
use tranche_money::Amount;
use tranche_schemas::{InstallmentId, InstallmentStatus, OrderId};

/// Which installment statuses count toward the allocated total.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountingPolicy {
    /// Confirmed and draft entries both reserve room on the order.
    #[default]
    ConfirmedAndDraft,
    /// Only confirmed entries count; drafts reserve nothing.
    ConfirmedOnly,
}

impl CountingPolicy {
    pub fn counts(&self, status: InstallmentStatus) -> bool {
        match (self, status) {
            (_, InstallmentStatus::Confirmed) => true,
            (CountingPolicy::ConfirmedAndDraft, InstallmentStatus::Draft) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CountingPolicy::ConfirmedAndDraft => "confirmed_and_draft",
            CountingPolicy::ConfirmedOnly => "confirmed_only",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "confirmed_and_draft" => Some(CountingPolicy::ConfirmedAndDraft),
            "confirmed_only" => Some(CountingPolicy::ConfirmedOnly),
            _ => None,
        }
    }
}

/// Output of [`crate::remaining`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemainingResult {
    pub order_total: Amount,
    pub allocated_total: Amount,
    pub candidate_amount: Amount,
    /// `allocated_total + candidate_amount`.
    pub projected_total: Amount,
    /// `order_total - projected_total`: room left once the candidate is
    /// accepted. Negative when exceeding.
    pub remaining_amount: Amount,
    pub is_exceeding: bool,
    /// `max(0, projected_total - order_total)`.
    pub exceeding_amount: Amount,
}

impl RemainingResult {
    /// Room on the order before the candidate is applied.
    pub fn available_before_candidate(&self) -> Amount {
        self.order_total.saturating_sub(self.allocated_total)
    }
}

/// Candidate amount rejected before any lookup.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CandidateError {
    Negative(Amount),
    Zero,
}

impl fmt::Display for CandidateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateError::Negative(a) => write!(f, "installment amount must be > 0, got {a}"),
            CandidateError::Zero => write!(f, "installment amount must be > 0, got 0.00"),
        }
    }
}

impl std::error::Error for CandidateError {}

/// Confirmed installments sum above the order total.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvariantViolation {
    pub order_id: OrderId,
    pub order_total: Amount,
    pub confirmed_total: Amount,
    pub overage: Amount,
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "order {}: confirmed installments {} exceed order total {} by {}",
            self.order_id, self.confirmed_total, self.order_total, self.overage
        )
    }
}

impl std::error::Error for InvariantViolation {}

/// A position in the dense 1..N sequence that is wrong.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SequenceGap {
    pub installment_id: InstallmentId,
    pub current: i32,
    pub expected: i32,
}
