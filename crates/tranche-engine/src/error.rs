use std::fmt;

use serde::{Deserialize, Serialize};
use tranche_allocation::{CandidateError, RemainingResult};
use tranche_dedupe::DedupeCheck;
use tranche_reconcile::{IssueId, PlanError};
use tranche_saga::SagaFailure;
use tranche_schemas::{InstallmentId, OrderId};

/// How loudly an outcome must be surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    /// Effects may remain in the store; an operator has to look.
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub enum EngineError {
    /// Rejected before any lookup or side effect.
    Validation(String),
    NotFound(String),
    ExceedsRemaining {
        order_id: OrderId,
        remaining: RemainingResult,
    },
    Duplicate(DedupeCheck),
    StepFailed(SagaFailure),
    AlreadyConfirmed(InstallmentId),
    AmountIntegrity {
        installment_id: InstallmentId,
        reason: String,
    },
    ConcurrentModification {
        order_id: OrderId,
        attempts: u32,
    },
    RepairAmbiguous {
        issue: IssueId,
        reason: String,
    },
    RepairConflict {
        issue: IssueId,
        reason: String,
    },
    Store(anyhow::Error),
}

impl EngineError {
    /// Stable machine-readable code.
    pub fn outcome_code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation_failed",
            EngineError::NotFound(_) => "not_found",
            EngineError::ExceedsRemaining { .. } => "exceeds_remaining",
            EngineError::Duplicate(_) => "duplicate_operation",
            EngineError::StepFailed(f) if f.rollback.is_complete() => "step_failed_rolled_back",
            EngineError::StepFailed(_) => "step_failed_partial_rollback",
            EngineError::AlreadyConfirmed(_) => "already_confirmed",
            EngineError::AmountIntegrity { .. } => "amount_integrity",
            EngineError::ConcurrentModification { .. } => "concurrent_modification",
            EngineError::RepairAmbiguous { .. } => "repair_ambiguous",
            EngineError::RepairConflict { .. } => "repair_conflict",
            EngineError::Store(_) => "store_unavailable",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            EngineError::Validation(_)
            | EngineError::NotFound(_)
            | EngineError::ExceedsRemaining { .. }
            | EngineError::Duplicate(_)
            | EngineError::AlreadyConfirmed(_) => Severity::Warning,
            EngineError::StepFailed(f) if !f.rollback.is_complete() => Severity::Critical,
            EngineError::AmountIntegrity { .. } => Severity::Critical,
            EngineError::StepFailed(_)
            | EngineError::ConcurrentModification { .. }
            | EngineError::RepairAmbiguous { .. }
            | EngineError::RepairConflict { .. }
            | EngineError::Store(_) => Severity::Error,
        }
    }

    pub fn remaining(&self) -> Option<&RemainingResult> {
        match self {
            EngineError::ExceedsRemaining { remaining, .. } => Some(remaining),
            _ => None,
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "validation failed: {msg}"),
            EngineError::NotFound(what) => write!(f, "not found: {what}"),
            EngineError::ExceedsRemaining {
                order_id,
                remaining,
            } => write!(
                f,
                "order {order_id}: candidate {} exceeds remaining {} (total {}, allocated {}, over by {})",
                remaining.candidate_amount,
                remaining.available_before_candidate(),
                remaining.order_total,
                remaining.allocated_total,
                remaining.exceeding_amount
            ),
            EngineError::Duplicate(check) => {
                write!(f, "duplicate operation (fingerprint {})", check.fingerprint.short())
            }
            EngineError::StepFailed(failure) => write!(f, "{failure}"),
            EngineError::AlreadyConfirmed(id) => write!(f, "installment {id} is already confirmed"),
            EngineError::AmountIntegrity {
                installment_id,
                reason,
            } => write!(f, "installment {installment_id}: amount integrity check failed: {reason}"),
            EngineError::ConcurrentModification { order_id, attempts } => write!(
                f,
                "order {order_id}: ledger changed concurrently on {attempts} consecutive attempts"
            ),
            EngineError::RepairAmbiguous { issue, reason } => {
                write!(f, "repair {issue} needs manual review: {reason}")
            }
            EngineError::RepairConflict { issue, reason } => {
                write!(f, "repair {issue} lost a race: {reason}")
            }
            EngineError::Store(e) => write!(f, "store unavailable: {e:#}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::StepFailed(f) => Some(f),
            EngineError::Store(e) => {
                let inner: &(dyn std::error::Error + 'static) = e.as_ref();
                Some(inner)
            }
            _ => None,
        }
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(e: anyhow::Error) -> Self {
        EngineError::Store(e)
    }
}

impl From<CandidateError> for EngineError {
    fn from(e: CandidateError) -> Self {
        EngineError::Validation(e.to_string())
    }
}

impl From<SagaFailure> for EngineError {
    fn from(f: SagaFailure) -> Self {
        EngineError::StepFailed(f)
    }
}

pub(crate) fn plan_error(issue: IssueId, e: PlanError) -> EngineError {
    EngineError::RepairAmbiguous {
        issue,
        reason: e.to_string(),
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
