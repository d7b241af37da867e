use std::fmt;
use std::time::Duration;

use crate::step::StepOutput;

// ---------------------------------------------------------------------------
// SagaState
// ---------------------------------------------------------------------------

/// Lifecycle of one saga run.
///
/// ```text
/// Pending -> StepExecuting(0) -> .. -> StepExecuting(n-1) -> Completed
///                     |
///                  Failed(i) -> Compensating(i-1) -> .. -> Compensating(0)
///                                                         -> RolledBack
///                                                          | PartialRollback
/// ```
///
/// When step `i` timed out, `Compensating(i)` (its in-doubt undo) comes
/// right after `Failed(i)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaState {
    Pending,
    StepExecuting(usize),
    Completed,
    Failed(usize),
    Compensating(usize),
    RolledBack,
    PartialRollback,
}

impl SagaState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaState::Completed | SagaState::RolledBack | SagaState::PartialRollback
        )
    }
}

impl fmt::Display for SagaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SagaState::Pending => write!(f, "pending"),
            SagaState::StepExecuting(i) => write!(f, "step_executing({i})"),
            SagaState::Completed => write!(f, "completed"),
            SagaState::Failed(i) => write!(f, "failed({i})"),
            SagaState::Compensating(i) => write!(f, "compensating({i})"),
            SagaState::RolledBack => write!(f, "rolled_back"),
            SagaState::PartialRollback => write!(f, "partial_rollback"),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepError {
    Failed(String),
    TimedOut(Duration),
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepError::Failed(msg) => write!(f, "{msg}"),
            StepError::TimedOut(d) => write!(f, "timed out after {}ms", d.as_millis()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompensationFailure {
    pub step: &'static str,
    pub cause: StepError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rollback {
    /// Every completed step was compensated.
    RolledBack { compensated: Vec<&'static str> },
    /// At least one compensation failed; some effects may remain.
    PartialRollback {
        compensated: Vec<&'static str>,
        failed: Vec<CompensationFailure>,
    },
}

impl Rollback {
    pub fn is_complete(&self) -> bool {
        matches!(self, Rollback::RolledBack { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SagaFailure {
    pub saga: &'static str,
    pub failed_step: &'static str,
    pub failed_index: usize,
    pub cause: StepError,
    pub rollback: Rollback,
    pub trace: Vec<SagaState>,
}

impl fmt::Display for SagaFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "saga {} failed at step {} ({}): {}",
            self.saga, self.failed_index, self.failed_step, self.cause
        )?;
        match &self.rollback {
            Rollback::RolledBack { .. } => write!(f, "; rolled back"),
            Rollback::PartialRollback { failed, .. } => {
                write!(f, "; PARTIAL ROLLBACK, {} compensation(s) failed", failed.len())
            }
        }
    }
}

impl std::error::Error for SagaFailure {}

// ---------------------------------------------------------------------------
// Success
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct CompletedStep {
    pub name: &'static str,
    pub output: StepOutput,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SagaReport {
    pub saga: &'static str,
    pub steps: Vec<CompletedStep>,
    pub trace: Vec<SagaState>,
}

impl SagaReport {
    pub fn completed_steps(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name).collect()
    }
}
