//! tranche-saga
//!
//! All-or-nothing execution of an ordered list of steps with explicit
//! compensation.
//!
//! - Steps run strictly in declaration order, each under a timeout.
//! - The first failing (or timed-out) step stops forward execution.
//! - A step that timed out may have committed before it was cut off; it is
//!   asked to find and undo its own effect first.
//! - Every step that completed is compensated in strict reverse order.
//!   Compensation is best-effort: one failing compensation is logged at error
//!   level and the remaining ones still run.
//! - The result says whether the rollback was complete (`RolledBack`) or not
//!   (`PartialRollback`). A partial rollback is never reported as anything
//!   milder.
//! - No retries. Callers resubmit.

mod executor;
mod state;
mod step;

pub use executor::{Saga, DEFAULT_STEP_TIMEOUT};
pub use state::{
    CompensationFailure, CompletedStep, Rollback, SagaFailure, SagaReport, SagaState, StepError,
};
pub use step::{SagaStep, StepOutput};
