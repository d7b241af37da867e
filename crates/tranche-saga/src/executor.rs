use std::time::Duration;

use crate::state::{
    CompensationFailure, CompletedStep, Rollback, SagaFailure, SagaReport, SagaState, StepError,
};
use crate::step::SagaStep;

pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// An ordered list of steps over a context `C`.
pub struct Saga<C> {
    name: &'static str,
    steps: Vec<Box<dyn SagaStep<C>>>,
    step_timeout: Duration,
}

impl<C: Send + Sync> Saga<C> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            steps: Vec::new(),
            step_timeout: DEFAULT_STEP_TIMEOUT,
        }
    }

    pub fn step(mut self, step: impl SagaStep<C> + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Applies to every forward step and every compensation.
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub async fn run(&self, ctx: &mut C) -> Result<SagaReport, SagaFailure> {
        let mut trace = vec![SagaState::Pending];
        let mut done: Vec<CompletedStep> = Vec::with_capacity(self.steps.len());

        for (i, step) in self.steps.iter().enumerate() {
            trace.push(SagaState::StepExecuting(i));

            let outcome = match tokio::time::timeout(self.step_timeout, step.execute(ctx)).await {
                Ok(Ok(out)) => Ok(out),
                Ok(Err(e)) => Err(StepError::Failed(format!("{e:#}"))),
                Err(_) => Err(StepError::TimedOut(self.step_timeout)),
            };

            match outcome {
                Ok(output) => {
                    tracing::debug!(saga = self.name, step = step.name(), index = i, "saga_step_ok");
                    done.push(CompletedStep {
                        name: step.name(),
                        output,
                    });
                }
                Err(cause) => {
                    tracing::warn!(
                        saga = self.name,
                        step = step.name(),
                        index = i,
                        cause = %cause,
                        "saga_step_failed"
                    );
                    trace.push(SagaState::Failed(i));
                    // A dropped future may still have committed its effect.
                    let in_doubt = matches!(cause, StepError::TimedOut(_)).then_some(i);
                    let rollback = self.compensate(ctx, &done, in_doubt, &mut trace).await;
                    return Err(SagaFailure {
                        saga: self.name,
                        failed_step: step.name(),
                        failed_index: i,
                        cause,
                        rollback,
                        trace,
                    });
                }
            }
        }

        trace.push(SagaState::Completed);
        Ok(SagaReport {
            saga: self.name,
            steps: done,
            trace,
        })
    }

    /// Undo the timed-out step at `in_doubt` (if any), then `done` in reverse
    /// order. Does not stop at the first failure.
    async fn compensate(
        &self,
        ctx: &C,
        done: &[CompletedStep],
        in_doubt: Option<usize>,
        trace: &mut Vec<SagaState>,
    ) -> Rollback {
        let mut compensated = Vec::new();
        let mut failed = Vec::new();

        if let Some(i) = in_doubt {
            trace.push(SagaState::Compensating(i));
            let step = &self.steps[i];
            let res = tokio::time::timeout(self.step_timeout, step.compensate_in_doubt(ctx)).await;
            let cause = match res {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(StepError::Failed(format!("{e:#}"))),
                Err(_) => Some(StepError::TimedOut(self.step_timeout)),
            };
            if let Some(cause) = cause {
                tracing::error!(
                    saga = self.name,
                    step = step.name(),
                    index = i,
                    cause = %cause,
                    "saga_in_doubt_compensation_failed"
                );
                failed.push(CompensationFailure {
                    step: step.name(),
                    cause,
                });
            }
        }

        for (i, completed) in done.iter().enumerate().rev() {
            trace.push(SagaState::Compensating(i));
            let step = &self.steps[i];

            let res = tokio::time::timeout(
                self.step_timeout,
                step.compensate(ctx, &completed.output),
            )
            .await;
            let cause = match res {
                Ok(Ok(())) => {
                    compensated.push(completed.name);
                    continue;
                }
                Ok(Err(e)) => StepError::Failed(format!("{e:#}")),
                Err(_) => StepError::TimedOut(self.step_timeout),
            };

            tracing::error!(
                saga = self.name,
                step = completed.name,
                index = i,
                cause = %cause,
                payload = %completed.output.0,
                "saga_compensation_failed"
            );
            failed.push(CompensationFailure {
                step: completed.name,
                cause,
            });
        }

        if failed.is_empty() {
            trace.push(SagaState::RolledBack);
            Rollback::RolledBack { compensated }
        } else {
            trace.push(SagaState::PartialRollback);
            tracing::error!(
                saga = self.name,
                failed_compensations = failed.len(),
                "saga_partial_rollback"
            );
            Rollback::PartialRollback {
                compensated,
                failed,
            }
        }
    }
}

impl<C> std::fmt::Debug for Saga<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Saga")
            .field("name", &self.name)
            .field("steps", &self.steps.len())
            .field("step_timeout", &self.step_timeout)
            .finish()
    }
}
