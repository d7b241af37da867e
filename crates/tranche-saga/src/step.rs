use anyhow::Result;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

/// Opaque payload a step hands to its own compensation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StepOutput(pub Value);

impl StepOutput {
    pub fn empty() -> Self {
        StepOutput(Value::Null)
    }

    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(StepOutput(serde_json::to_value(value)?))
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.0.clone())?)
    }
}

/// One forward action plus its undo.
///
/// `execute` may stash values in the context for later steps; `compensate`
/// only reads it, together with the payload `execute` returned. A step that
/// times out never returns a payload and gets `compensate_in_doubt` instead.
#[async_trait]
pub trait SagaStep<C: Send + Sync>: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, ctx: &mut C) -> Result<StepOutput>;

    async fn compensate(&self, ctx: &C, output: &StepOutput) -> Result<()>;

    /// Undo whatever a timed-out `execute` may have committed before it was
    /// cut off. There is no payload; the effect may be absent, partial or
    /// complete, so the step must look it up. An effect that cannot be
    /// looked up is an error, which makes the rollback partial.
    ///
    /// The default is for steps whose effects live only in the context.
    async fn compensate_in_doubt(&self, _ctx: &C) -> Result<()> {
        Ok(())
    }
}
