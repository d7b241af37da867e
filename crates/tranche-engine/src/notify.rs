//! Outcome notifications for the request/response boundary.

use serde::{Deserialize, Serialize};
use tranche_schemas::{InstallmentId, OrderId};

use crate::error::{EngineError, Severity};

/// One severity-tagged result of an inbound operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub code: String,
    pub severity: Severity,
    pub order_id: Option<OrderId>,
    pub installment_id: Option<InstallmentId>,
    pub detail: String,
}

impl Outcome {
    pub fn info(code: &str, detail: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            severity: Severity::Info,
            order_id: None,
            installment_id: None,
            detail: detail.into(),
        }
    }

    pub fn from_error(err: &EngineError) -> Self {
        Self {
            code: err.outcome_code().to_string(),
            severity: err.severity(),
            order_id: None,
            installment_id: None,
            detail: err.to_string(),
        }
    }

    pub fn for_order(mut self, order_id: OrderId) -> Self {
        self.order_id = Some(order_id);
        self
    }

    pub fn for_installment(mut self, installment_id: InstallmentId) -> Self {
        self.installment_id = Some(installment_id);
        self
    }
}

pub trait NotificationSink: Send + Sync {
    fn notify(&self, outcome: &Outcome);
}

/// Default sink: one `tracing` event per outcome, level by severity.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, o: &Outcome) {
        let order_id = o.order_id.map(|id| id.raw());
        let installment_id = o.installment_id.map(|id| id.raw());
        match o.severity {
            Severity::Info => tracing::info!(
                code = %o.code, ?order_id, ?installment_id, detail = %o.detail, "outcome"
            ),
            Severity::Warning => tracing::warn!(
                code = %o.code, ?order_id, ?installment_id, detail = %o.detail, "outcome"
            ),
            Severity::Error | Severity::Critical => tracing::error!(
                code = %o.code,
                severity = o.severity.as_str(),
                ?order_id,
                ?installment_id,
                detail = %o.detail,
                "outcome"
            ),
        }
    }
}

/// Keeps every outcome in memory. Useful for callers that poll, and tests.
#[derive(Debug, Default)]
pub struct CollectingSink {
    seen: std::sync::Mutex<Vec<Outcome>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outcomes(&self) -> Vec<Outcome> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn codes(&self) -> Vec<String> {
        self.outcomes().into_iter().map(|o| o.code).collect()
    }
}

impl NotificationSink for CollectingSink {
    fn notify(&self, outcome: &Outcome) {
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(outcome.clone());
    }
}
