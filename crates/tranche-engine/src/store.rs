//! Outbound persistence contracts.
//!
//! Every write that can race with another writer is conditional: it names the
//! values it expects to find and reports [`WriteOutcome::Conflict`] instead of
//! overwriting. Blind writes are limited to compensation paths, which only
//! touch rows the same saga created.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tranche_money::Amount;
use tranche_reconcile::{AmountChange, SequenceChange};
use tranche_schemas::{
    DeliveryLine, Installment, InstallmentId, InstallmentStatus, Movement, MovementId, Order,
    OrderId,
};

/// Fields of a ledger entry before the store assigns its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewInstallment {
    pub order_id: OrderId,
    pub sequence_no: i32,
    pub amount: Amount,
    pub actor_id: String,
    pub session_id: String,
    pub memo: Option<String>,
    pub created_at_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(Installment),
    /// The order's `ledger_revision` moved since it was read.
    Conflict { current_revision: i64 },
    /// The order disappeared.
    OrderMissing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    /// A compared value did not match; nothing was written.
    Conflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum OrderScope {
    All,
    /// Inclusive on both ends.
    Range { from: OrderId, to: OrderId },
}

impl OrderScope {
    pub fn contains(&self, id: OrderId) -> bool {
        match self {
            OrderScope::All => true,
            OrderScope::Range { from, to } => *from <= id && id <= *to,
        }
    }
}

/// Orders and installments.
///
/// Every successful write touching an order or one of its installments bumps
/// `Order::ledger_revision`.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn fetch_order(&self, order_id: OrderId) -> Result<Option<Order>>;

    /// Ascending.
    async fn list_order_ids(&self, scope: OrderScope) -> Result<Vec<OrderId>>;

    /// All entries of the order, any status, by `(sequence_no, installment_id)`.
    async fn list_installments(&self, order_id: OrderId) -> Result<Vec<Installment>>;

    async fn fetch_installment(&self, id: InstallmentId) -> Result<Option<Installment>>;

    /// Insert a draft entry only if the order is still at `expected_revision`.
    async fn insert_installment_guarded(
        &self,
        new: &NewInstallment,
        expected_revision: i64,
    ) -> Result<InsertOutcome>;

    /// Hard delete. Compensation only.
    async fn delete_installment(&self, id: InstallmentId) -> Result<bool>;

    /// Draft -> confirmed, only if the entry still has `expected_amount` and
    /// the order is still at `expected_revision`.
    async fn confirm_installment(
        &self,
        id: InstallmentId,
        expected_amount: Amount,
        expected_revision: i64,
        at: DateTime<Utc>,
    ) -> Result<WriteOutcome>;

    /// Cancel every listed entry of the order, or none if any of them is
    /// already cancelled or belongs elsewhere.
    async fn cancel_installments(
        &self,
        order_id: OrderId,
        ids: &[InstallmentId],
        at: DateTime<Utc>,
    ) -> Result<WriteOutcome>;

    /// Undo a cancellation. Compensation only.
    async fn reinstate_installment(
        &self,
        id: InstallmentId,
        status: InstallmentStatus,
    ) -> Result<WriteOutcome>;

    async fn update_order_total(
        &self,
        order_id: OrderId,
        from: Amount,
        to: Amount,
        at: DateTime<Utc>,
    ) -> Result<WriteOutcome>;

    /// All-or-nothing; each change compares `from`.
    async fn apply_amount_changes(
        &self,
        order_id: OrderId,
        changes: &[AmountChange],
    ) -> Result<WriteOutcome>;

    /// All-or-nothing; each change compares `from`.
    async fn apply_sequence_changes(
        &self,
        order_id: OrderId,
        changes: &[SequenceChange],
    ) -> Result<WriteOutcome>;
}

/// Stock counters and the append-only movement log.
#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Add `delta` to the counter for `sku` (created at 0). Returns the new level.
    async fn adjust_stock(&self, sku: &str, delta: i64) -> Result<i64>;

    async fn stock_level(&self, sku: &str) -> Result<i64>;

    /// One row per line, in line order.
    async fn insert_movements(
        &self,
        installment_id: InstallmentId,
        lines: &[DeliveryLine],
        at: DateTime<Utc>,
    ) -> Result<Vec<MovementId>>;

    /// Compensation only.
    async fn delete_movements(&self, ids: &[MovementId]) -> Result<u64>;

    async fn list_movements(&self, installment_id: InstallmentId) -> Result<Vec<Movement>>;
}
