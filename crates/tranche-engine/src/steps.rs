//! Saga steps for accepting and cancelling an installment.
//!
//! Steps never decide business outcomes silently. A step that refuses (a
//! duplicate, an order that no longer has room) stores the refusal in the
//! context and fails, so the executor compensates whatever ran before it and
//! the service reports the refusal instead of a generic step failure.

use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tranche_allocation::{next_sequence_no, remaining, CountingPolicy, RemainingResult};
use tranche_dedupe::{
    fingerprint, DedupeRegistry, DuplicateDetector, Fingerprint, OperationDescriptor, OperationKind,
};
use tranche_saga::{SagaStep, StepOutput};
use tranche_schemas::{DeliveryLine, Installment, InstallmentId, InstallmentStatus, MovementId};

use crate::error::EngineError;
use crate::retry::with_read_retry;
use crate::service::SubmitRequest;
use crate::store::{InsertOutcome, InventoryStore, LedgerStore, NewInstallment, WriteOutcome};

pub(crate) const REGISTER_FINGERPRINT: &str = "register_fingerprint";
pub(crate) const INSERT_LEDGER_ENTRY: &str = "insert_ledger_entry";
pub(crate) const ADJUST_STOCK: &str = "adjust_stock";
pub(crate) const WRITE_MOVEMENTS: &str = "write_movements";

pub(crate) const MARK_CANCELLED: &str = "mark_cancelled";
pub(crate) const REVERSE_STOCK: &str = "reverse_stock";
pub(crate) const WRITE_REVERSING_MOVEMENTS: &str = "write_reversing_movements";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct StockDelta {
    pub sku: String,
    pub delta: i64,
}

/// Stores shared by both sagas.
#[derive(Clone)]
pub(crate) struct Stores {
    pub ledger: Arc<dyn LedgerStore>,
    pub inventory: Arc<dyn InventoryStore>,
    pub read_retry_attempts: u32,
}

/// Stock adjustments made so far by the running stock step. Written as the
/// step goes, so it survives the step being cut off by a timeout.
#[derive(Debug, Default)]
pub(crate) struct StockProgress {
    pub applied: Vec<StockDelta>,
    /// Sent to the store, no answer yet.
    pub in_flight: Option<StockDelta>,
}

/// Apply `deltas` in order, recording progress. If one fails, undo the ones
/// already applied. Returns the applied deltas, or the failure plus any
/// deltas whose undo also failed (those are still in the store).
async fn apply_stock_deltas(
    inventory: &dyn InventoryStore,
    deltas: &[StockDelta],
    progress: &mut StockProgress,
) -> Result<Vec<StockDelta>, (anyhow::Error, Vec<StockDelta>)> {
    for d in deltas {
        progress.in_flight = Some(d.clone());
        let res = inventory.adjust_stock(&d.sku, d.delta).await;
        progress.in_flight = None;
        if let Err(e) = res {
            let mut stuck = Vec::new();
            for done in progress.applied.iter().rev() {
                if let Err(undo) = inventory.adjust_stock(&done.sku, -done.delta).await {
                    tracing::error!(
                        sku = %done.sku,
                        delta = done.delta,
                        error = %format!("{undo:#}"),
                        "stock_undo_failed"
                    );
                    stuck.push(done.clone());
                }
            }
            progress.applied.clear();
            return Err((e.context(format!("adjust stock for {}", d.sku)), stuck));
        }
        progress.applied.push(d.clone());
    }
    Ok(progress.applied.clone())
}

/// Undo for a stock step that timed out: revert what it recorded as applied.
/// An adjustment that was still waiting on the store cannot be told apart
/// from one that never happened, so it is reported as unresolved.
async fn revert_in_doubt_stock(inventory: &dyn InventoryStore, progress: &StockProgress) -> Result<()> {
    let reverted = revert_stock_deltas(inventory, &progress.applied).await;
    if let Some(d) = &progress.in_flight {
        tracing::error!(sku = %d.sku, delta = d.delta, "stock_adjustment_in_doubt");
        bail!(
            "stock adjustment {}:{} was cut off and may have been applied",
            d.sku,
            d.delta
        );
    }
    reverted
}

/// Inverse of every applied delta, in reverse order. Keeps going after a
/// failure and reports the first error.
async fn revert_stock_deltas(inventory: &dyn InventoryStore, applied: &[StockDelta]) -> Result<()> {
    let mut first_err = None;
    for d in applied.iter().rev() {
        if let Err(e) = inventory.adjust_stock(&d.sku, -d.delta).await {
            first_err.get_or_insert(e.context(format!("revert stock for {}", d.sku)));
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Acceptance
// ---------------------------------------------------------------------------

pub(crate) struct AcceptCtx {
    pub stores: Stores,
    pub detector: DuplicateDetector<dyn DedupeRegistry>,
    pub policy: CountingPolicy,
    pub max_insert_attempts: u32,
    pub request: SubmitRequest,
    pub now: DateTime<Utc>,

    pub fingerprint: Option<Fingerprint>,
    pub installment: Option<Installment>,
    pub remaining: Option<RemainingResult>,
    /// Set by a step that refuses the request.
    pub rejection: Option<EngineError>,
    /// Stock deltas a failed step could not undo itself.
    pub stuck_stock: Vec<StockDelta>,
    pub stock: StockProgress,
}

impl AcceptCtx {
    fn descriptor(&self) -> OperationDescriptor {
        OperationDescriptor {
            order_id: self.request.order_id,
            amount: self.request.amount,
            kind: OperationKind::SubmitInstallment,
            actor_id: self.request.actor_id.clone(),
            session_id: self.request.session_id.clone(),
        }
    }

    fn installment_id(&self) -> Result<InstallmentId> {
        self.installment
            .as_ref()
            .map(|i| i.installment_id)
            .ok_or_else(|| anyhow!("no ledger entry in context"))
    }
}

pub(crate) struct RegisterFingerprint;

#[async_trait]
impl SagaStep<AcceptCtx> for RegisterFingerprint {
    fn name(&self) -> &'static str {
        REGISTER_FINGERPRINT
    }

    async fn execute(&self, ctx: &mut AcceptCtx) -> Result<StepOutput> {
        let check = ctx.detector.check_and_record(&ctx.descriptor(), ctx.now).await;
        if check.is_duplicate() {
            let short = check.fingerprint.short().to_string();
            ctx.rejection = Some(EngineError::Duplicate(check));
            bail!("duplicate operation {short}");
        }
        let out = StepOutput::json(&check.fingerprint)?;
        ctx.fingerprint = Some(check.fingerprint);
        Ok(out)
    }

    async fn compensate(&self, ctx: &AcceptCtx, output: &StepOutput) -> Result<()> {
        let fp: Fingerprint = output.decode()?;
        ctx.detector.release(&fp).await?;
        Ok(())
    }

    async fn compensate_in_doubt(&self, ctx: &AcceptCtx) -> Result<()> {
        // The per-order lock keeps any other holder of this fingerprint out,
        // so a live record here can only be ours.
        ctx.detector.release(&fingerprint(&ctx.descriptor())).await?;
        Ok(())
    }
}

/// Guarded insert. Re-reads and re-runs the calculator after every revision
/// conflict, up to `max_insert_attempts`.
pub(crate) struct InsertLedgerEntry;

#[async_trait]
impl SagaStep<AcceptCtx> for InsertLedgerEntry {
    fn name(&self) -> &'static str {
        INSERT_LEDGER_ENTRY
    }

    async fn execute(&self, ctx: &mut AcceptCtx) -> Result<StepOutput> {
        let order_id = ctx.request.order_id;
        let attempts = ctx.max_insert_attempts.max(1);
        let ledger = Arc::clone(&ctx.stores.ledger);
        let retries = ctx.stores.read_retry_attempts;

        for attempt in 1..=attempts {
            let order = with_read_retry("fetch_order", retries, || ledger.fetch_order(order_id)).await?;
            let Some(order) = order else {
                ctx.rejection = Some(EngineError::NotFound(format!("order {order_id}")));
                bail!("order {order_id} not found");
            };
            let existing =
                with_read_retry("list_installments", retries, || ledger.list_installments(order_id))
                    .await?;

            let r = remaining(&order, &existing, ctx.request.amount, None, ctx.policy);
            if r.is_exceeding {
                ctx.rejection = Some(EngineError::ExceedsRemaining {
                    order_id,
                    remaining: r,
                });
                bail!("order {order_id}: candidate exceeds remaining");
            }

            let new = NewInstallment {
                order_id,
                sequence_no: next_sequence_no(&existing),
                amount: ctx.request.amount,
                actor_id: ctx.request.actor_id.clone(),
                session_id: ctx.request.session_id.clone(),
                memo: ctx.request.memo.clone(),
                created_at_utc: ctx.now,
            };

            match ledger.insert_installment_guarded(&new, order.ledger_revision).await? {
                InsertOutcome::Inserted(inst) => {
                    let out = StepOutput::json(&inst.installment_id)?;
                    ctx.installment = Some(inst);
                    ctx.remaining = Some(r);
                    return Ok(out);
                }
                InsertOutcome::Conflict { current_revision } => {
                    tracing::debug!(
                        order_id = order_id.raw(),
                        attempt,
                        read_revision = order.ledger_revision,
                        current_revision,
                        "ledger_insert_conflict"
                    );
                }
                InsertOutcome::OrderMissing => {
                    ctx.rejection = Some(EngineError::NotFound(format!("order {order_id}")));
                    bail!("order {order_id} disappeared");
                }
            }
        }

        ctx.rejection = Some(EngineError::ConcurrentModification { order_id, attempts });
        bail!("order {order_id}: revision conflict on every attempt")
    }

    async fn compensate(&self, ctx: &AcceptCtx, output: &StepOutput) -> Result<()> {
        let id: InstallmentId = output.decode()?;
        if !ctx.stores.ledger.delete_installment(id).await? {
            tracing::warn!(installment_id = id.raw(), "ledger_entry_already_gone");
        }
        Ok(())
    }

    /// Delete a draft this attempt may have inserted: same actor, session,
    /// amount and creation instant. The fingerprint registered in the step
    /// before rules out a second live attempt with the same shape.
    async fn compensate_in_doubt(&self, ctx: &AcceptCtx) -> Result<()> {
        let req = &ctx.request;
        let ledger = &ctx.stores.ledger;
        let entries = with_read_retry("list_installments", ctx.stores.read_retry_attempts, || {
            ledger.list_installments(req.order_id)
        })
        .await?;
        for inst in entries.iter().filter(|i| {
            i.status == InstallmentStatus::Draft
                && i.actor_id == req.actor_id
                && i.session_id == req.session_id
                && i.amount == req.amount
                && i.created_at_utc == ctx.now
        }) {
            ledger.delete_installment(inst.installment_id).await?;
            tracing::warn!(
                order_id = req.order_id.raw(),
                installment_id = inst.installment_id.raw(),
                "ledger_entry_removed_after_timeout"
            );
        }
        Ok(())
    }
}

pub(crate) struct AdjustStock;

#[async_trait]
impl SagaStep<AcceptCtx> for AdjustStock {
    fn name(&self) -> &'static str {
        ADJUST_STOCK
    }

    async fn execute(&self, ctx: &mut AcceptCtx) -> Result<StepOutput> {
        let deltas: Vec<StockDelta> = ctx
            .request
            .lines
            .iter()
            .map(|l| StockDelta {
                sku: l.sku.clone(),
                delta: l.quantity_delta,
            })
            .collect();
        let inventory = Arc::clone(&ctx.stores.inventory);
        match apply_stock_deltas(inventory.as_ref(), &deltas, &mut ctx.stock).await {
            Ok(applied) => StepOutput::json(&applied),
            Err((e, stuck)) => {
                ctx.stuck_stock.extend(stuck);
                Err(e)
            }
        }
    }

    async fn compensate(&self, ctx: &AcceptCtx, output: &StepOutput) -> Result<()> {
        let applied: Vec<StockDelta> = output.decode()?;
        revert_stock_deltas(ctx.stores.inventory.as_ref(), &applied).await
    }

    async fn compensate_in_doubt(&self, ctx: &AcceptCtx) -> Result<()> {
        revert_in_doubt_stock(ctx.stores.inventory.as_ref(), &ctx.stock).await
    }
}

pub(crate) struct WriteMovements;

#[async_trait]
impl SagaStep<AcceptCtx> for WriteMovements {
    fn name(&self) -> &'static str {
        WRITE_MOVEMENTS
    }

    async fn execute(&self, ctx: &mut AcceptCtx) -> Result<StepOutput> {
        if ctx.request.lines.is_empty() {
            return StepOutput::json(&Vec::<MovementId>::new());
        }
        let id = ctx.installment_id()?;
        let ids = ctx
            .stores
            .inventory
            .insert_movements(id, &ctx.request.lines, ctx.now)
            .await?;
        StepOutput::json(&ids)
    }

    async fn compensate(&self, ctx: &AcceptCtx, output: &StepOutput) -> Result<()> {
        let ids: Vec<MovementId> = output.decode()?;
        if !ids.is_empty() {
            ctx.stores.inventory.delete_movements(&ids).await?;
        }
        Ok(())
    }

    /// The entry was created by this saga, so every movement tied to it is ours.
    async fn compensate_in_doubt(&self, ctx: &AcceptCtx) -> Result<()> {
        let Some(inst) = &ctx.installment else {
            return Ok(());
        };
        let ids: Vec<MovementId> = ctx
            .stores
            .inventory
            .list_movements(inst.installment_id)
            .await?
            .into_iter()
            .map(|m| m.movement_id)
            .collect();
        if !ids.is_empty() {
            ctx.stores.inventory.delete_movements(&ids).await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

pub(crate) struct CancelCtx {
    pub stores: Stores,
    pub installment: Installment,
    /// Delivery lines that reverse the entry's original movements.
    pub reversal: Vec<DeliveryLine>,
    pub now: DateTime<Utc>,

    /// Movements the entry had before this cancellation started.
    pub original_movements: Vec<MovementId>,

    pub rejection: Option<EngineError>,
    pub stuck_stock: Vec<StockDelta>,
    pub stock: StockProgress,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CancelledEntry {
    installment_id: InstallmentId,
    previous_status: InstallmentStatus,
}

pub(crate) struct MarkCancelled;

#[async_trait]
impl SagaStep<CancelCtx> for MarkCancelled {
    fn name(&self) -> &'static str {
        MARK_CANCELLED
    }

    async fn execute(&self, ctx: &mut CancelCtx) -> Result<StepOutput> {
        let inst = &ctx.installment;
        let outcome = ctx
            .stores
            .ledger
            .cancel_installments(inst.order_id, &[inst.installment_id], ctx.now)
            .await?;
        if outcome == WriteOutcome::Conflict {
            ctx.rejection = Some(EngineError::ConcurrentModification {
                order_id: inst.order_id,
                attempts: 1,
            });
            bail!("installment {} changed before it could be cancelled", inst.installment_id);
        }
        StepOutput::json(&CancelledEntry {
            installment_id: inst.installment_id,
            previous_status: inst.status,
        })
    }

    async fn compensate(&self, ctx: &CancelCtx, output: &StepOutput) -> Result<()> {
        let entry: CancelledEntry = output.decode()?;
        match ctx
            .stores
            .ledger
            .reinstate_installment(entry.installment_id, entry.previous_status)
            .await?
        {
            WriteOutcome::Applied => Ok(()),
            WriteOutcome::Conflict => bail!(
                "installment {} is no longer cancelled; cannot reinstate",
                entry.installment_id
            ),
        }
    }

    async fn compensate_in_doubt(&self, ctx: &CancelCtx) -> Result<()> {
        let inst = &ctx.installment;
        let current = ctx.stores.ledger.fetch_installment(inst.installment_id).await?;
        let cancelled_here = current.is_some_and(|c| {
            c.status == InstallmentStatus::Cancelled && c.cancelled_at_utc == Some(ctx.now)
        });
        if !cancelled_here {
            return Ok(());
        }
        match ctx
            .stores
            .ledger
            .reinstate_installment(inst.installment_id, inst.status)
            .await?
        {
            WriteOutcome::Applied => Ok(()),
            WriteOutcome::Conflict => bail!(
                "installment {} changed after a timed-out cancel; cannot reinstate",
                inst.installment_id
            ),
        }
    }
}

pub(crate) struct ReverseStock;

#[async_trait]
impl SagaStep<CancelCtx> for ReverseStock {
    fn name(&self) -> &'static str {
        REVERSE_STOCK
    }

    async fn execute(&self, ctx: &mut CancelCtx) -> Result<StepOutput> {
        let deltas: Vec<StockDelta> = ctx
            .reversal
            .iter()
            .map(|l| StockDelta {
                sku: l.sku.clone(),
                delta: l.quantity_delta,
            })
            .collect();
        let inventory = Arc::clone(&ctx.stores.inventory);
        match apply_stock_deltas(inventory.as_ref(), &deltas, &mut ctx.stock).await {
            Ok(applied) => StepOutput::json(&applied),
            Err((e, stuck)) => {
                ctx.stuck_stock.extend(stuck);
                Err(e)
            }
        }
    }

    async fn compensate(&self, ctx: &CancelCtx, output: &StepOutput) -> Result<()> {
        let applied: Vec<StockDelta> = output.decode()?;
        revert_stock_deltas(ctx.stores.inventory.as_ref(), &applied).await
    }

    async fn compensate_in_doubt(&self, ctx: &CancelCtx) -> Result<()> {
        revert_in_doubt_stock(ctx.stores.inventory.as_ref(), &ctx.stock).await
    }
}

pub(crate) struct WriteReversingMovements;

#[async_trait]
impl SagaStep<CancelCtx> for WriteReversingMovements {
    fn name(&self) -> &'static str {
        WRITE_REVERSING_MOVEMENTS
    }

    async fn execute(&self, ctx: &mut CancelCtx) -> Result<StepOutput> {
        if ctx.reversal.is_empty() {
            return StepOutput::json(&Vec::<MovementId>::new());
        }
        let ids = ctx
            .stores
            .inventory
            .insert_movements(ctx.installment.installment_id, &ctx.reversal, ctx.now)
            .await?;
        StepOutput::json(&ids)
    }

    async fn compensate(&self, ctx: &CancelCtx, output: &StepOutput) -> Result<()> {
        let ids: Vec<MovementId> = output.decode()?;
        if !ids.is_empty() {
            ctx.stores.inventory.delete_movements(&ids).await?;
        }
        Ok(())
    }

    async fn compensate_in_doubt(&self, ctx: &CancelCtx) -> Result<()> {
        let ids: Vec<MovementId> = ctx
            .stores
            .inventory
            .list_movements(ctx.installment.installment_id)
            .await?
            .into_iter()
            .map(|m| m.movement_id)
            .filter(|id| !ctx.original_movements.contains(id))
            .collect();
        if !ids.is_empty() {
            ctx.stores.inventory.delete_movements(&ids).await?;
        }
        Ok(())
    }
}
