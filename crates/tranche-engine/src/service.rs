//! Inbound interface of the engine.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tranche_allocation::{remaining, validate_candidate, RemainingResult};
use tranche_audit::JournalWriter;
use tranche_config::EngineSettings;
use tranche_dedupe::{
    fingerprint, DedupeRegistry, DuplicateDetector, OperationDescriptor, OperationKind,
};
use tranche_money::Amount;
use tranche_saga::{CompensationFailure, Rollback, Saga, SagaFailure, SagaState, StepError};
use tranche_schemas::{
    DeliveryLine, Installment, InstallmentId, InstallmentStatus, Order, OrderId,
};

use crate::clock::{Clock, SystemClock};
use crate::error::{EngineError, EngineResult};
use crate::locks::OrderLocks;
use crate::notify::{NotificationSink, Outcome, TracingSink};
use crate::retry::with_read_retry;
use crate::steps::{
    AcceptCtx, AdjustStock, CancelCtx, InsertLedgerEntry, MarkCancelled, RegisterFingerprint,
    ReverseStock, StockDelta, StockProgress, Stores, WriteMovements, WriteReversingMovements,
    ADJUST_STOCK, REVERSE_STOCK,
};
use crate::store::{InventoryStore, LedgerStore, WriteOutcome};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub order_id: OrderId,
    pub amount: Amount,
    pub actor_id: String,
    pub session_id: String,
    pub memo: Option<String>,
    #[serde(default)]
    pub lines: Vec<DeliveryLine>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accepted {
    pub installment_id: InstallmentId,
    pub sequence_no: i32,
    /// Room left on the order after this entry.
    pub remaining: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmed {
    pub installment_id: InstallmentId,
    pub confirmed_at_utc: DateTime<Utc>,
    pub remaining: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancelled {
    pub installment_id: InstallmentId,
    pub cancelled_at_utc: DateTime<Utc>,
    pub reversed_movements: usize,
}

/// Allocation engine facade.
///
/// One instance per process. Operations on the same order are serialized by
/// an in-process lock; writes are additionally guarded by the order's
/// `ledger_revision` so a second process cannot slip an entry in between the
/// remaining-amount check and the insert.
pub struct InstallmentEngine {
    pub(crate) ledger: Arc<dyn LedgerStore>,
    pub(crate) inventory: Arc<dyn InventoryStore>,
    pub(crate) detector: DuplicateDetector<dyn DedupeRegistry>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) sink: Arc<dyn NotificationSink>,
    pub(crate) journal: Option<Mutex<JournalWriter>>,
    pub(crate) locks: OrderLocks,
    pub(crate) settings: EngineSettings,
}

impl InstallmentEngine {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        inventory: Arc<dyn InventoryStore>,
        registry: Arc<dyn DedupeRegistry>,
        settings: EngineSettings,
    ) -> Self {
        let ttl = ChronoDuration::minutes(settings.dedupe.ttl_minutes);
        Self {
            ledger,
            inventory,
            detector: DuplicateDetector::with_ttl(registry, ttl),
            clock: Arc::new(SystemClock),
            sink: Arc::new(TracingSink),
            journal: None,
            locks: OrderLocks::new(),
            settings,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Repairs append their before/after delta here.
    pub fn with_journal(mut self, journal: JournalWriter) -> Self {
        self.journal = Some(Mutex::new(journal));
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn locks(&self) -> &OrderLocks {
        &self.locks
    }

    fn stores(&self) -> Stores {
        Stores {
            ledger: Arc::clone(&self.ledger),
            inventory: Arc::clone(&self.inventory),
            read_retry_attempts: self.settings.store.read_retry_attempts,
        }
    }

    pub(crate) async fn read_order(&self, order_id: OrderId) -> EngineResult<Order> {
        let ledger = &self.ledger;
        with_read_retry("fetch_order", self.settings.store.read_retry_attempts, || {
            ledger.fetch_order(order_id)
        })
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("order {order_id}")))
    }

    pub(crate) async fn read_installments(&self, order_id: OrderId) -> EngineResult<Vec<Installment>> {
        let ledger = &self.ledger;
        Ok(
            with_read_retry("list_installments", self.settings.store.read_retry_attempts, || {
                ledger.list_installments(order_id)
            })
            .await?,
        )
    }

    async fn read_installment(&self, id: InstallmentId) -> EngineResult<Installment> {
        let ledger = &self.ledger;
        with_read_retry("fetch_installment", self.settings.store.read_retry_attempts, || {
            ledger.fetch_installment(id)
        })
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("installment {id}")))
    }

    /// Send the outcome of an operation to the sink and hand it back.
    pub(crate) fn report<T>(
        &self,
        order_id: Option<OrderId>,
        result: EngineResult<T>,
        ok: impl FnOnce(&T) -> Outcome,
    ) -> EngineResult<T> {
        let mut outcome = match &result {
            Ok(v) => ok(v),
            Err(e) => Outcome::from_error(e),
        };
        if outcome.order_id.is_none() {
            outcome.order_id = order_id;
        }
        self.sink.notify(&outcome);
        result
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Remaining amount on `order_id` if `candidate` were accepted.
    ///
    /// `candidate` may be zero to ask "how much room is left".
    pub async fn get_remaining(
        &self,
        order_id: OrderId,
        candidate: Amount,
        exclude: Option<InstallmentId>,
    ) -> EngineResult<RemainingResult> {
        if candidate.is_negative() {
            return Err(EngineError::Validation(format!(
                "candidate amount must be >= 0, got {candidate}"
            )));
        }
        let order = self.read_order(order_id).await?;
        let installments = self.read_installments(order_id).await?;
        Ok(remaining(
            &order,
            &installments,
            candidate,
            exclude,
            self.settings.allocation.counting_policy,
        ))
    }

    pub async fn list_installments(&self, order_id: OrderId) -> EngineResult<Vec<Installment>> {
        self.read_order(order_id).await?;
        self.read_installments(order_id).await
    }

    // -----------------------------------------------------------------------
    // Submit
    // -----------------------------------------------------------------------

    pub async fn submit_installment(&self, req: SubmitRequest) -> EngineResult<Accepted> {
        let order_id = req.order_id;
        let result = self.submit_inner(req).await;
        self.report(Some(order_id), result, |a| {
            Outcome::info(
                "installment_accepted",
                format!("sequence {} accepted, remaining {}", a.sequence_no, a.remaining),
            )
            .for_installment(a.installment_id)
        })
    }

    async fn submit_inner(&self, req: SubmitRequest) -> EngineResult<Accepted> {
        validate_request(&req)?;
        let order_id = req.order_id;
        let _guard = self.locks.lock(order_id).await;

        // Cheap pre-check so an over-allocation leaves no trace, not even a
        // fingerprint. The insert step checks again against the revision it
        // writes under.
        let order = self.read_order(order_id).await?;
        let existing = self.read_installments(order_id).await?;
        let pre = remaining(
            &order,
            &existing,
            req.amount,
            None,
            self.settings.allocation.counting_policy,
        );
        if pre.is_exceeding {
            return Err(EngineError::ExceedsRemaining {
                order_id,
                remaining: pre,
            });
        }

        let saga = Saga::new("accept_installment")
            .with_step_timeout(self.settings.saga.step_timeout)
            .step(RegisterFingerprint)
            .step(InsertLedgerEntry)
            .step(AdjustStock)
            .step(WriteMovements);

        let mut ctx = AcceptCtx {
            stores: self.stores(),
            detector: self.detector.clone(),
            policy: self.settings.allocation.counting_policy,
            max_insert_attempts: self.settings.allocation.max_insert_attempts,
            request: req,
            now: self.clock.now(),
            fingerprint: None,
            installment: None,
            remaining: None,
            rejection: None,
            stuck_stock: Vec::new(),
            stock: StockProgress::default(),
        };

        match saga.run(&mut ctx).await {
            Ok(_) => {
                let inst = ctx.installment.take().ok_or_else(|| {
                    EngineError::Store(anyhow::anyhow!("saga completed without a ledger entry"))
                })?;
                let left = ctx
                    .remaining
                    .map(|r| r.remaining_amount)
                    .unwrap_or(Amount::ZERO);
                tracing::info!(
                    order_id = order_id.raw(),
                    installment_id = inst.installment_id.raw(),
                    sequence_no = inst.sequence_no,
                    amount = inst.amount.raw(),
                    remaining = left.raw(),
                    "installment_accepted"
                );
                Ok(Accepted {
                    installment_id: inst.installment_id,
                    sequence_no: inst.sequence_no,
                    remaining: left,
                })
            }
            Err(failure) => Err(resolve_failure(
                failure,
                ctx.rejection.take(),
                &ctx.stuck_stock,
                ADJUST_STOCK,
            )),
        }
    }

    // -----------------------------------------------------------------------
    // Confirm
    // -----------------------------------------------------------------------

    /// Draft -> confirmed. The entry's own amount is excluded from the
    /// allocated sum and re-checked as the candidate, so the confirmed sum can
    /// never pass the order total.
    pub async fn confirm_installment(&self, id: InstallmentId) -> EngineResult<Confirmed> {
        let result = self.confirm_inner(id).await;
        self.report(None, result, |c| {
            Outcome::info("installment_confirmed", format!("remaining {}", c.remaining))
                .for_installment(c.installment_id)
        })
    }

    async fn confirm_inner(&self, id: InstallmentId) -> EngineResult<Confirmed> {
        let first = self.read_installment(id).await?;
        let order_id = first.order_id;
        let _guard = self.locks.lock(order_id).await;
        let policy = self.settings.allocation.counting_policy;
        let attempts = self.settings.allocation.max_insert_attempts.max(1);

        for attempt in 1..=attempts {
            let inst = self.read_installment(id).await?;
            match inst.status {
                InstallmentStatus::Confirmed => return Err(EngineError::AlreadyConfirmed(id)),
                InstallmentStatus::Cancelled => {
                    return Err(EngineError::Validation(format!(
                        "installment {id} is cancelled and cannot be confirmed"
                    )))
                }
                InstallmentStatus::Draft => {}
            }
            if validate_candidate(inst.amount).is_err() {
                return Err(EngineError::AmountIntegrity {
                    installment_id: id,
                    reason: format!("stored amount {} is not positive", inst.amount),
                });
            }

            let order = self.read_order(order_id).await?;
            let existing = self.read_installments(order_id).await?;
            let r = remaining(&order, &existing, inst.amount, Some(id), policy);
            if r.is_exceeding {
                return Err(EngineError::AmountIntegrity {
                    installment_id: id,
                    reason: format!(
                        "confirming {} would exceed order total {} by {}",
                        inst.amount, r.order_total, r.exceeding_amount
                    ),
                });
            }

            let now = self.clock.now();
            match self
                .ledger
                .confirm_installment(id, inst.amount, order.ledger_revision, now)
                .await?
            {
                WriteOutcome::Applied => {
                    tracing::info!(
                        order_id = order_id.raw(),
                        installment_id = id.raw(),
                        amount = inst.amount.raw(),
                        "installment_confirmed"
                    );
                    return Ok(Confirmed {
                        installment_id: id,
                        confirmed_at_utc: now,
                        remaining: r.remaining_amount,
                    });
                }
                WriteOutcome::Conflict => {
                    tracing::debug!(installment_id = id.raw(), attempt, "confirm_conflict");
                }
            }
        }

        Err(EngineError::ConcurrentModification { order_id, attempts })
    }

    // -----------------------------------------------------------------------
    // Cancel
    // -----------------------------------------------------------------------

    /// Cancel a draft or confirmed entry, reverse its stock effects and free
    /// its fingerprint so the same amount can be submitted again.
    pub async fn cancel_installment(
        &self,
        id: InstallmentId,
        actor_id: &str,
    ) -> EngineResult<Cancelled> {
        let result = self.cancel_inner(id, actor_id).await;
        self.report(None, result, |c| {
            Outcome::info(
                "installment_cancelled",
                format!("{} movement(s) reversed", c.reversed_movements),
            )
            .for_installment(c.installment_id)
        })
    }

    async fn cancel_inner(&self, id: InstallmentId, actor_id: &str) -> EngineResult<Cancelled> {
        if actor_id.trim().is_empty() {
            return Err(EngineError::Validation("actor_id must not be empty".to_string()));
        }
        let first = self.read_installment(id).await?;
        let _guard = self.locks.lock(first.order_id).await;

        let inst = self.read_installment(id).await?;
        if inst.status == InstallmentStatus::Cancelled {
            return Err(EngineError::Validation(format!(
                "installment {id} is already cancelled"
            )));
        }

        let movements = self.inventory.list_movements(id).await?;
        let reversal: Vec<DeliveryLine> = movements
            .iter()
            .map(|m| DeliveryLine {
                sku: m.sku.clone(),
                quantity_delta: -m.quantity_delta,
                unit_price: m.unit_price,
            })
            .collect();

        let saga = Saga::new("cancel_installment")
            .with_step_timeout(self.settings.saga.step_timeout)
            .step(MarkCancelled)
            .step(ReverseStock)
            .step(WriteReversingMovements);

        let now = self.clock.now();
        let mut ctx = CancelCtx {
            stores: self.stores(),
            installment: inst.clone(),
            reversal,
            now,
            original_movements: movements.iter().map(|m| m.movement_id).collect(),
            rejection: None,
            stuck_stock: Vec::new(),
            stock: StockProgress::default(),
        };

        if let Err(failure) = saga.run(&mut ctx).await {
            return Err(resolve_failure(
                failure,
                ctx.rejection.take(),
                &ctx.stuck_stock,
                REVERSE_STOCK,
            ));
        }

        let desc = OperationDescriptor {
            order_id: inst.order_id,
            amount: inst.amount,
            kind: OperationKind::SubmitInstallment,
            actor_id: inst.actor_id.clone(),
            session_id: inst.session_id.clone(),
        };
        if let Err(e) = self.detector.release(&fingerprint(&desc)).await {
            tracing::warn!(
                installment_id = id.raw(),
                error = %format!("{e:#}"),
                "fingerprint_release_failed"
            );
        }

        tracing::info!(
            order_id = inst.order_id.raw(),
            installment_id = id.raw(),
            cancelled_by = actor_id,
            previous_status = inst.status.as_str(),
            "installment_cancelled"
        );
        Ok(Cancelled {
            installment_id: id,
            cancelled_at_utc: now,
            reversed_movements: ctx.reversal.len(),
        })
    }

    // -----------------------------------------------------------------------
    // Duplicate-detection maintenance
    // -----------------------------------------------------------------------

    /// Invalidate every fingerprint recorded by `session_id`.
    pub async fn end_session(&self, session_id: &str) -> EngineResult<u64> {
        Ok(self.detector.end_session(session_id).await?)
    }

    pub async fn purge_expired_fingerprints(&self) -> EngineResult<u64> {
        Ok(self.detector.purge_expired(self.clock.now()).await?)
    }
}

fn validate_request(req: &SubmitRequest) -> EngineResult<()> {
    validate_candidate(req.amount)?;
    if req.actor_id.trim().is_empty() {
        return Err(EngineError::Validation("actor_id must not be empty".to_string()));
    }
    if req.session_id.trim().is_empty() {
        return Err(EngineError::Validation("session_id must not be empty".to_string()));
    }
    for (i, line) in req.lines.iter().enumerate() {
        if line.sku.trim().is_empty() {
            return Err(EngineError::Validation(format!("line {i}: sku must not be empty")));
        }
        if line.quantity_delta == 0 {
            return Err(EngineError::Validation(format!("line {i}: quantity_delta must not be 0")));
        }
        if line.unit_price.is_negative() {
            return Err(EngineError::Validation(format!(
                "line {i}: unit_price must be >= 0, got {}",
                line.unit_price
            )));
        }
    }
    Ok(())
}

/// Map a failed saga to the error the caller sees.
///
/// A refusal recorded by a step wins, unless rollback was partial: leftover
/// effects are always reported as such. Stock deltas that a step could not
/// undo on its own also make the rollback partial.
fn resolve_failure(
    mut failure: SagaFailure,
    rejection: Option<EngineError>,
    stuck_stock: &[StockDelta],
    stock_step: &'static str,
) -> EngineError {
    if !stuck_stock.is_empty() {
        let leftover = StepError::Failed(format!(
            "{} stock adjustment(s) could not be undone: {}",
            stuck_stock.len(),
            stuck_stock
                .iter()
                .map(|d| format!("{}:{}", d.sku, d.delta))
                .collect::<Vec<_>>()
                .join(",")
        ));
        tracing::error!(saga = failure.saga, detail = %leftover, "saga_stock_residue");
        if let Some(last) = failure.trace.last_mut() {
            if *last == SagaState::RolledBack {
                *last = SagaState::PartialRollback;
            }
        }
        let extra = CompensationFailure {
            step: stock_step,
            cause: leftover,
        };
        failure.rollback = match failure.rollback {
            Rollback::RolledBack { compensated } => Rollback::PartialRollback {
                compensated,
                failed: vec![extra],
            },
            Rollback::PartialRollback {
                compensated,
                mut failed,
            } => {
                failed.push(extra);
                Rollback::PartialRollback { compensated, failed }
            }
        };
    }

    match rejection {
        Some(rej) if failure.rollback.is_complete() => rej,
        _ => EngineError::StepFailed(failure),
    }
}
