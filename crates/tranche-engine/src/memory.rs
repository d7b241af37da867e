//! In-process store for tests and single-process tools.
//!
//! One mutex guards the whole state, so every trait method is atomic. Faults
//! (errors, delays, forced revision conflicts) can be injected per operation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tranche_money::Amount;
use tranche_reconcile::{AmountChange, SequenceChange};
use tranche_schemas::{
    DeliveryLine, Installment, InstallmentId, InstallmentStatus, Movement, MovementId, Order,
    OrderId,
};

use crate::store::{
    InsertOutcome, InventoryStore, LedgerStore, NewInstallment, OrderScope, WriteOutcome,
};

/// Store operations that accept injected faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultOp {
    FetchOrder,
    ListInstallments,
    FetchInstallment,
    InsertInstallment,
    DeleteInstallment,
    ConfirmInstallment,
    CancelInstallments,
    ReinstateInstallment,
    UpdateOrderTotal,
    ApplyAmountChanges,
    ApplySequenceChanges,
    AdjustStock,
    InsertMovements,
    DeleteMovements,
}

#[derive(Debug, Default, Clone)]
struct Fault {
    pass_remaining: u32,
    fail_remaining: u32,
    conflict_remaining: u32,
    delay: Option<Duration>,
    /// Sleep after the effect is applied, before returning.
    linger: Option<Duration>,
}

#[derive(Debug, Default)]
struct State {
    orders: BTreeMap<OrderId, Order>,
    installments: BTreeMap<InstallmentId, Installment>,
    movements: BTreeMap<MovementId, Movement>,
    stock: HashMap<String, i64>,
    next_order: i64,
    next_installment: i64,
    next_movement: i64,
}

impl State {
    fn bump(&mut self, order_id: OrderId, at: Option<DateTime<Utc>>) {
        if let Some(o) = self.orders.get_mut(&order_id) {
            o.ledger_revision += 1;
            if let Some(at) = at {
                o.updated_at_utc = at;
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    faults: Mutex<HashMap<FaultOp, Fault>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn faults(&self) -> MutexGuard<'_, HashMap<FaultOp, Fault>> {
        self.faults.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -- fault injection ---------------------------------------------------

    /// The next `times` calls of `op` fail with an error.
    pub fn fail_next(&self, op: FaultOp, times: u32) {
        let mut faults = self.faults();
        let f = faults.entry(op).or_default();
        f.pass_remaining = 0;
        f.fail_remaining = times;
    }

    /// Let `successes` calls of `op` through, then fail the following `times`.
    pub fn fail_after(&self, op: FaultOp, successes: u32, times: u32) {
        let mut faults = self.faults();
        let f = faults.entry(op).or_default();
        f.pass_remaining = successes;
        f.fail_remaining = times;
    }

    /// The next `times` guarded inserts report a revision conflict, as if a
    /// concurrent writer had just committed.
    pub fn conflict_next_inserts(&self, times: u32) {
        self.faults()
            .entry(FaultOp::InsertInstallment)
            .or_default()
            .conflict_remaining = times;
    }

    /// Every call of `op` sleeps first.
    pub fn delay(&self, op: FaultOp, by: Duration) {
        self.faults().entry(op).or_default().delay = Some(by);
    }

    /// Every call of `op` applies its effect and then sleeps, so a caller
    /// timing out sees an error although the write went through.
    pub fn linger_after(&self, op: FaultOp, by: Duration) {
        self.faults().entry(op).or_default().linger = Some(by);
    }

    async fn linger(&self, op: FaultOp) {
        let by = self.faults().get(&op).and_then(|f| f.linger);
        if let Some(d) = by {
            tokio::time::sleep(d).await;
        }
    }

    pub fn clear_faults(&self) {
        self.faults().clear();
    }

    async fn gate(&self, op: FaultOp) -> Result<()> {
        let (delay, fail) = {
            let mut faults = self.faults();
            match faults.get_mut(&op) {
                Some(f) if f.pass_remaining > 0 => {
                    f.pass_remaining -= 1;
                    (f.delay, false)
                }
                Some(f) => {
                    let fail = f.fail_remaining > 0;
                    if fail {
                        f.fail_remaining -= 1;
                    }
                    (f.delay, fail)
                }
                None => (None, false),
            }
        };
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        if fail {
            bail!("injected fault: {op:?}");
        }
        Ok(())
    }

    fn take_conflict(&self) -> bool {
        let mut faults = self.faults();
        match faults.get_mut(&FaultOp::InsertInstallment) {
            Some(f) if f.conflict_remaining > 0 => {
                f.conflict_remaining -= 1;
                true
            }
            _ => false,
        }
    }

    /// The guarded insert itself, under the state lock.
    fn insert_now(&self, new: &NewInstallment, expected_revision: i64) -> InsertOutcome {
        let forced_conflict = self.take_conflict();

        let mut s = self.state();
        let current = match s.orders.get(&new.order_id) {
            Some(o) => o.ledger_revision,
            None => return InsertOutcome::OrderMissing,
        };
        if forced_conflict {
            // Behave as if another writer committed first.
            s.bump(new.order_id, None);
            return InsertOutcome::Conflict {
                current_revision: current + 1,
            };
        }
        if current != expected_revision {
            return InsertOutcome::Conflict {
                current_revision: current,
            };
        }

        s.next_installment += 1;
        let inst = Installment {
            installment_id: InstallmentId(s.next_installment),
            order_id: new.order_id,
            sequence_no: new.sequence_no,
            amount: new.amount,
            status: InstallmentStatus::Draft,
            actor_id: new.actor_id.clone(),
            session_id: new.session_id.clone(),
            memo: new.memo.clone(),
            created_at_utc: new.created_at_utc,
            confirmed_at_utc: None,
            cancelled_at_utc: None,
        };
        s.installments.insert(inst.installment_id, inst.clone());
        s.bump(new.order_id, Some(new.created_at_utc));
        InsertOutcome::Inserted(inst)
    }

    // -- seeding and inspection ----------------------------------------------

    pub fn create_order(&self, total: Amount, at: DateTime<Utc>) -> Order {
        let mut s = self.state();
        s.next_order += 1;
        let order = Order {
            order_id: OrderId(s.next_order),
            total_amount: total,
            created_at_utc: at,
            updated_at_utc: at,
            ledger_revision: 0,
        };
        s.orders.insert(order.order_id, order.clone());
        order
    }

    /// Insert an entry as-is, bypassing every check. For reproducing
    /// historical drift.
    pub fn seed_installment(
        &self,
        order_id: OrderId,
        sequence_no: i32,
        amount: Amount,
        status: InstallmentStatus,
        at: DateTime<Utc>,
    ) -> Installment {
        let mut s = self.state();
        s.next_installment += 1;
        let inst = Installment {
            installment_id: InstallmentId(s.next_installment),
            order_id,
            sequence_no,
            amount,
            status,
            actor_id: "seed".to_string(),
            session_id: "seed".to_string(),
            memo: None,
            created_at_utc: at,
            confirmed_at_utc: (status == InstallmentStatus::Confirmed).then_some(at),
            cancelled_at_utc: (status == InstallmentStatus::Cancelled).then_some(at),
        };
        s.installments.insert(inst.installment_id, inst.clone());
        s.bump(order_id, None);
        inst
    }

    pub fn set_stock(&self, sku: &str, level: i64) {
        self.state().stock.insert(sku.to_string(), level);
    }

    pub fn order(&self, id: OrderId) -> Option<Order> {
        self.state().orders.get(&id).cloned()
    }

    pub fn installments_of(&self, id: OrderId) -> Vec<Installment> {
        sorted_installments(&self.state(), id)
    }

    pub fn stock(&self, sku: &str) -> i64 {
        self.state().stock.get(sku).copied().unwrap_or(0)
    }

    pub fn movement_count(&self) -> usize {
        self.state().movements.len()
    }
}

fn sorted_installments(s: &State, order_id: OrderId) -> Vec<Installment> {
    let mut v: Vec<Installment> = s
        .installments
        .values()
        .filter(|i| i.order_id == order_id)
        .cloned()
        .collect();
    v.sort_by_key(|i| (i.sequence_no, i.installment_id));
    v
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn fetch_order(&self, order_id: OrderId) -> Result<Option<Order>> {
        self.gate(FaultOp::FetchOrder).await?;
        Ok(self.state().orders.get(&order_id).cloned())
    }

    async fn list_order_ids(&self, scope: OrderScope) -> Result<Vec<OrderId>> {
        Ok(self
            .state()
            .orders
            .keys()
            .copied()
            .filter(|id| scope.contains(*id))
            .collect())
    }

    async fn list_installments(&self, order_id: OrderId) -> Result<Vec<Installment>> {
        self.gate(FaultOp::ListInstallments).await?;
        Ok(sorted_installments(&self.state(), order_id))
    }

    async fn fetch_installment(&self, id: InstallmentId) -> Result<Option<Installment>> {
        self.gate(FaultOp::FetchInstallment).await?;
        Ok(self.state().installments.get(&id).cloned())
    }

    async fn insert_installment_guarded(
        &self,
        new: &NewInstallment,
        expected_revision: i64,
    ) -> Result<InsertOutcome> {
        self.gate(FaultOp::InsertInstallment).await?;
        let outcome = self.insert_now(new, expected_revision);
        self.linger(FaultOp::InsertInstallment).await;
        Ok(outcome)
    }

    async fn delete_installment(&self, id: InstallmentId) -> Result<bool> {
        self.gate(FaultOp::DeleteInstallment).await?;
        let mut s = self.state();
        match s.installments.remove(&id) {
            Some(inst) => {
                s.bump(inst.order_id, None);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn confirm_installment(
        &self,
        id: InstallmentId,
        expected_amount: Amount,
        expected_revision: i64,
        at: DateTime<Utc>,
    ) -> Result<WriteOutcome> {
        self.gate(FaultOp::ConfirmInstallment).await?;
        let mut s = self.state();
        let order_id = match s.installments.get(&id) {
            Some(i) if i.status == InstallmentStatus::Draft && i.amount == expected_amount => {
                i.order_id
            }
            _ => return Ok(WriteOutcome::Conflict),
        };
        if s.orders.get(&order_id).map(|o| o.ledger_revision) != Some(expected_revision) {
            return Ok(WriteOutcome::Conflict);
        }
        if let Some(i) = s.installments.get_mut(&id) {
            i.status = InstallmentStatus::Confirmed;
            i.confirmed_at_utc = Some(at);
        }
        s.bump(order_id, Some(at));
        Ok(WriteOutcome::Applied)
    }

    async fn cancel_installments(
        &self,
        order_id: OrderId,
        ids: &[InstallmentId],
        at: DateTime<Utc>,
    ) -> Result<WriteOutcome> {
        self.gate(FaultOp::CancelInstallments).await?;
        {
            let mut s = self.state();
            let all_cancellable = ids.iter().all(|id| {
                s.installments
                    .get(id)
                    .map(|i| i.order_id == order_id && i.status.is_valid())
                    .unwrap_or(false)
            });
            if !all_cancellable {
                return Ok(WriteOutcome::Conflict);
            }
            for id in ids {
                if let Some(i) = s.installments.get_mut(id) {
                    i.status = InstallmentStatus::Cancelled;
                    i.cancelled_at_utc = Some(at);
                }
            }
            s.bump(order_id, Some(at));
        }
        self.linger(FaultOp::CancelInstallments).await;
        Ok(WriteOutcome::Applied)
    }

    async fn reinstate_installment(
        &self,
        id: InstallmentId,
        status: InstallmentStatus,
    ) -> Result<WriteOutcome> {
        self.gate(FaultOp::ReinstateInstallment).await?;
        let mut s = self.state();
        let order_id = match s.installments.get_mut(&id) {
            Some(i) if i.status == InstallmentStatus::Cancelled => {
                i.status = status;
                i.cancelled_at_utc = None;
                i.order_id
            }
            _ => return Ok(WriteOutcome::Conflict),
        };
        s.bump(order_id, None);
        Ok(WriteOutcome::Applied)
    }

    async fn update_order_total(
        &self,
        order_id: OrderId,
        from: Amount,
        to: Amount,
        at: DateTime<Utc>,
    ) -> Result<WriteOutcome> {
        self.gate(FaultOp::UpdateOrderTotal).await?;
        if to.is_negative() {
            return Err(anyhow!("order total must not be negative: {to}"));
        }
        let mut s = self.state();
        match s.orders.get_mut(&order_id) {
            Some(o) if o.total_amount == from => {
                o.total_amount = to;
            }
            _ => return Ok(WriteOutcome::Conflict),
        }
        s.bump(order_id, Some(at));
        Ok(WriteOutcome::Applied)
    }

    async fn apply_amount_changes(
        &self,
        order_id: OrderId,
        changes: &[AmountChange],
    ) -> Result<WriteOutcome> {
        self.gate(FaultOp::ApplyAmountChanges).await?;
        let mut s = self.state();
        let matches = changes.iter().all(|c| {
            s.installments
                .get(&c.installment_id)
                .map(|i| i.order_id == order_id && i.amount == c.from)
                .unwrap_or(false)
        });
        if !matches {
            return Ok(WriteOutcome::Conflict);
        }
        for c in changes {
            if let Some(i) = s.installments.get_mut(&c.installment_id) {
                i.amount = c.to;
            }
        }
        s.bump(order_id, None);
        Ok(WriteOutcome::Applied)
    }

    async fn apply_sequence_changes(
        &self,
        order_id: OrderId,
        changes: &[SequenceChange],
    ) -> Result<WriteOutcome> {
        self.gate(FaultOp::ApplySequenceChanges).await?;
        let mut s = self.state();
        let matches = changes.iter().all(|c| {
            s.installments
                .get(&c.installment_id)
                .map(|i| i.order_id == order_id && i.sequence_no == c.from)
                .unwrap_or(false)
        });
        if !matches {
            return Ok(WriteOutcome::Conflict);
        }
        for c in changes {
            if let Some(i) = s.installments.get_mut(&c.installment_id) {
                i.sequence_no = c.to;
            }
        }
        s.bump(order_id, None);
        Ok(WriteOutcome::Applied)
    }
}

#[async_trait]
impl InventoryStore for MemoryStore {
    async fn adjust_stock(&self, sku: &str, delta: i64) -> Result<i64> {
        self.gate(FaultOp::AdjustStock).await?;
        let level = {
            let mut s = self.state();
            let level = s.stock.entry(sku.to_string()).or_insert(0);
            *level = level
                .checked_add(delta)
                .ok_or_else(|| anyhow!("stock counter overflow for {sku}"))?;
            *level
        };
        self.linger(FaultOp::AdjustStock).await;
        Ok(level)
    }

    async fn stock_level(&self, sku: &str) -> Result<i64> {
        Ok(self.stock(sku))
    }

    async fn insert_movements(
        &self,
        installment_id: InstallmentId,
        lines: &[DeliveryLine],
        at: DateTime<Utc>,
    ) -> Result<Vec<MovementId>> {
        self.gate(FaultOp::InsertMovements).await?;
        let ids = {
            let mut s = self.state();
            let mut ids = Vec::with_capacity(lines.len());
            for line in lines {
                s.next_movement += 1;
                let m = Movement {
                    movement_id: MovementId(s.next_movement),
                    installment_id,
                    sku: line.sku.clone(),
                    quantity_delta: line.quantity_delta,
                    unit_price: line.unit_price,
                    created_at_utc: at,
                };
                ids.push(m.movement_id);
                s.movements.insert(m.movement_id, m);
            }
            ids
        };
        self.linger(FaultOp::InsertMovements).await;
        Ok(ids)
    }

    async fn delete_movements(&self, ids: &[MovementId]) -> Result<u64> {
        self.gate(FaultOp::DeleteMovements).await?;
        let mut s = self.state();
        Ok(ids.iter().filter(|id| s.movements.remove(id).is_some()).count() as u64)
    }

    async fn list_movements(&self, installment_id: InstallmentId) -> Result<Vec<Movement>> {
        Ok(self
            .state()
            .movements
            .values()
            .filter(|m| m.installment_id == installment_id)
            .cloned()
            .collect())
    }
}
