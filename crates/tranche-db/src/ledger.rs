use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Postgres, Row, Transaction};
use tranche_engine::{InsertOutcome, LedgerStore, NewInstallment, OrderScope, WriteOutcome};
use tranche_money::Amount;
use tranche_reconcile::{AmountChange, SequenceChange};
use tranche_schemas::{Installment, InstallmentId, InstallmentStatus, Order, OrderId};

use crate::PgStore;

const ORDER_COLUMNS: &str =
    "order_id, total_amount, created_at_utc, updated_at_utc, ledger_revision";

const INSTALLMENT_COLUMNS: &str = "installment_id, order_id, sequence_no, amount, status, \
     actor_id, session_id, memo, created_at_utc, confirmed_at_utc, cancelled_at_utc";

fn order_from_row(row: &PgRow) -> Result<Order> {
    Ok(Order {
        order_id: OrderId(row.try_get("order_id")?),
        total_amount: Amount::new(row.try_get("total_amount")?),
        created_at_utc: row.try_get("created_at_utc")?,
        updated_at_utc: row.try_get("updated_at_utc")?,
        ledger_revision: row.try_get("ledger_revision")?,
    })
}

fn installment_from_row(row: &PgRow) -> Result<Installment> {
    let status: String = row.try_get("status")?;
    Ok(Installment {
        installment_id: InstallmentId(row.try_get("installment_id")?),
        order_id: OrderId(row.try_get("order_id")?),
        sequence_no: row.try_get("sequence_no")?,
        amount: Amount::new(row.try_get("amount")?),
        status: InstallmentStatus::parse(&status).map_err(|e| anyhow!("{e}"))?,
        actor_id: row.try_get("actor_id")?,
        session_id: row.try_get("session_id")?,
        memo: row.try_get("memo")?,
        created_at_utc: row.try_get("created_at_utc")?,
        confirmed_at_utc: row.try_get("confirmed_at_utc")?,
        cancelled_at_utc: row.try_get("cancelled_at_utc")?,
    })
}

/// Bump the order's revision inside `tx`. Also takes the order row lock.
async fn bump_revision(
    tx: &mut Transaction<'_, Postgres>,
    order_id: OrderId,
    at: Option<DateTime<Utc>>,
) -> Result<()> {
    sqlx::query(
        r#"
        update orders
           set ledger_revision = ledger_revision + 1,
               updated_at_utc = coalesce($2, updated_at_utc)
         where order_id = $1
        "#,
    )
    .bind(order_id.raw())
    .bind(at)
    .execute(&mut **tx)
    .await
    .context("bump ledger_revision failed")?;
    Ok(())
}

/// Lock the order row for the rest of `tx`.
async fn lock_order(tx: &mut Transaction<'_, Postgres>, order_id: OrderId) -> Result<bool> {
    let row = sqlx::query("select order_id from orders where order_id = $1 for update")
        .bind(order_id.raw())
        .fetch_optional(&mut **tx)
        .await
        .context("lock order row failed")?;
    Ok(row.is_some())
}

impl PgStore {
    /// Administrative: create an order. Not part of the allocation flow.
    pub async fn create_order(&self, total: Amount, at: DateTime<Utc>) -> Result<Order> {
        let row = sqlx::query(&format!(
            r#"
            insert into orders (total_amount, created_at_utc, updated_at_utc)
            values ($1, $2, $2)
            returning {ORDER_COLUMNS}
            "#
        ))
        .bind(total.raw())
        .bind(at)
        .fetch_one(self.pool())
        .await
        .context("create_order failed")?;
        order_from_row(&row)
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn fetch_order(&self, order_id: OrderId) -> Result<Option<Order>> {
        let row = sqlx::query(&format!("select {ORDER_COLUMNS} from orders where order_id = $1"))
            .bind(order_id.raw())
            .fetch_optional(self.pool())
            .await
            .context("fetch_order failed")?;
        row.as_ref().map(order_from_row).transpose()
    }

    async fn list_order_ids(&self, scope: OrderScope) -> Result<Vec<OrderId>> {
        let (from, to) = match scope {
            OrderScope::All => (i64::MIN, i64::MAX),
            OrderScope::Range { from, to } => (from.raw(), to.raw()),
        };
        let rows: Vec<(i64,)> = sqlx::query_as(
            "select order_id from orders where order_id between $1 and $2 order by order_id",
        )
        .bind(from)
        .bind(to)
        .fetch_all(self.pool())
        .await
        .context("list_order_ids failed")?;
        Ok(rows.into_iter().map(|(id,)| OrderId(id)).collect())
    }

    async fn list_installments(&self, order_id: OrderId) -> Result<Vec<Installment>> {
        let rows = sqlx::query(&format!(
            "select {INSTALLMENT_COLUMNS} from installments where order_id = $1 \
             order by sequence_no, installment_id"
        ))
        .bind(order_id.raw())
        .fetch_all(self.pool())
        .await
        .context("list_installments failed")?;
        rows.iter().map(installment_from_row).collect()
    }

    async fn fetch_installment(&self, id: InstallmentId) -> Result<Option<Installment>> {
        let row = sqlx::query(&format!(
            "select {INSTALLMENT_COLUMNS} from installments where installment_id = $1"
        ))
        .bind(id.raw())
        .fetch_optional(self.pool())
        .await
        .context("fetch_installment failed")?;
        row.as_ref().map(installment_from_row).transpose()
    }

    async fn insert_installment_guarded(
        &self,
        new: &NewInstallment,
        expected_revision: i64,
    ) -> Result<InsertOutcome> {
        let mut tx = self.pool().begin().await.context("begin tx failed")?;

        // The compare-and-set: only one writer can move the revision on.
        let bumped = sqlx::query(
            r#"
            update orders
               set ledger_revision = ledger_revision + 1,
                   updated_at_utc = $3
             where order_id = $1 and ledger_revision = $2
            returning ledger_revision
            "#,
        )
        .bind(new.order_id.raw())
        .bind(expected_revision)
        .bind(new.created_at_utc)
        .fetch_optional(&mut *tx)
        .await
        .context("guarded revision bump failed")?;

        if bumped.is_none() {
            tx.rollback().await.context("rollback failed")?;
            let current: Option<(i64,)> =
                sqlx::query_as("select ledger_revision from orders where order_id = $1")
                    .bind(new.order_id.raw())
                    .fetch_optional(self.pool())
                    .await
                    .context("read current revision failed")?;
            return Ok(match current {
                Some((current_revision,)) => InsertOutcome::Conflict { current_revision },
                None => InsertOutcome::OrderMissing,
            });
        }

        let row = sqlx::query(&format!(
            r#"
            insert into installments (
              order_id, sequence_no, amount, status, actor_id, session_id, memo, created_at_utc
            ) values ($1, $2, $3, 'draft', $4, $5, $6, $7)
            returning {INSTALLMENT_COLUMNS}
            "#
        ))
        .bind(new.order_id.raw())
        .bind(new.sequence_no)
        .bind(new.amount.raw())
        .bind(&new.actor_id)
        .bind(&new.session_id)
        .bind(&new.memo)
        .bind(new.created_at_utc)
        .fetch_one(&mut *tx)
        .await
        .context("insert installment failed")?;
        let inst = installment_from_row(&row)?;

        tx.commit().await.context("commit failed")?;
        Ok(InsertOutcome::Inserted(inst))
    }

    async fn delete_installment(&self, id: InstallmentId) -> Result<bool> {
        let mut tx = self.pool().begin().await.context("begin tx failed")?;
        let deleted: Option<(i64,)> =
            sqlx::query_as("delete from installments where installment_id = $1 returning order_id")
                .bind(id.raw())
                .fetch_optional(&mut *tx)
                .await
                .context("delete_installment failed")?;
        if let Some((order_id,)) = deleted {
            bump_revision(&mut tx, OrderId(order_id), None).await?;
        }
        tx.commit().await.context("commit failed")?;
        Ok(deleted.is_some())
    }

    async fn confirm_installment(
        &self,
        id: InstallmentId,
        expected_amount: Amount,
        expected_revision: i64,
        at: DateTime<Utc>,
    ) -> Result<WriteOutcome> {
        let mut tx = self.pool().begin().await.context("begin tx failed")?;

        let bumped = sqlx::query(
            r#"
            update orders
               set ledger_revision = ledger_revision + 1,
                   updated_at_utc = $3
             where order_id = (select order_id from installments where installment_id = $1)
               and ledger_revision = $2
            returning order_id
            "#,
        )
        .bind(id.raw())
        .bind(expected_revision)
        .bind(at)
        .fetch_optional(&mut *tx)
        .await
        .context("confirm revision bump failed")?;
        if bumped.is_none() {
            tx.rollback().await.context("rollback failed")?;
            return Ok(WriteOutcome::Conflict);
        }

        let done = sqlx::query(
            r#"
            update installments
               set status = 'confirmed', confirmed_at_utc = $3
             where installment_id = $1 and status = 'draft' and amount = $2
            "#,
        )
        .bind(id.raw())
        .bind(expected_amount.raw())
        .bind(at)
        .execute(&mut *tx)
        .await
        .context("confirm_installment failed")?;
        if done.rows_affected() != 1 {
            tx.rollback().await.context("rollback failed")?;
            return Ok(WriteOutcome::Conflict);
        }

        tx.commit().await.context("commit failed")?;
        Ok(WriteOutcome::Applied)
    }

    async fn cancel_installments(
        &self,
        order_id: OrderId,
        ids: &[InstallmentId],
        at: DateTime<Utc>,
    ) -> Result<WriteOutcome> {
        let raw: Vec<i64> = ids.iter().map(|i| i.raw()).collect();
        let mut tx = self.pool().begin().await.context("begin tx failed")?;
        if !lock_order(&mut tx, order_id).await? {
            tx.rollback().await.context("rollback failed")?;
            return Ok(WriteOutcome::Conflict);
        }

        let done = sqlx::query(
            r#"
            update installments
               set status = 'cancelled', cancelled_at_utc = $3
             where order_id = $1
               and installment_id = any($2)
               and status <> 'cancelled'
            "#,
        )
        .bind(order_id.raw())
        .bind(&raw)
        .bind(at)
        .execute(&mut *tx)
        .await
        .context("cancel_installments failed")?;
        if done.rows_affected() != raw.len() as u64 {
            tx.rollback().await.context("rollback failed")?;
            return Ok(WriteOutcome::Conflict);
        }

        bump_revision(&mut tx, order_id, Some(at)).await?;
        tx.commit().await.context("commit failed")?;
        Ok(WriteOutcome::Applied)
    }

    async fn reinstate_installment(
        &self,
        id: InstallmentId,
        status: InstallmentStatus,
    ) -> Result<WriteOutcome> {
        let mut tx = self.pool().begin().await.context("begin tx failed")?;
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            update installments
               set status = $2, cancelled_at_utc = null
             where installment_id = $1 and status = 'cancelled'
            returning order_id
            "#,
        )
        .bind(id.raw())
        .bind(status.as_str())
        .fetch_optional(&mut *tx)
        .await
        .context("reinstate_installment failed")?;
        let Some((order_id,)) = row else {
            tx.rollback().await.context("rollback failed")?;
            return Ok(WriteOutcome::Conflict);
        };
        bump_revision(&mut tx, OrderId(order_id), None).await?;
        tx.commit().await.context("commit failed")?;
        Ok(WriteOutcome::Applied)
    }

    async fn update_order_total(
        &self,
        order_id: OrderId,
        from: Amount,
        to: Amount,
        at: DateTime<Utc>,
    ) -> Result<WriteOutcome> {
        let done = sqlx::query(
            r#"
            update orders
               set total_amount = $3,
                   updated_at_utc = $4,
                   ledger_revision = ledger_revision + 1
             where order_id = $1 and total_amount = $2
            "#,
        )
        .bind(order_id.raw())
        .bind(from.raw())
        .bind(to.raw())
        .bind(at)
        .execute(self.pool())
        .await
        .context("update_order_total failed")?;
        Ok(if done.rows_affected() == 1 {
            WriteOutcome::Applied
        } else {
            WriteOutcome::Conflict
        })
    }

    async fn apply_amount_changes(
        &self,
        order_id: OrderId,
        changes: &[AmountChange],
    ) -> Result<WriteOutcome> {
        let mut tx = self.pool().begin().await.context("begin tx failed")?;
        if !lock_order(&mut tx, order_id).await? {
            tx.rollback().await.context("rollback failed")?;
            return Ok(WriteOutcome::Conflict);
        }
        for c in changes {
            let done = sqlx::query(
                r#"
                update installments
                   set amount = $4
                 where installment_id = $1 and order_id = $2 and amount = $3
                "#,
            )
            .bind(c.installment_id.raw())
            .bind(order_id.raw())
            .bind(c.from.raw())
            .bind(c.to.raw())
            .execute(&mut *tx)
            .await
            .context("apply_amount_changes failed")?;
            if done.rows_affected() != 1 {
                tx.rollback().await.context("rollback failed")?;
                return Ok(WriteOutcome::Conflict);
            }
        }
        bump_revision(&mut tx, order_id, None).await?;
        tx.commit().await.context("commit failed")?;
        Ok(WriteOutcome::Applied)
    }

    async fn apply_sequence_changes(
        &self,
        order_id: OrderId,
        changes: &[SequenceChange],
    ) -> Result<WriteOutcome> {
        let mut tx = self.pool().begin().await.context("begin tx failed")?;
        if !lock_order(&mut tx, order_id).await? {
            tx.rollback().await.context("rollback failed")?;
            return Ok(WriteOutcome::Conflict);
        }
        for c in changes {
            let done = sqlx::query(
                r#"
                update installments
                   set sequence_no = $4
                 where installment_id = $1 and order_id = $2 and sequence_no = $3
                "#,
            )
            .bind(c.installment_id.raw())
            .bind(order_id.raw())
            .bind(c.from)
            .bind(c.to)
            .execute(&mut *tx)
            .await
            .context("apply_sequence_changes failed")?;
            if done.rows_affected() != 1 {
                tx.rollback().await.context("rollback failed")?;
                return Ok(WriteOutcome::Conflict);
            }
        }
        bump_revision(&mut tx, order_id, None).await?;
        tx.commit().await.context("commit failed")?;
        Ok(WriteOutcome::Applied)
    }
}
