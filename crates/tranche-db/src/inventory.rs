use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use tranche_engine::InventoryStore;
use tranche_money::Amount;
use tranche_schemas::{DeliveryLine, InstallmentId, Movement, MovementId};

use crate::PgStore;

#[async_trait]
impl InventoryStore for PgStore {
    async fn adjust_stock(&self, sku: &str, delta: i64) -> Result<i64> {
        let (level,): (i64,) = sqlx::query_as(
            r#"
            insert into stock_levels (sku, level) values ($1, $2)
            on conflict (sku) do update set level = stock_levels.level + excluded.level
            returning level
            "#,
        )
        .bind(sku)
        .bind(delta)
        .fetch_one(self.pool())
        .await
        .with_context(|| format!("adjust_stock failed for {sku}"))?;
        Ok(level)
    }

    async fn stock_level(&self, sku: &str) -> Result<i64> {
        let row: Option<(i64,)> = sqlx::query_as("select level from stock_levels where sku = $1")
            .bind(sku)
            .fetch_optional(self.pool())
            .await
            .context("stock_level failed")?;
        Ok(row.map(|(l,)| l).unwrap_or(0))
    }

    async fn insert_movements(
        &self,
        installment_id: InstallmentId,
        lines: &[DeliveryLine],
        at: DateTime<Utc>,
    ) -> Result<Vec<MovementId>> {
        let mut tx = self.pool().begin().await.context("begin tx failed")?;
        let mut ids = Vec::with_capacity(lines.len());
        for line in lines {
            let (id,): (i64,) = sqlx::query_as(
                r#"
                insert into movements (installment_id, sku, quantity_delta, unit_price, created_at_utc)
                values ($1, $2, $3, $4, $5)
                returning movement_id
                "#,
            )
            .bind(installment_id.raw())
            .bind(&line.sku)
            .bind(line.quantity_delta)
            .bind(line.unit_price.raw())
            .bind(at)
            .fetch_one(&mut *tx)
            .await
            .context("insert movement failed")?;
            ids.push(MovementId(id));
        }
        tx.commit().await.context("commit failed")?;
        Ok(ids)
    }

    async fn delete_movements(&self, ids: &[MovementId]) -> Result<u64> {
        let raw: Vec<i64> = ids.iter().map(|m| m.raw()).collect();
        let done = sqlx::query("delete from movements where movement_id = any($1)")
            .bind(&raw)
            .execute(self.pool())
            .await
            .context("delete_movements failed")?;
        Ok(done.rows_affected())
    }

    async fn list_movements(&self, installment_id: InstallmentId) -> Result<Vec<Movement>> {
        let rows = sqlx::query(
            r#"
            select movement_id, installment_id, sku, quantity_delta, unit_price, created_at_utc
              from movements
             where installment_id = $1
             order by movement_id
            "#,
        )
        .bind(installment_id.raw())
        .fetch_all(self.pool())
        .await
        .context("list_movements failed")?;

        rows.iter()
            .map(|r| {
                Ok(Movement {
                    movement_id: MovementId(r.try_get("movement_id")?),
                    installment_id: InstallmentId(r.try_get("installment_id")?),
                    sku: r.try_get("sku")?,
                    quantity_delta: r.try_get("quantity_delta")?,
                    unit_price: Amount::new(r.try_get("unit_price")?),
                    created_at_utc: r.try_get("created_at_utc")?,
                })
            })
            .collect()
    }
}
