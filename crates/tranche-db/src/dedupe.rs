use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use tranche_dedupe::{DedupeRecord, DedupeRegistry, Fingerprint, InsertIfAbsent};

use crate::PgStore;

#[async_trait]
impl DedupeRegistry for PgStore {
    /// One statement: insert, or take over a dead record. A live record makes
    /// the upsert's `where` false and nothing is returned.
    async fn insert_if_absent(
        &self,
        candidate: &DedupeRecord,
        now: DateTime<Utc>,
    ) -> Result<InsertIfAbsent> {
        let inserted = sqlx::query(
            r#"
            insert into duplicate_detection_records (
              fingerprint, session_id, created_at_utc, expires_at_utc, valid
            ) values ($1, $2, $3, $4, true)
            on conflict (fingerprint) do update
               set session_id = excluded.session_id,
                   created_at_utc = excluded.created_at_utc,
                   expires_at_utc = excluded.expires_at_utc,
                   valid = true
             where duplicate_detection_records.valid = false
                or duplicate_detection_records.expires_at_utc <= $5
            returning fingerprint
            "#,
        )
        .bind(candidate.fingerprint.as_str())
        .bind(&candidate.session_id)
        .bind(candidate.created_at_utc)
        .bind(candidate.expires_at_utc)
        .bind(now)
        .fetch_optional(self.pool())
        .await
        .context("dedupe insert_if_absent failed")?;

        if inserted.is_some() {
            return Ok(InsertIfAbsent::Inserted);
        }

        let row = sqlx::query(
            r#"
            select fingerprint, session_id, created_at_utc, expires_at_utc, valid
              from duplicate_detection_records
             where fingerprint = $1
            "#,
        )
        .bind(candidate.fingerprint.as_str())
        .fetch_optional(self.pool())
        .await
        .context("dedupe read-back failed")?;

        Ok(match row {
            Some(r) => InsertIfAbsent::Existing(DedupeRecord {
                fingerprint: Fingerprint::from_hex(r.try_get::<String, _>("fingerprint")?),
                session_id: r.try_get("session_id")?,
                created_at_utc: r.try_get("created_at_utc")?,
                expires_at_utc: r.try_get("expires_at_utc")?,
                valid: r.try_get("valid")?,
            }),
            None => InsertIfAbsent::Ambiguous(
                "conflicting record vanished before it could be read".to_string(),
            ),
        })
    }

    async fn invalidate(&self, fingerprint: &Fingerprint) -> Result<bool> {
        let done = sqlx::query(
            "update duplicate_detection_records set valid = false where fingerprint = $1 and valid",
        )
        .bind(fingerprint.as_str())
        .execute(self.pool())
        .await
        .context("dedupe invalidate failed")?;
        Ok(done.rows_affected() > 0)
    }

    async fn invalidate_session(&self, session_id: &str) -> Result<u64> {
        let done = sqlx::query(
            "update duplicate_detection_records set valid = false where session_id = $1 and valid",
        )
        .bind(session_id)
        .execute(self.pool())
        .await
        .context("dedupe invalidate_session failed")?;
        Ok(done.rows_affected())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let done = sqlx::query(
            "delete from duplicate_detection_records where not valid or expires_at_utc <= $1",
        )
        .bind(now)
        .execute(self.pool())
        .await
        .context("dedupe purge_expired failed")?;
        Ok(done.rows_affected())
    }
}
