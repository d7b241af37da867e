//! tranche-db
//!
//! Postgres implementation of the engine's outbound stores.
//!
//! Every conditional write runs in one transaction that also bumps
//! `orders.ledger_revision`; the `where` clause of the update is the
//! compare-and-set. Row locks taken by those updates serialize writers from
//! different processes.

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;

pub use sqlx::PgPool;

mod dedupe;
mod inventory;
mod ledger;

pub use tranche_config::secrets::DEFAULT_DATABASE_URL_ENV as ENV_DB_URL;

/// Connect to Postgres using the URL in `env_var`.
pub async fn connect(env_var: &str) -> Result<PgPool> {
    let url = std::env::var(env_var).with_context(|| format!("missing env var {env_var}"))?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;

    Ok(pool)
}

/// Connect to Postgres using TRANCHE_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    connect(ENV_DB_URL).await
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    tracing::info!("db_migrated");
    Ok(())
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_orders_table: bool,
    pub has_dedupe_table: bool,
}

/// Connectivity plus schema presence.
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    Ok(DbStatus {
        ok: one == 1,
        has_orders_table: table_exists(pool, "orders").await?,
        has_dedupe_table: table_exists(pool, "duplicate_detection_records").await?,
    })
}

async fn table_exists(pool: &PgPool, name: &str) -> Result<bool> {
    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema = 'public' and table_name = $1
        )
        "#,
    )
    .bind(name)
    .fetch_one(pool)
    .await
    .with_context(|| format!("status table-exists query failed for {name}"))?;
    Ok(exists)
}

/// Ledger, inventory and duplicate-detection registry over one pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
