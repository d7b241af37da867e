//! Command handlers for the `tranche` CLI.
//!
//! Shared wiring (config, database, engine construction) lives here; the
//! ledger and repair command groups live in the submodules.

pub mod ledger;
pub mod repair;

use std::sync::Arc;

use anyhow::{Context, Result};
use tranche_audit::{verify_journal, JournalWriter, VerifyResult};
use tranche_config::secrets::{resolve_secrets, ResolvedSecrets};
use tranche_config::{report_unused_keys, EngineSettings, LoadedConfig, UnusedKeyPolicy};
use tranche_db::{PgPool, PgStore};
use tranche_engine::{EngineError, InstallmentEngine, OrderScope};
use tranche_reconcile::RepairMethod;
use tranche_schemas::OrderId;

/// Loaded config plus everything derived from it.
pub struct CliContext {
    pub loaded: LoadedConfig,
    pub settings: EngineSettings,
    pub secrets: ResolvedSecrets,
}

impl CliContext {
    /// Merge `config_paths` (defaults only when empty), warn about keys
    /// nothing reads, and resolve secrets from the environment.
    pub fn load(config_paths: &[String]) -> Result<Self> {
        let loaded = if config_paths.is_empty() {
            tranche_config::empty_config()?
        } else {
            let path_refs: Vec<&str> = config_paths.iter().map(|s| s.as_str()).collect();
            tranche_config::load_layered_yaml(&path_refs)?
        };

        let report = report_unused_keys(&loaded.config_json, UnusedKeyPolicy::Warn)?;
        if !report.is_clean() {
            eprintln!(
                "WARN: CONFIG_UNUSED_KEYS unused_leaf_keys={}",
                report.unused_leaf_pointers.len()
            );
            for p in report.unused_leaf_pointers.iter().take(50) {
                eprintln!("  unused={}", p);
            }
        }

        let settings = EngineSettings::from_config_json(&loaded.config_json)?;
        let secrets = resolve_secrets(&loaded.config_json);
        tracing::debug!(config_hash = %loaded.config_hash, "config_loaded");

        Ok(Self {
            loaded,
            settings,
            secrets,
        })
    }

    pub async fn connect(&self) -> Result<PgPool> {
        self.secrets.require_database_url()?;
        tranche_db::connect(&self.secrets.database_url_env).await
    }

    /// Engine over Postgres, journaling repairs when a journal path is set.
    pub async fn engine(&self) -> Result<InstallmentEngine> {
        let shared = Arc::new(PgStore::new(self.connect().await?));

        let mut engine = InstallmentEngine::new(
            shared.clone(),
            shared.clone(),
            shared,
            self.settings.clone(),
        );
        if let Some(path) = &self.settings.audit.journal_path {
            let journal = JournalWriter::open(path, self.settings.audit.hash_chain)
                .with_context(|| format!("open repair journal {path}"))?;
            engine = engine.with_journal(journal);
        }
        Ok(engine)
    }
}

/// Engine refusals carry their outcome code into the process error.
pub fn refusal(e: EngineError) -> anyhow::Error {
    anyhow::anyhow!("{} ({}): {}", e.outcome_code(), e.severity(), e)
}

pub fn parse_method(s: &str) -> Result<RepairMethod, String> {
    RepairMethod::parse(s.trim()).ok_or_else(|| format!("unknown repair method '{s}'"))
}

pub fn scope(from: Option<i64>, to: Option<i64>) -> OrderScope {
    match (from, to) {
        (Some(from), Some(to)) => OrderScope::Range {
            from: OrderId(from),
            to: OrderId(to),
        },
        _ => OrderScope::All,
    }
}

pub fn audit_verify(config_paths: &[String], path: Option<String>) -> Result<()> {
    let path = match path {
        Some(p) => p,
        None => CliContext::load(config_paths)?
            .settings
            .audit
            .journal_path
            .context("no --path given and audit.journal_path is not configured")?,
    };

    match verify_journal(&path)? {
        VerifyResult::Valid { entries } => {
            println!("journal_valid=true entries={} path={}", entries, path);
            Ok(())
        }
        VerifyResult::Broken { line, reason } => {
            println!("journal_valid=false line={} path={}", line, path);
            anyhow::bail!("JOURNAL_BROKEN: line {line}: {reason}")
        }
    }
}
