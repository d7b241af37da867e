//! Typed engine settings extracted from the merged config JSON.
//!
//! Every key is optional and falls back to the documented default. A key
//! that is present but of the wrong type or out of range is an error, never
//! silently defaulted.

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use serde_json::Value;
use tranche_allocation::CountingPolicy;
use tranche_money::{Amount, TaxCategory};
use tranche_reconcile::RepairThresholds;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationSettings {
    pub counting_policy: CountingPolicy,
    /// Guarded-insert attempts before `ConcurrentModification`.
    pub max_insert_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupeSettings {
    pub ttl_minutes: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SagaSettings {
    pub step_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSettings {
    /// Attempts for idempotent reads. Writes are never retried.
    pub read_retry_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditSettings {
    pub journal_path: Option<String>,
    pub hash_chain: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub allocation: AllocationSettings,
    pub dedupe: DedupeSettings,
    pub saga: SagaSettings,
    pub repair: RepairThresholds,
    pub store: StoreSettings,
    pub audit: AuditSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            allocation: AllocationSettings {
                counting_policy: CountingPolicy::default(),
                max_insert_attempts: 3,
            },
            dedupe: DedupeSettings { ttl_minutes: 60 },
            saga: SagaSettings {
                step_timeout: Duration::from_millis(5_000),
            },
            repair: RepairThresholds::default(),
            store: StoreSettings {
                read_retry_attempts: 3,
            },
            audit: AuditSettings {
                journal_path: None,
                hash_chain: true,
            },
        }
    }
}

fn read_i64(cfg: &Value, pointer: &str, default: i64) -> Result<i64> {
    match cfg.pointer(pointer) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v
            .as_i64()
            .ok_or_else(|| anyhow!("CONFIG_INVALID {pointer}: expected integer, got {v}")),
    }
}

fn read_positive(cfg: &Value, pointer: &str, default: i64) -> Result<i64> {
    let v = read_i64(cfg, pointer, default)?;
    if v <= 0 {
        bail!("CONFIG_INVALID {pointer}: must be > 0 (got {v})");
    }
    Ok(v)
}

fn read_non_negative(cfg: &Value, pointer: &str, default: i64) -> Result<i64> {
    let v = read_i64(cfg, pointer, default)?;
    if v < 0 {
        bail!("CONFIG_INVALID {pointer}: must be >= 0 (got {v})");
    }
    Ok(v)
}

fn read_u32(cfg: &Value, pointer: &str, default: u32) -> Result<u32> {
    let v = read_positive(cfg, pointer, default as i64)?;
    u32::try_from(v).map_err(|_| anyhow!("CONFIG_INVALID {pointer}: out of range (got {v})"))
}

fn read_str<'a>(cfg: &'a Value, pointer: &str) -> Result<Option<&'a str>> {
    match cfg.pointer(pointer) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim())),
        Some(v) => bail!("CONFIG_INVALID {pointer}: expected string, got {v}"),
    }
}

fn read_bool(cfg: &Value, pointer: &str, default: bool) -> Result<bool> {
    match cfg.pointer(pointer) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Bool(b)) => Ok(*b),
        Some(v) => bail!("CONFIG_INVALID {pointer}: expected bool, got {v}"),
    }
}

impl EngineSettings {
    pub fn from_config_json(cfg: &Value) -> Result<Self> {
        let d = EngineSettings::default();

        let counting_policy = match read_str(cfg, "/allocation/counting_policy")? {
            None => d.allocation.counting_policy,
            Some(s) => CountingPolicy::parse(s).ok_or_else(|| {
                anyhow!(
                    "CONFIG_INVALID /allocation/counting_policy: '{s}' \
                     (expected confirmed_and_draft | confirmed_only)"
                )
            })?,
        };

        let dr = d.repair;
        let tax_rate = match read_str(cfg, "/repair/gross_up_category")? {
            None => dr.tax_rate,
            Some(s) => TaxCategory::parse(s).rate(),
        };
        let repair = RepairThresholds {
            match_tolerance: Amount::new(read_positive(
                cfg,
                "/repair/match_tolerance_minor",
                dr.match_tolerance.raw(),
            )?),
            tax_band_low_bps: read_positive(cfg, "/repair/tax_band_low_bps", dr.tax_band_low_bps)?,
            tax_band_high_bps: read_positive(cfg, "/repair/tax_band_high_bps", dr.tax_band_high_bps)?,
            proportional_band_high_bps: read_positive(
                cfg,
                "/repair/proportional_band_high_bps",
                dr.proportional_band_high_bps,
            )?,
            tax_inclusive_tolerance: Amount::new(read_positive(
                cfg,
                "/repair/tax_inclusive_tolerance_minor",
                dr.tax_inclusive_tolerance.raw(),
            )?),
            max_rounding_residual: Amount::new(read_non_negative(
                cfg,
                "/repair/max_rounding_residual_minor",
                dr.max_rounding_residual.raw(),
            )?),
            tax_rate,
        };
        if !(repair.tax_band_low_bps <= repair.tax_band_high_bps
            && repair.tax_band_high_bps < repair.proportional_band_high_bps)
        {
            bail!(
                "CONFIG_INVALID /repair: bands must satisfy tax_band_low_bps <= tax_band_high_bps \
                 < proportional_band_high_bps (got {} / {} / {})",
                repair.tax_band_low_bps,
                repair.tax_band_high_bps,
                repair.proportional_band_high_bps
            );
        }

        let step_timeout_ms = read_positive(
            cfg,
            "/saga/step_timeout_ms",
            d.saga.step_timeout.as_millis() as i64,
        )?;

        Ok(Self {
            allocation: AllocationSettings {
                counting_policy,
                max_insert_attempts: read_u32(
                    cfg,
                    "/allocation/max_insert_attempts",
                    d.allocation.max_insert_attempts,
                )?,
            },
            dedupe: DedupeSettings {
                ttl_minutes: read_positive(cfg, "/dedupe/ttl_minutes", d.dedupe.ttl_minutes)?,
            },
            saga: SagaSettings {
                step_timeout: Duration::from_millis(step_timeout_ms as u64),
            },
            repair,
            store: StoreSettings {
                read_retry_attempts: read_u32(
                    cfg,
                    "/store/read_retry_attempts",
                    d.store.read_retry_attempts,
                )?,
            },
            audit: AuditSettings {
                journal_path: read_str(cfg, "/audit/journal_path")?
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
                hash_chain: read_bool(cfg, "/audit/hash_chain", d.audit.hash_chain)?,
            },
        })
    }
}
