//! Runtime secret resolution.
//!
//! Config YAML stores only environment variable NAMES (for example
//! `store.database_url_env: "TRANCHE_DATABASE_URL"`). Values are read from the
//! environment once at startup and passed to constructors. `Debug` output and
//! error messages never contain a value, only the variable name.

use anyhow::{bail, Result};
use serde_json::Value;

/// Used when the config does not name a variable.
pub const DEFAULT_DATABASE_URL_ENV: &str = "TRANCHE_DATABASE_URL";

#[derive(Clone)]
pub struct ResolvedSecrets {
    /// Name of the variable the URL was (or would have been) read from.
    pub database_url_env: String,
    pub database_url: Option<String>,
}

impl std::fmt::Debug for ResolvedSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedSecrets")
            .field("database_url_env", &self.database_url_env)
            .field(
                "database_url",
                &self.database_url.as_ref().map(|_| "<REDACTED>"),
            )
            .finish()
    }
}

impl ResolvedSecrets {
    /// The database URL, or an error naming the missing variable.
    pub fn require_database_url(&self) -> Result<&str> {
        match self.database_url.as_deref() {
            Some(url) => Ok(url),
            None => bail!(
                "SECRETS_MISSING: required env var '{}' (database url) is not set or empty",
                self.database_url_env
            ),
        }
    }
}

/// Trimmed, non-empty string at `pointer`.
fn read_str_at(config: &Value, pointer: &str) -> Option<String> {
    let s = config.pointer(pointer)?.as_str()?.trim();
    (!s.is_empty()).then(|| s.to_string())
}

/// Unset and blank are the same thing.
fn resolve_env(var_name: &str) -> Option<String> {
    match std::env::var(var_name) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

/// Resolve every secret the config names. Missing values are `None`; callers
/// that need one use the `require_*` accessors.
pub fn resolve_secrets(config_json: &Value) -> ResolvedSecrets {
    let database_url_env = read_str_at(config_json, "/store/database_url_env")
        .unwrap_or_else(|| DEFAULT_DATABASE_URL_ENV.to_string());
    let database_url = resolve_env(&database_url_env);
    ResolvedSecrets {
        database_url_env,
        database_url,
    }
}
