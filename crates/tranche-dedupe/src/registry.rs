//! Registry of duplicate-detection records.
//!
//! [`DedupeRegistry::insert_if_absent`] is the only write path used by the
//! detector and MUST be atomic with respect to concurrent callers for the same
//! fingerprint. Backends that cannot offer that implement [`CheckThenInsert`]
//! instead and are wrapped in [`FailClosed`].

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupeRecord {
    pub fingerprint: Fingerprint,
    pub session_id: String,
    pub created_at_utc: DateTime<Utc>,
    pub expires_at_utc: DateTime<Utc>,
    pub valid: bool,
}

impl DedupeRecord {
    /// A record blocks new attempts only while valid and unexpired.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.valid && self.expires_at_utc > now
    }
}

/// Result of an atomic insert-if-absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertIfAbsent {
    /// No live record existed; `candidate` is now stored.
    Inserted,
    /// A live record already holds this fingerprint.
    Existing(DedupeRecord),
    /// The backend could not tell whether a live record exists.
    Ambiguous(String),
}

#[async_trait]
pub trait DedupeRegistry: Send + Sync {
    /// Store `candidate` unless a live record for the same fingerprint exists.
    /// An expired or invalidated record is overwritten.
    async fn insert_if_absent(
        &self,
        candidate: &DedupeRecord,
        now: DateTime<Utc>,
    ) -> Result<InsertIfAbsent>;

    /// Mark one record invalid. Returns false if there was nothing live.
    async fn invalidate(&self, fingerprint: &Fingerprint) -> Result<bool>;

    /// Mark every record created by `session_id` invalid.
    async fn invalidate_session(&self, session_id: &str) -> Result<u64>;

    /// Delete expired and invalidated records.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

// ---------------------------------------------------------------------------
// In-process registry
// ---------------------------------------------------------------------------

/// Mutex-serialized in-memory registry.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    records: Mutex<HashMap<Fingerprint, DedupeRecord>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one record, live or not.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<DedupeRecord> {
        self.records
            .lock()
            .ok()
            .and_then(|m| m.get(fingerprint).cloned())
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, HashMap<Fingerprint, DedupeRecord>>> {
        self.records
            .lock()
            .map_err(|_| anyhow!("dedupe registry mutex poisoned"))
    }
}

#[async_trait]
impl DedupeRegistry for MemoryRegistry {
    async fn insert_if_absent(
        &self,
        candidate: &DedupeRecord,
        now: DateTime<Utc>,
    ) -> Result<InsertIfAbsent> {
        let mut records = self.guard()?;
        if let Some(existing) = records.get(&candidate.fingerprint) {
            if existing.is_live(now) {
                return Ok(InsertIfAbsent::Existing(existing.clone()));
            }
        }
        records.insert(candidate.fingerprint.clone(), candidate.clone());
        Ok(InsertIfAbsent::Inserted)
    }

    async fn invalidate(&self, fingerprint: &Fingerprint) -> Result<bool> {
        let mut records = self.guard()?;
        Ok(match records.get_mut(fingerprint) {
            Some(r) if r.valid => {
                r.valid = false;
                true
            }
            _ => false,
        })
    }

    async fn invalidate_session(&self, session_id: &str) -> Result<u64> {
        let mut records = self.guard()?;
        let mut n = 0;
        for r in records.values_mut() {
            if r.valid && r.session_id == session_id {
                r.valid = false;
                n += 1;
            }
        }
        Ok(n)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut records = self.guard()?;
        let before = records.len();
        records.retain(|_, r| r.is_live(now));
        Ok((before - records.len()) as u64)
    }
}

// ---------------------------------------------------------------------------
// Non-atomic fallback
// ---------------------------------------------------------------------------

/// Backend offering only separate read and insert.
///
/// `insert` must fail when a row for the fingerprint already exists (unique
/// key), never overwrite silently.
#[async_trait]
pub trait CheckThenInsert: Send + Sync {
    async fn find(&self, fingerprint: &Fingerprint) -> Result<Option<DedupeRecord>>;
    async fn insert(&self, record: &DedupeRecord) -> Result<()>;
    /// Delete the stored row for `dead.fingerprint` only if it still equals
    /// `dead` in every field. Returns false when the row changed or is gone.
    async fn remove_if_unchanged(&self, dead: &DedupeRecord) -> Result<bool>;
    async fn invalidate(&self, fingerprint: &Fingerprint) -> Result<bool>;
    async fn invalidate_session(&self, session_id: &str) -> Result<u64>;
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// Adapts a [`CheckThenInsert`] backend to [`DedupeRegistry`].
///
/// The read-then-insert window is not atomic, so every doubt resolves to
/// "duplicate". A failed read, a lost compare-and-delete of a dead row, or a
/// failed insert (most often a concurrent writer winning the unique key) is
/// reported as [`InsertIfAbsent::Ambiguous`].
pub struct FailClosed<T> {
    inner: T,
}

impl<T> FailClosed<T> {
    pub fn new(inner: T) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

#[async_trait]
impl<T: CheckThenInsert> DedupeRegistry for FailClosed<T> {
    async fn insert_if_absent(
        &self,
        candidate: &DedupeRecord,
        now: DateTime<Utc>,
    ) -> Result<InsertIfAbsent> {
        let fp = &candidate.fingerprint;
        let existing = match self.inner.find(fp).await {
            Ok(v) => v,
            Err(e) => return Ok(InsertIfAbsent::Ambiguous(format!("read failed: {e:#}"))),
        };

        if let Some(rec) = existing {
            if rec.is_live(now) {
                return Ok(InsertIfAbsent::Existing(rec));
            }
            // Another attempt may have taken over the same dead row since
            // our read; only the caller that actually clears it may insert.
            match self.inner.remove_if_unchanged(&rec).await {
                Ok(true) => {}
                Ok(false) => {
                    return Ok(InsertIfAbsent::Ambiguous(
                        "dead record changed before takeover".to_string(),
                    ))
                }
                Err(e) => {
                    return Ok(InsertIfAbsent::Ambiguous(format!(
                        "could not clear dead record: {e:#}"
                    )))
                }
            }
        }

        match self.inner.insert(candidate).await {
            Ok(()) => Ok(InsertIfAbsent::Inserted),
            Err(e) => Ok(InsertIfAbsent::Ambiguous(format!("insert failed: {e:#}"))),
        }
    }

    async fn invalidate(&self, fingerprint: &Fingerprint) -> Result<bool> {
        self.inner.invalidate(fingerprint).await
    }

    async fn invalidate_session(&self, session_id: &str) -> Result<u64> {
        self.inner.invalidate_session(session_id).await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        self.inner.purge_expired(now).await
    }
}
