use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};

use crate::fingerprint::{fingerprint, Fingerprint, OperationDescriptor};
use crate::registry::{DedupeRecord, DedupeRegistry, InsertIfAbsent};

pub const DEFAULT_TTL_MINUTES: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// First sighting within the TTL; a record now guards the fingerprint.
    Fresh { expires_at_utc: DateTime<Utc> },
    /// A live record already exists.
    Duplicate {
        first_seen_at_utc: DateTime<Utc>,
        expires_at_utc: DateTime<Utc>,
        session_id: String,
    },
    /// The registry failed or could not decide. Treated as a duplicate.
    FailClosed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupeCheck {
    pub fingerprint: Fingerprint,
    pub verdict: Verdict,
}

impl DedupeCheck {
    pub fn is_duplicate(&self) -> bool {
        !matches!(self.verdict, Verdict::Fresh { .. })
    }
}

/// Gate in front of every allocation attempt.
pub struct DuplicateDetector<R: ?Sized> {
    registry: Arc<R>,
    ttl: Duration,
}

impl<R: ?Sized> Clone for DuplicateDetector<R> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            ttl: self.ttl,
        }
    }
}

impl<R: DedupeRegistry + ?Sized> DuplicateDetector<R> {
    pub fn new(registry: Arc<R>) -> Self {
        Self::with_ttl(registry, Duration::minutes(DEFAULT_TTL_MINUTES))
    }

    pub fn with_ttl(registry: Arc<R>, ttl: Duration) -> Self {
        Self { registry, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn registry(&self) -> &Arc<R> {
        &self.registry
    }

    /// Fingerprint `desc` and atomically record it unless a live record exists.
    ///
    /// Never returns an error: registry failures become
    /// [`Verdict::FailClosed`].
    pub async fn check_and_record(
        &self,
        desc: &OperationDescriptor,
        now: DateTime<Utc>,
    ) -> DedupeCheck {
        let fp = fingerprint(desc);
        let expires_at_utc = now + self.ttl;
        let candidate = DedupeRecord {
            fingerprint: fp.clone(),
            session_id: desc.session_id.clone(),
            created_at_utc: now,
            expires_at_utc,
            valid: true,
        };

        let verdict = match self.registry.insert_if_absent(&candidate, now).await {
            Ok(InsertIfAbsent::Inserted) => Verdict::Fresh { expires_at_utc },
            Ok(InsertIfAbsent::Existing(rec)) => Verdict::Duplicate {
                first_seen_at_utc: rec.created_at_utc,
                expires_at_utc: rec.expires_at_utc,
                session_id: rec.session_id,
            },
            Ok(InsertIfAbsent::Ambiguous(reason)) => Verdict::FailClosed { reason },
            Err(e) => Verdict::FailClosed {
                reason: format!("{e:#}"),
            },
        };

        match &verdict {
            Verdict::Fresh { .. } => {
                tracing::debug!(fingerprint = fp.short(), order_id = %desc.order_id, "dedupe_recorded");
            }
            Verdict::Duplicate { session_id, .. } => {
                tracing::warn!(
                    fingerprint = fp.short(),
                    order_id = %desc.order_id,
                    first_session = %session_id,
                    "dedupe_duplicate"
                );
            }
            Verdict::FailClosed { reason } => {
                tracing::warn!(
                    fingerprint = fp.short(),
                    order_id = %desc.order_id,
                    reason = %reason,
                    "dedupe_fail_closed"
                );
            }
        }

        DedupeCheck {
            fingerprint: fp,
            verdict,
        }
    }

    /// Invalidate the record guarding `fingerprint` (saga compensation).
    pub async fn release(&self, fingerprint: &Fingerprint) -> Result<bool> {
        self.registry.invalidate(fingerprint).await
    }

    /// Invalidate every record created by `session_id`.
    pub async fn end_session(&self, session_id: &str) -> Result<u64> {
        let n = self.registry.invalidate_session(session_id).await?;
        tracing::info!(session_id, invalidated = n, "dedupe_session_ended");
        Ok(n)
    }

    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let n = self.registry.purge_expired(now).await?;
        tracing::info!(purged = n, "dedupe_purged");
        Ok(n)
    }
}
