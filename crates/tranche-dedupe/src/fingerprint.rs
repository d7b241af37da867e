use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tranche_money::Amount;
use tranche_schemas::OrderId;

/// Bumped whenever the canonical layout below changes; old fingerprints then
/// simply stop matching.
const FINGERPRINT_VERSION: &str = "tranche-dedupe/v1";

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    SubmitInstallment,
    ConfirmInstallment,
    CancelInstallment,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::SubmitInstallment => "submit_installment",
            OperationKind::ConfirmInstallment => "confirm_installment",
            OperationKind::CancelInstallment => "cancel_installment",
        }
    }
}

/// Everything the caller knows about one attempted operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationDescriptor {
    pub order_id: OrderId,
    /// Already in minor units, so it is normalized by construction.
    pub amount: Amount,
    pub kind: OperationKind,
    pub actor_id: String,
    /// Recorded alongside the fingerprint, never hashed.
    pub session_id: String,
}

/// Hex SHA-256 identifying one logical operation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wrap an already-computed hex digest (e.g. read back from the store).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Fingerprint(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deterministic fingerprint of `desc`. The actor id is trimmed; the session
/// id is ignored.
pub fn fingerprint(desc: &OperationDescriptor) -> Fingerprint {
    let canonical = format!(
        "{FINGERPRINT_VERSION}|order={}|amount={}|kind={}|actor={}",
        desc.order_id.raw(),
        desc.amount.raw(),
        desc.kind.as_str(),
        desc.actor_id.trim(),
    );
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Fingerprint(hex::encode(hasher.finalize()))
}
