//! Ledger records shared by every tranche crate.
//!
//! Orders and installments are owned by the backing store; these structs are
//! short-lived snapshots read for one request or one repair pass.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tranche_money::Amount;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            pub const fn raw(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Purchase order identifier.
    OrderId
);
id_type!(
    /// Ledger entry identifier.
    InstallmentId
);
id_type!(
    /// Inventory movement row identifier.
    MovementId
);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: OrderId,
    /// Fixed at creation; changed only by administrative repair. Never negative.
    pub total_amount: Amount,
    pub created_at_utc: DateTime<Utc>,
    pub updated_at_utc: DateTime<Utc>,
    /// Bumped by the store on every write to the order or its installments.
    /// Guarded writes compare against the revision they read.
    pub ledger_revision: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallmentStatus {
    Draft,
    Confirmed,
    Cancelled,
}

impl InstallmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstallmentStatus::Draft => "draft",
            InstallmentStatus::Confirmed => "confirmed",
            InstallmentStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self, UnknownStatus> {
        match s {
            "draft" => Ok(InstallmentStatus::Draft),
            "confirmed" => Ok(InstallmentStatus::Confirmed),
            "cancelled" => Ok(InstallmentStatus::Cancelled),
            other => Err(UnknownStatus(other.to_string())),
        }
    }

    /// Draft and confirmed entries hold a sequence slot; cancelled ones do not.
    pub fn is_valid(&self) -> bool {
        !matches!(self, InstallmentStatus::Cancelled)
    }
}

impl fmt::Display for InstallmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid installment status: {}", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

/// One ledger entry against an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Installment {
    pub installment_id: InstallmentId,
    pub order_id: OrderId,
    /// 1..N, dense among valid (non-cancelled) entries of the order.
    pub sequence_no: i32,
    pub amount: Amount,
    pub status: InstallmentStatus,
    pub actor_id: String,
    pub session_id: String,
    pub memo: Option<String>,
    pub created_at_utc: DateTime<Utc>,
    pub confirmed_at_utc: Option<DateTime<Utc>>,
    pub cancelled_at_utc: Option<DateTime<Utc>>,
}

/// Goods carried by an installment. Each line yields one stock adjustment and
/// one movement row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryLine {
    pub sku: String,
    pub quantity_delta: i64,
    pub unit_price: Amount,
}

/// Append-only inventory movement tied to an installment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Movement {
    pub movement_id: MovementId,
    pub installment_id: InstallmentId,
    pub sku: String,
    pub quantity_delta: i64,
    pub unit_price: Amount,
    pub created_at_utc: DateTime<Utc>,
}
