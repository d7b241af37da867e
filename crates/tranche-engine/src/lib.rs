//! tranche-engine
//!
//! Installment allocation engine: the inbound operations (`get_remaining`,
//! `submit_installment`, `confirm_installment`, `cancel_installment`,
//! `run_repair_scan`, `apply_repair`) wired over outbound store traits.
//!
//! Submission pipeline, all under the per-order lock:
//! 1. validate the request (no IO)
//! 2. pre-check the remaining amount; refuse with no side effect
//! 3. saga: register fingerprint -> guarded ledger insert -> stock -> movements
//!
//! A failed saga is compensated in reverse. A partial rollback is always
//! reported as such (`Severity::Critical`), never folded into a refusal.
//!
//! [`MemoryStore`] implements the store traits in-process; the Postgres
//! implementation lives in `tranche-db`.

mod clock;
mod error;
mod locks;
mod memory;
mod notify;
mod repair;
mod retry;
mod service;
mod steps;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{EngineError, EngineResult, Severity};
pub use locks::OrderLocks;
pub use memory::{FaultOp, MemoryStore};
pub use notify::{CollectingSink, NotificationSink, Outcome, TracingSink};
pub use retry::with_read_retry;
pub use service::{Accepted, Cancelled, Confirmed, InstallmentEngine, SubmitRequest};
pub use store::{
    InsertOutcome, InventoryStore, LedgerStore, NewInstallment, OrderScope, WriteOutcome,
};
