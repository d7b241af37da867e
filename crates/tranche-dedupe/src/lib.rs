//! tranche-dedupe
//!
//! Duplicate-operation detector.
//!
//! - A fingerprint is a SHA-256 over (order id, amount, operation kind,
//!   actor id). The session id is deliberately NOT part of it: the same
//!   logical operation retried from a new session is still a duplicate.
//! - Check-and-record is one atomic `insert_if_absent` call on the registry.
//!   The registry (store), not this crate, provides linearizability.
//! - Fail closed: any registry error or ambiguous answer is reported as a
//!   duplicate. A false positive costs a resubmission; a false negative costs
//!   a double allocation.
//! - Records expire after a TTL (default 60 minutes) and are invalidated early
//!   when their session ends or when the allocation they guarded rolls back.

mod detector;
mod fingerprint;
mod registry;

pub use detector::{DedupeCheck, DuplicateDetector, Verdict, DEFAULT_TTL_MINUTES};
pub use fingerprint::{fingerprint, Fingerprint, OperationDescriptor, OperationKind};
pub use registry::{
    CheckThenInsert, DedupeRecord, DedupeRegistry, FailClosed, InsertIfAbsent, MemoryRegistry,
};
