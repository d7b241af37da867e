//! In-process harness for cross-crate scenarios.
//!
//! Wires an [`InstallmentEngine`] to the in-memory stores with a manual clock
//! and a collecting sink, so scenarios can drive the real engine, inject store
//! faults and compare full ledger snapshots. No DB or network required.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use tranche_allocation::check_invariant;
use tranche_audit::JournalWriter;
use tranche_config::{load_layered_yaml_from_strings, EngineSettings};
use tranche_dedupe::MemoryRegistry;
use tranche_engine::{CollectingSink, InstallmentEngine, ManualClock, MemoryStore, SubmitRequest};
use tranche_money::Amount;
use tranche_schemas::{DeliveryLine, Installment, InstallmentStatus, Order, OrderId};

/// Fixed start of every scenario clock.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

pub struct TestLedger {
    pub store: Arc<MemoryStore>,
    pub registry: Arc<MemoryRegistry>,
    pub clock: Arc<ManualClock>,
    pub sink: Arc<CollectingSink>,
    pub engine: InstallmentEngine,
}

impl TestLedger {
    pub fn new(settings: EngineSettings) -> Self {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(MemoryRegistry::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let sink = Arc::new(CollectingSink::new());
        let engine =
            InstallmentEngine::new(store.clone(), store.clone(), registry.clone(), settings)
                .with_clock(clock.clone())
                .with_sink(sink.clone());
        Self {
            store,
            registry,
            clock,
            sink,
            engine,
        }
    }

    /// Settings from YAML layers merged in order, the way the CLI loads them.
    pub fn from_yaml(layers: &[&str]) -> Result<Self> {
        let loaded = load_layered_yaml_from_strings(layers)?;
        let settings = EngineSettings::from_config_json(&loaded.config_json)?;
        Ok(Self::new(settings))
    }

    /// Journal repairs to `path`.
    pub fn with_journal(mut self, path: impl AsRef<Path>) -> Result<Self> {
        let journal = JournalWriter::open(path.as_ref(), true)
            .with_context(|| format!("open journal {:?}", path.as_ref()))?;
        self.engine = self.engine.with_journal(journal);
        Ok(self)
    }

    pub fn order(&self, total: i64) -> OrderId {
        self.store.create_order(Amount::new(total), t0()).order_id
    }

    /// An order carrying historical entries as given, bypassing every check.
    pub fn drifted_order(
        &self,
        total: i64,
        entries: &[(i32, i64, InstallmentStatus)],
    ) -> OrderId {
        let order_id = self.order(total);
        for (seq, amount, status) in entries {
            self.store
                .seed_installment(order_id, *seq, Amount::new(*amount), *status, t0());
        }
        order_id
    }

    pub fn snapshot(&self, order_id: OrderId, skus: &[&str]) -> LedgerSnapshot {
        LedgerSnapshot {
            order: self.store.order(order_id),
            installments: self.store.installments_of(order_id),
            stock: skus
                .iter()
                .map(|s| (s.to_string(), self.store.stock(s)))
                .collect(),
            movements: self.store.movement_count(),
        }
    }

    /// Confirmed total never above the order total.
    pub fn assert_invariant(&self, order_id: OrderId) {
        let order = self.store.order(order_id);
        let Some(order) = order else {
            panic!("order {order_id} does not exist");
        };
        let installments = self.store.installments_of(order_id);
        if let Err(v) = check_invariant(&order, &installments) {
            panic!("invariant violated: {v}");
        }
    }
}

/// Everything a rolled-back operation must leave untouched, minus the
/// revision counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub order: Option<Order>,
    pub installments: Vec<Installment>,
    pub stock: BTreeMap<String, i64>,
    pub movements: usize,
}

impl LedgerSnapshot {
    /// Same ledger content, ignoring `ledger_revision` and `updated_at_utc`.
    pub fn same_content(&self, other: &LedgerSnapshot) -> bool {
        let strip = |o: &Option<Order>| {
            o.as_ref()
                .map(|o| (o.order_id, o.total_amount, o.created_at_utc))
        };
        strip(&self.order) == strip(&other.order)
            && self.installments == other.installments
            && self.stock == other.stock
            && self.movements == other.movements
    }
}

pub fn request(order_id: OrderId, amount: i64, actor: &str, session: &str) -> SubmitRequest {
    SubmitRequest {
        order_id,
        amount: Amount::new(amount),
        actor_id: actor.to_string(),
        session_id: session.to_string(),
        memo: None,
        lines: Vec::new(),
    }
}

/// One outbound delivery line (negative quantity) per `(sku, qty)`.
pub fn delivery(
    order_id: OrderId,
    amount: i64,
    actor: &str,
    session: &str,
    lines: &[(&str, i64)],
) -> SubmitRequest {
    let mut req = request(order_id, amount, actor, session);
    req.lines = lines
        .iter()
        .map(|(sku, qty)| DeliveryLine {
            sku: sku.to_string(),
            quantity_delta: -qty,
            unit_price: Amount::new(1_000),
        })
        .collect();
    req
}
