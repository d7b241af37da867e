use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tranche_audit::{read_journal, verify_journal, JournalWriter};
use tranche_config::EngineSettings;
use tranche_dedupe::MemoryRegistry;
use tranche_engine::{EngineError, InstallmentEngine, ManualClock, MemoryStore, OrderScope};
use tranche_money::Amount;
use tranche_reconcile::{IssueId, IssueKind, RepairMethod, RepairOutcome, RepairPlan};
use tranche_schemas::{InstallmentStatus, OrderId};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

fn setup() -> (Arc<MemoryStore>, InstallmentEngine) {
    let store = Arc::new(MemoryStore::new());
    let engine = InstallmentEngine::new(
        store.clone(),
        store.clone(),
        Arc::new(MemoryRegistry::new()),
        EngineSettings::default(),
    )
    .with_clock(Arc::new(ManualClock::new(t0())));
    (store, engine)
}

fn seed(store: &MemoryStore, total: i64, amounts: &[i64]) -> OrderId {
    let order = store.create_order(Amount::new(total), t0());
    for (i, a) in amounts.iter().enumerate() {
        store.seed_installment(
            order.order_id,
            i as i32 + 1,
            Amount::new(*a),
            InstallmentStatus::Confirmed,
            t0(),
        );
    }
    order.order_id
}

fn id(order_id: OrderId, kind: IssueKind) -> IssueId {
    IssueId { order_id, kind }
}

#[tokio::test]
async fn scan_classifies_every_order_in_scope() {
    let (store, engine) = setup();
    let clean = seed(&store, 1_000, &[400, 600]);
    let tax = seed(&store, 1_000_000, &[1_100_000]);
    let prop = seed(&store, 10_000_000, &[7_000_000, 5_000_000, 3_000_000]);
    let zero = seed(&store, 0, &[500]);
    let complex = seed(&store, 1_000, &[5_000]);

    let report = engine.run_repair_scan(OrderScope::All).await.unwrap();
    assert_eq!(report.orders_scanned, 5);
    let kinds: Vec<(OrderId, IssueKind)> =
        report.issues.iter().map(|i| (i.id.order_id, i.id.kind)).collect();
    assert_eq!(
        kinds,
        vec![
            (tax, IssueKind::TaxInclusiveMismatch),
            (prop, IssueKind::ProportionalOverAllocation),
            (zero, IssueKind::ZeroTotalAnomaly),
            (complex, IssueKind::ComplexDrift),
        ]
    );
    assert!(!kinds.iter().any(|(o, _)| *o == clean));
    assert_eq!(report.auto_correctable().count(), 2);

    let ranged = engine
        .run_repair_scan(OrderScope::Range { from: tax, to: prop })
        .await
        .unwrap();
    assert_eq!(ranged.orders_scanned, 2);
    assert_eq!(ranged.issues.len(), 2);
}

#[tokio::test]
async fn tax_repair_rescales_the_total_and_is_idempotent() {
    let (store, engine) = setup();
    let order_id = seed(&store, 1_000_000, &[1_100_000]);
    let issue = id(order_id, IssueKind::TaxInclusiveMismatch);

    let outcome = engine.apply_repair(issue, RepairMethod::Auto).await.unwrap();
    assert_eq!(
        outcome,
        RepairOutcome::Applied {
            issue,
            plan: RepairPlan::SetOrderTotal {
                order_id,
                from: Amount::new(1_000_000),
                to: Amount::new(1_100_000),
            },
        }
    );
    assert_eq!(store.order(order_id).unwrap().total_amount, Amount::new(1_100_000));

    let again = engine.apply_repair(issue, RepairMethod::Auto).await.unwrap();
    assert_eq!(again, RepairOutcome::AlreadyConsistent { issue });
    assert!(!again.changed_anything());
}

#[tokio::test]
async fn tax_repair_never_leaves_the_order_over_allocated() {
    let (store, engine) = setup();
    let short = seed(&store, 1_000_000, &[1_100_500]);
    let covered = seed(&store, 1_000_000, &[1_099_400]);

    let report = engine.run_repair_scan(OrderScope::All).await.unwrap();
    let flags: Vec<(OrderId, bool)> = report
        .issues
        .iter()
        .map(|i| (i.id.order_id, i.auto_correctable))
        .collect();
    assert_eq!(flags, vec![(short, false), (covered, true)]);

    let err = engine
        .apply_repair(id(short, IssueKind::TaxInclusiveMismatch), RepairMethod::Auto)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::RepairAmbiguous { .. }));
    assert_eq!(store.order(short).unwrap().total_amount, Amount::new(1_000_000));

    engine
        .apply_repair(id(covered, IssueKind::TaxInclusiveMismatch), RepairMethod::Auto)
        .await
        .unwrap();
    let order = store.order(covered).unwrap();
    assert_eq!(order.total_amount, Amount::new(1_100_000));
    assert!(tranche_allocation::check_invariant(&order, &store.installments_of(covered)).is_ok());

    let rescan = engine
        .run_repair_scan(OrderScope::Range { from: covered, to: covered })
        .await
        .unwrap();
    assert!(rescan.issues.is_empty());
}

#[tokio::test]
async fn proportional_repair_converges_on_the_total() {
    let (store, engine) = setup();
    let order_id = seed(&store, 10_000_000, &[7_000_000, 5_000_000, 3_000_000]);
    let issue = id(order_id, IssueKind::ProportionalOverAllocation);

    let outcome = engine
        .apply_repair(issue, RepairMethod::ProportionalReduce)
        .await
        .unwrap();
    assert!(outcome.changed_anything());

    let amounts: Vec<i64> = store
        .installments_of(order_id)
        .iter()
        .map(|i| i.amount.raw())
        .collect();
    assert_eq!(amounts, vec![4_666_667, 3_333_333, 2_000_000]);
    assert_eq!(amounts.iter().sum::<i64>(), 10_000_000);

    let again = engine.apply_repair(issue, RepairMethod::Auto).await.unwrap();
    assert_eq!(again, RepairOutcome::AlreadyConsistent { issue });
}

#[tokio::test]
async fn zero_total_needs_an_operator_choice() {
    let (store, engine) = setup();
    let order_id = seed(&store, 0, &[500]);
    let issue = id(order_id, IssueKind::ZeroTotalAnomaly);

    let err = engine.apply_repair(issue, RepairMethod::Auto).await.unwrap_err();
    assert!(matches!(err, EngineError::RepairAmbiguous { .. }), "{err}");
    assert_eq!(store.installments_of(order_id)[0].status, InstallmentStatus::Confirmed);

    engine
        .apply_repair(issue, RepairMethod::ClearInstallments)
        .await
        .unwrap();
    let entry = &store.installments_of(order_id)[0];
    assert_eq!(entry.status, InstallmentStatus::Cancelled);
    assert_eq!(entry.cancelled_at_utc, Some(t0()));

    let again = engine
        .apply_repair(issue, RepairMethod::ClearInstallments)
        .await
        .unwrap();
    assert_eq!(again, RepairOutcome::AlreadyConsistent { issue });
}

#[tokio::test]
async fn adopting_the_allocated_total_resolves_a_zero_total() {
    let (store, engine) = setup();
    let order_id = seed(&store, 0, &[500, 250]);
    engine
        .apply_repair(
            id(order_id, IssueKind::ZeroTotalAnomaly),
            RepairMethod::AdoptAllocatedTotal,
        )
        .await
        .unwrap();
    assert_eq!(store.order(order_id).unwrap().total_amount, Amount::new(750));
}

#[tokio::test]
async fn complex_drift_is_never_auto_corrected() {
    let (store, engine) = setup();
    let order_id = seed(&store, 1_000, &[5_000]);
    let before = store.order(order_id).unwrap();

    let err = engine
        .apply_repair(id(order_id, IssueKind::ComplexDrift), RepairMethod::Auto)
        .await
        .unwrap_err();
    assert_eq!(err.outcome_code(), "repair_ambiguous");
    assert_eq!(store.order(order_id).unwrap(), before);
}

#[tokio::test]
async fn renumbering_closes_sequence_gaps() {
    let (store, engine) = setup();
    let order = store.create_order(Amount::new(1_000), t0());
    for seq in [1, 3, 7] {
        store.seed_installment(order.order_id, seq, Amount::new(100), InstallmentStatus::Draft, t0());
    }

    let issue = id(order.order_id, IssueKind::SequenceGap);
    engine.apply_repair(issue, RepairMethod::Renumber).await.unwrap();
    let seqs: Vec<i32> = store
        .installments_of(order.order_id)
        .iter()
        .map(|i| i.sequence_no)
        .collect();
    assert_eq!(seqs, vec![1, 2, 3]);
}

#[tokio::test]
async fn a_repair_for_an_issue_the_order_no_longer_has_is_not_applicable() {
    let (store, engine) = setup();
    let order = store.create_order(Amount::new(1_000), t0());
    store.seed_installment(order.order_id, 2, Amount::new(100), InstallmentStatus::Draft, t0());

    let outcome = engine
        .apply_repair(
            id(order.order_id, IssueKind::TaxInclusiveMismatch),
            RepairMethod::Auto,
        )
        .await
        .unwrap();
    assert_eq!(
        outcome,
        RepairOutcome::NotApplicable {
            issue: id(order.order_id, IssueKind::TaxInclusiveMismatch),
            current: vec![IssueKind::SequenceGap],
        }
    );
}

#[tokio::test]
async fn applied_repairs_are_journaled_with_a_valid_chain() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("repairs/journal.jsonl");

    let store = Arc::new(MemoryStore::new());
    let engine = InstallmentEngine::new(
        store.clone(),
        store.clone(),
        Arc::new(MemoryRegistry::new()),
        EngineSettings::default(),
    )
    .with_clock(Arc::new(ManualClock::new(t0())))
    .with_journal(JournalWriter::open(&path, true).unwrap());

    let tax = seed(&store, 1_000_000, &[1_100_000]);
    let prop = seed(&store, 10_000_000, &[7_000_000, 5_000_000, 3_000_000]);
    engine
        .apply_repair(id(tax, IssueKind::TaxInclusiveMismatch), RepairMethod::Auto)
        .await
        .unwrap();
    engine
        .apply_repair(id(prop, IssueKind::ProportionalOverAllocation), RepairMethod::Auto)
        .await
        .unwrap();
    // No-op repairs leave no entry.
    engine
        .apply_repair(id(tax, IssueKind::TaxInclusiveMismatch), RepairMethod::Auto)
        .await
        .unwrap();

    assert!(verify_journal(&path).unwrap().is_valid());
    let entries = read_journal(&path).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].kind, "repair_applied");
    assert_eq!(entries[0].subject, format!("{tax}:tax_inclusive_mismatch"));
    assert_eq!(entries[0].payload["plan"]["action"], "set_order_total");
    assert_eq!(entries[0].payload["order_before"]["total_amount"], 1_000_000);
    assert_eq!(entries[1].payload["plan"]["changes"].as_array().unwrap().len(), 3);
}
