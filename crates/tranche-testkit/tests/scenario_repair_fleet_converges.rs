//! Scenario: a fleet of historically drifted orders is scanned, the
//! auto-correctable issues are applied, and a second pass changes nothing.
//! Every applied repair lands in the journal with its before-values.

use tranche_audit::{read_journal, verify_journal};
use tranche_config::EngineSettings;
use tranche_engine::{EngineError, OrderScope};
use tranche_money::Amount;
use tranche_reconcile::{IssueId, IssueKind, RepairMethod, RepairOutcome};
use tranche_schemas::{InstallmentStatus, OrderId};
use tranche_testkit::TestLedger;

use InstallmentStatus::Confirmed;

struct Fleet {
    tax: OrderId,
    prop: OrderId,
    gap: OrderId,
    zero: OrderId,
    complex: OrderId,
    clean: OrderId,
}

fn fleet(ledger: &TestLedger) -> Fleet {
    Fleet {
        tax: ledger.drifted_order(1_000_000, &[(1, 600_000, Confirmed), (2, 500_000, Confirmed)]),
        prop: ledger.drifted_order(1_000_000, &[(1, 1_000_000, Confirmed), (2, 1_000_000, Confirmed)]),
        gap: ledger.drifted_order(1_000_000, &[(1, 100_000, Confirmed), (3, 100_000, Confirmed)]),
        zero: ledger.drifted_order(0, &[(1, 50_000, Confirmed)]),
        complex: ledger.drifted_order(100_000, &[(1, 400_000, Confirmed)]),
        clean: ledger.drifted_order(1_000_000, &[(1, 300_000, Confirmed)]),
    }
}

fn issue(order_id: OrderId, kind: IssueKind) -> IssueId {
    IssueId { order_id, kind }
}

#[tokio::test]
async fn auto_repairs_converge_and_replays_are_no_ops() {
    let dir = tempfile::tempdir().unwrap();
    let journal = dir.path().join("repairs.jsonl");
    let ledger = TestLedger::new(EngineSettings::default())
        .with_journal(&journal)
        .unwrap();
    let f = fleet(&ledger);
    let engine = &ledger.engine;

    let report = engine.run_repair_scan(OrderScope::All).await.unwrap();
    assert_eq!(report.orders_scanned, 6);
    assert_eq!(report.issues.len(), 5);
    assert!(!report.issues.iter().any(|i| i.id.order_id == f.clean));

    let auto: Vec<IssueId> = report.auto_correctable().map(|i| i.id).collect();
    assert_eq!(
        auto,
        vec![
            issue(f.tax, IssueKind::TaxInclusiveMismatch),
            issue(f.prop, IssueKind::ProportionalOverAllocation),
            issue(f.gap, IssueKind::SequenceGap),
        ]
    );
    for id in &auto {
        let outcome = engine.apply_repair(*id, RepairMethod::Auto).await.unwrap();
        assert!(outcome.changed_anything(), "{id} was not applied");
    }

    assert_eq!(
        ledger.store.order(f.tax).unwrap().total_amount,
        Amount::new(1_100_000)
    );
    let prop_amounts: Vec<i64> = ledger
        .store
        .installments_of(f.prop)
        .iter()
        .map(|i| i.amount.raw())
        .collect();
    assert_eq!(prop_amounts, vec![500_000, 500_000]);
    let gap_seqs: Vec<i32> = ledger
        .store
        .installments_of(f.gap)
        .iter()
        .map(|i| i.sequence_no)
        .collect();
    assert_eq!(gap_seqs, vec![1, 2]);

    let rescan = engine.run_repair_scan(OrderScope::All).await.unwrap();
    let left: Vec<IssueId> = rescan.issues.iter().map(|i| i.id).collect();
    assert_eq!(
        left,
        vec![
            issue(f.zero, IssueKind::ZeroTotalAnomaly),
            issue(f.complex, IssueKind::ComplexDrift),
        ]
    );
    assert_eq!(rescan.auto_correctable().count(), 0);

    for id in &auto {
        assert_eq!(
            engine.apply_repair(*id, RepairMethod::Auto).await.unwrap(),
            RepairOutcome::AlreadyConsistent { issue: *id }
        );
    }

    assert!(verify_journal(&journal).unwrap().is_valid());
    let entries = read_journal(&journal).unwrap();
    assert_eq!(entries.len(), 3);
    assert!(entries.iter().all(|e| e.kind == "repair_applied"));
    assert_eq!(entries[0].subject, auto[0].to_string());
    assert_eq!(
        entries[0].payload["order_before"]["total_amount"],
        serde_json::json!(1_000_000)
    );
}

#[tokio::test]
async fn manual_issues_wait_for_an_operator() {
    let ledger = TestLedger::new(EngineSettings::default());
    let f = fleet(&ledger);
    let engine = &ledger.engine;

    let complex = issue(f.complex, IssueKind::ComplexDrift);
    let before = ledger.snapshot(f.complex, &[]);
    let err = engine.apply_repair(complex, RepairMethod::Auto).await.unwrap_err();
    assert!(matches!(err, EngineError::RepairAmbiguous { .. }));
    assert_eq!(ledger.snapshot(f.complex, &[]), before);

    let zero = issue(f.zero, IssueKind::ZeroTotalAnomaly);
    let err = engine.apply_repair(zero, RepairMethod::Auto).await.unwrap_err();
    assert_eq!(err.outcome_code(), "repair_ambiguous");

    // The operator decides the entries were right and the total was lost.
    let outcome = engine
        .apply_repair(zero, RepairMethod::AdoptAllocatedTotal)
        .await
        .unwrap();
    assert!(outcome.changed_anything());
    assert_eq!(
        ledger.store.order(f.zero).unwrap().total_amount,
        Amount::new(50_000)
    );

    let report = engine
        .run_repair_scan(OrderScope::Range {
            from: f.zero,
            to: f.zero,
        })
        .await
        .unwrap();
    assert!(report.is_clean());
}

#[tokio::test]
async fn repair_rereads_instead_of_trusting_the_scan() {
    let ledger = TestLedger::new(EngineSettings::default());
    let f = fleet(&ledger);
    let engine = &ledger.engine;

    let report = engine.run_repair_scan(OrderScope::All).await.unwrap();
    let prop = issue(f.prop, IssueKind::ProportionalOverAllocation);
    assert!(report.issues.iter().any(|i| i.id == prop));

    // Between scan and apply an operator cancels one of the two entries.
    let second = ledger.store.installments_of(f.prop)[1].installment_id;
    engine.cancel_installment(second, "ops").await.unwrap();

    assert_eq!(
        engine.apply_repair(prop, RepairMethod::Auto).await.unwrap(),
        RepairOutcome::AlreadyConsistent { issue: prop }
    );
    let amounts: Vec<i64> = ledger
        .store
        .installments_of(f.prop)
        .iter()
        .map(|i| i.amount.raw())
        .collect();
    assert_eq!(amounts, vec![1_000_000, 1_000_000]);
}
