//! Scenario: one order taken from first delivery to a repaired, journaled
//! ledger, with every refusal along the way leaving no trace.

use chrono::Duration;
use tranche_audit::{read_journal, verify_journal};
use tranche_config::EngineSettings;
use tranche_engine::{EngineError, FaultOp, OrderScope};
use tranche_money::Amount;
use tranche_reconcile::{IssueId, IssueKind, RepairMethod, RepairOutcome};
use tranche_schemas::InstallmentStatus;
use tranche_testkit::{delivery, request, TestLedger};

const SKUS: &[&str] = &["W-1", "W-2"];

fn stocked(settings: EngineSettings) -> TestLedger {
    let ledger = TestLedger::new(settings);
    ledger.store.set_stock("W-1", 100);
    ledger.store.set_stock("W-2", 40);
    ledger
}

#[tokio::test]
async fn deliveries_cancellation_and_renumbering() {
    let dir = tempfile::tempdir().unwrap();
    let journal = dir.path().join("repairs.jsonl");
    let ledger = stocked(EngineSettings::default()).with_journal(&journal).unwrap();
    let order_id = ledger.order(1_000_000);
    let engine = &ledger.engine;

    let d1 = engine
        .submit_installment(delivery(order_id, 400_000, "alice", "s1", &[("W-1", 10), ("W-2", 5)]))
        .await
        .unwrap();

    // Same delivery retried from another tab.
    let err = engine
        .submit_installment(delivery(order_id, 400_000, "alice", "s9", &[("W-1", 10), ("W-2", 5)]))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Duplicate(_)));
    assert_eq!(ledger.store.installments_of(order_id).len(), 1);

    let d2 = engine
        .submit_installment(delivery(order_id, 300_000, "bob", "s1", &[("W-1", 20)]))
        .await
        .unwrap();
    let d3 = engine
        .submit_installment(request(order_id, 300_000, "carol", "s2"))
        .await
        .unwrap();
    assert_eq!((d1.sequence_no, d2.sequence_no, d3.sequence_no), (1, 2, 3));
    assert_eq!(d3.remaining, Amount::ZERO);
    assert_eq!(ledger.store.stock("W-1"), 70);
    assert_eq!(ledger.store.stock("W-2"), 35);

    // Full order: one more minor unit is refused.
    let err = engine
        .submit_installment(request(order_id, 1, "dave", "s2"))
        .await
        .unwrap_err();
    assert_eq!(err.remaining().unwrap().exceeding_amount, Amount::new(1));

    engine.confirm_installment(d1.installment_id).await.unwrap();
    engine.confirm_installment(d3.installment_id).await.unwrap();

    let c = engine.cancel_installment(d2.installment_id, "ops").await.unwrap();
    assert_eq!(c.reversed_movements, 1);
    assert_eq!(ledger.store.stock("W-1"), 90);
    // Movements are append-only: the reversal is a new row.
    assert_eq!(ledger.store.movement_count(), 4);

    // Bob's fingerprint was freed by the cancellation.
    let again = engine
        .submit_installment(delivery(order_id, 300_000, "bob", "s1", &[("W-1", 20)]))
        .await
        .unwrap();
    assert_eq!(again.sequence_no, 4);

    let report = engine.run_repair_scan(OrderScope::All).await.unwrap();
    let gap = IssueId {
        order_id,
        kind: IssueKind::SequenceGap,
    };
    assert_eq!(report.issues.len(), 1);
    assert_eq!(report.issues[0].id, gap);
    assert!(report.issues[0].auto_correctable);

    let outcome = engine.apply_repair(gap, RepairMethod::Auto).await.unwrap();
    assert!(outcome.changed_anything());
    let valid: Vec<(i32, InstallmentStatus)> = ledger
        .store
        .installments_of(order_id)
        .iter()
        .filter(|i| i.status.is_valid())
        .map(|i| (i.sequence_no, i.status))
        .collect();
    assert_eq!(
        valid,
        vec![
            (1, InstallmentStatus::Confirmed),
            (2, InstallmentStatus::Confirmed),
            (3, InstallmentStatus::Draft),
        ]
    );

    assert_eq!(
        engine.apply_repair(gap, RepairMethod::Auto).await.unwrap(),
        RepairOutcome::AlreadyConsistent { issue: gap }
    );
    ledger.assert_invariant(order_id);

    assert!(verify_journal(&journal).unwrap().is_valid());
    let entries = read_journal(&journal).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].subject, gap.to_string());

    let codes = ledger.sink.codes();
    for expected in [
        "installment_accepted",
        "exceeds_remaining",
        "duplicate_operation",
        "installment_confirmed",
        "installment_cancelled",
        "repair_applied",
        "repair_already_consistent",
    ] {
        assert!(codes.iter().any(|c| c == expected), "missing {expected} in {codes:?}");
    }
}

#[tokio::test]
async fn failed_steps_leave_the_ledger_as_it_was() {
    let ledger = stocked(EngineSettings::default());
    let order_id = ledger.order(1_000_000);
    let engine = &ledger.engine;
    let before = ledger.snapshot(order_id, SKUS);

    for op in [FaultOp::InsertInstallment, FaultOp::AdjustStock, FaultOp::InsertMovements] {
        ledger.store.fail_next(op, 1);
        let err = engine
            .submit_installment(delivery(order_id, 250_000, "alice", "s1", &[("W-1", 5)]))
            .await
            .unwrap_err();
        assert_eq!(err.outcome_code(), "step_failed_rolled_back", "fault at {op:?}");
        assert!(ledger.snapshot(order_id, SKUS).same_content(&before), "fault at {op:?}");
    }

    // Nothing above left a fingerprint behind.
    let accepted = engine
        .submit_installment(delivery(order_id, 250_000, "alice", "s1", &[("W-1", 5)]))
        .await
        .unwrap();
    let after_submit = ledger.snapshot(order_id, SKUS);

    for op in [FaultOp::CancelInstallments, FaultOp::AdjustStock, FaultOp::InsertMovements] {
        ledger.store.fail_next(op, 1);
        let err = engine
            .cancel_installment(accepted.installment_id, "ops")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StepFailed(_)), "fault at {op:?}: {err}");
        assert!(
            ledger.snapshot(order_id, SKUS).same_content(&after_submit),
            "fault at {op:?}"
        );
    }

    engine
        .cancel_installment(accepted.installment_id, "ops")
        .await
        .unwrap();
    assert_eq!(ledger.store.stock("W-1"), 100);
}

#[tokio::test]
async fn fingerprints_expire_and_end_with_their_session() {
    let ledger = TestLedger::from_yaml(&["dedupe:\n  ttl_minutes: 30\n"]).unwrap();
    let order_id = ledger.order(1_000_000);
    let engine = &ledger.engine;

    engine
        .submit_installment(request(order_id, 50_000, "alice", "tab-1"))
        .await
        .unwrap();
    assert!(matches!(
        engine
            .submit_installment(request(order_id, 50_000, "alice", "tab-2"))
            .await,
        Err(EngineError::Duplicate(_))
    ));

    // Ending the recording session frees the fingerprint.
    assert_eq!(engine.end_session("tab-1").await.unwrap(), 1);
    engine
        .submit_installment(request(order_id, 50_000, "alice", "tab-2"))
        .await
        .unwrap();

    // Past the configured TTL the same operation is fresh again.
    ledger.clock.advance(Duration::minutes(31));
    engine
        .submit_installment(request(order_id, 50_000, "alice", "tab-3"))
        .await
        .unwrap();
    assert_eq!(ledger.store.installments_of(order_id).len(), 3);

    // One record per fingerprint, replaced on each fresh acceptance.
    assert_eq!(ledger.registry.len(), 1);
    assert_eq!(engine.purge_expired_fingerprints().await.unwrap(), 0);

    assert_eq!(engine.end_session("tab-3").await.unwrap(), 1);
    assert_eq!(engine.purge_expired_fingerprints().await.unwrap(), 1);
    assert!(ledger.registry.is_empty());
}
