use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tranche_config::EngineSettings;
use tranche_dedupe::MemoryRegistry;
use tranche_engine::{
    CollectingSink, EngineError, FaultOp, InstallmentEngine, ManualClock, MemoryStore, Severity,
    SubmitRequest,
};
use tranche_money::Amount;
use tranche_saga::{Rollback, SagaState, StepError};
use tranche_schemas::{DeliveryLine, OrderId};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

fn setup(settings: EngineSettings) -> (Arc<MemoryStore>, Arc<CollectingSink>, InstallmentEngine) {
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(CollectingSink::new());
    let engine = InstallmentEngine::new(
        store.clone(),
        store.clone(),
        Arc::new(MemoryRegistry::new()),
        settings,
    )
    .with_clock(Arc::new(ManualClock::new(t0())))
    .with_sink(sink.clone());
    store.set_stock("SKU-A", 100);
    store.set_stock("SKU-B", 50);
    (store, sink, engine)
}

fn delivery(order_id: OrderId) -> SubmitRequest {
    SubmitRequest {
        order_id,
        amount: Amount::new(250_000),
        actor_id: "alice".to_string(),
        session_id: "s1".to_string(),
        memo: Some("first delivery".to_string()),
        lines: vec![
            DeliveryLine {
                sku: "SKU-A".to_string(),
                quantity_delta: -10,
                unit_price: Amount::new(15_000),
            },
            DeliveryLine {
                sku: "SKU-B".to_string(),
                quantity_delta: -5,
                unit_price: Amount::new(20_000),
            },
        ],
    }
}

fn step_failure(err: EngineError) -> tranche_saga::SagaFailure {
    match err {
        EngineError::StepFailed(f) => f,
        other => panic!("expected a step failure, got {other}"),
    }
}

/// The order, stock and movement log look as if nothing was attempted, and
/// the fingerprint no longer blocks a resubmission.
async fn assert_untouched(store: &MemoryStore, engine: &InstallmentEngine, order_id: OrderId) {
    assert!(store.installments_of(order_id).is_empty());
    assert_eq!(store.stock("SKU-A"), 100);
    assert_eq!(store.stock("SKU-B"), 50);
    assert_eq!(store.movement_count(), 0);

    store.clear_faults();
    let accepted = engine.submit_installment(delivery(order_id)).await.unwrap();
    assert_eq!(accepted.sequence_no, 1);
}

#[tokio::test]
async fn full_delivery_applies_every_step() {
    let (store, sink, engine) = setup(EngineSettings::default());
    let order = store.create_order(Amount::new(1_000_000), t0());

    engine.submit_installment(delivery(order.order_id)).await.unwrap();

    assert_eq!(store.stock("SKU-A"), 90);
    assert_eq!(store.stock("SKU-B"), 45);
    assert_eq!(store.movement_count(), 2);
    assert_eq!(sink.codes(), vec!["installment_accepted".to_string()]);
}

#[tokio::test]
async fn ledger_insert_failure_releases_the_fingerprint() {
    let (store, _sink, engine) = setup(EngineSettings::default());
    let order = store.create_order(Amount::new(1_000_000), t0());
    store.fail_next(FaultOp::InsertInstallment, 1);

    let err = engine.submit_installment(delivery(order.order_id)).await.unwrap_err();
    assert_eq!(err.outcome_code(), "step_failed_rolled_back");
    assert_eq!(err.severity(), Severity::Error);
    let f = step_failure(err);
    assert_eq!(f.failed_step, "insert_ledger_entry");
    assert_eq!(
        f.rollback,
        Rollback::RolledBack {
            compensated: vec!["register_fingerprint"]
        }
    );

    assert_untouched(&store, &engine, order.order_id).await;
}

#[tokio::test]
async fn stock_failure_mid_way_undoes_earlier_lines_and_steps() {
    let (store, _sink, engine) = setup(EngineSettings::default());
    let order = store.create_order(Amount::new(1_000_000), t0());
    // SKU-A goes through, SKU-B fails.
    store.fail_after(FaultOp::AdjustStock, 1, 1);

    let f = step_failure(engine.submit_installment(delivery(order.order_id)).await.unwrap_err());
    assert_eq!(f.failed_step, "adjust_stock");
    assert_eq!(f.failed_index, 2);
    assert!(f.rollback.is_complete());

    assert_untouched(&store, &engine, order.order_id).await;
}

#[tokio::test]
async fn movement_failure_compensates_in_reverse_order() {
    let (store, _sink, engine) = setup(EngineSettings::default());
    let order = store.create_order(Amount::new(1_000_000), t0());
    store.fail_next(FaultOp::InsertMovements, 1);

    let f = step_failure(engine.submit_installment(delivery(order.order_id)).await.unwrap_err());
    assert_eq!(f.failed_step, "write_movements");
    assert_eq!(
        f.rollback,
        Rollback::RolledBack {
            compensated: vec!["adjust_stock", "insert_ledger_entry", "register_fingerprint"]
        }
    );
    assert_eq!(f.trace.last(), Some(&SagaState::RolledBack));

    assert_untouched(&store, &engine, order.order_id).await;
}

#[tokio::test]
async fn a_timed_out_step_is_a_failure() {
    let mut settings = EngineSettings::default();
    settings.saga.step_timeout = Duration::from_millis(50);
    let (store, _sink, engine) = setup(settings);
    let order = store.create_order(Amount::new(1_000_000), t0());
    store.delay(FaultOp::InsertMovements, Duration::from_millis(500));

    let f = step_failure(engine.submit_installment(delivery(order.order_id)).await.unwrap_err());
    assert_eq!(f.failed_step, "write_movements");
    assert_eq!(f.cause, StepError::TimedOut(Duration::from_millis(50)));
    assert!(f.rollback.is_complete());

    assert_untouched(&store, &engine, order.order_id).await;
}

#[tokio::test]
async fn failed_compensation_is_reported_as_partial_rollback() {
    let (store, sink, engine) = setup(EngineSettings::default());
    let order = store.create_order(Amount::new(1_000_000), t0());
    store.fail_next(FaultOp::InsertMovements, 1);
    store.fail_next(FaultOp::DeleteInstallment, 1);

    let err = engine.submit_installment(delivery(order.order_id)).await.unwrap_err();
    assert_eq!(err.outcome_code(), "step_failed_partial_rollback");
    assert_eq!(err.severity(), Severity::Critical);
    assert!(err.to_string().contains("PARTIAL ROLLBACK"));

    let f = step_failure(err);
    match &f.rollback {
        Rollback::PartialRollback { compensated, failed } => {
            assert_eq!(compensated, &vec!["adjust_stock", "register_fingerprint"]);
            assert_eq!(failed.len(), 1);
            assert_eq!(failed[0].step, "insert_ledger_entry");
        }
        other => panic!("expected partial rollback, got {other:?}"),
    }

    // Later compensations still ran; the orphaned entry is left for an operator.
    assert_eq!(store.stock("SKU-A"), 100);
    assert_eq!(store.installments_of(order.order_id).len(), 1);

    let outcomes = sink.outcomes();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].severity, Severity::Critical);
    assert_eq!(outcomes[0].order_id, Some(order.order_id));
}

#[tokio::test]
async fn stock_that_cannot_be_undone_makes_the_rollback_partial() {
    let (store, _sink, engine) = setup(EngineSettings::default());
    let order = store.create_order(Amount::new(1_000_000), t0());
    // SKU-A applied, SKU-B fails, undo of SKU-A fails too.
    store.fail_after(FaultOp::AdjustStock, 1, 2);

    let err = engine.submit_installment(delivery(order.order_id)).await.unwrap_err();
    assert_eq!(err.outcome_code(), "step_failed_partial_rollback");
    let f = step_failure(err);
    assert_eq!(f.trace.last(), Some(&SagaState::PartialRollback));
    assert_eq!(store.stock("SKU-A"), 90);
    assert!(store.installments_of(order.order_id).is_empty());
}

fn short_timeout() -> EngineSettings {
    let mut settings = EngineSettings::default();
    settings.saga.step_timeout = Duration::from_millis(50);
    settings
}

#[tokio::test]
async fn ledger_entry_committed_before_a_timeout_is_removed() {
    let (store, _sink, engine) = setup(short_timeout());
    let order = store.create_order(Amount::new(1_000_000), t0());
    // The insert lands, then the store answers too late.
    store.linger_after(FaultOp::InsertInstallment, Duration::from_millis(500));

    let f = step_failure(engine.submit_installment(delivery(order.order_id)).await.unwrap_err());
    assert_eq!(f.failed_step, "insert_ledger_entry");
    assert_eq!(f.cause, StepError::TimedOut(Duration::from_millis(50)));
    assert!(f.rollback.is_complete());
    assert_eq!(
        f.trace[f.trace.len() - 4..],
        [
            SagaState::Failed(1),
            SagaState::Compensating(1),
            SagaState::Compensating(0),
            SagaState::RolledBack,
        ]
    );

    assert_untouched(&store, &engine, order.order_id).await;
}

#[tokio::test]
async fn movements_committed_before_a_timeout_are_removed() {
    let (store, _sink, engine) = setup(short_timeout());
    let order = store.create_order(Amount::new(1_000_000), t0());
    store.linger_after(FaultOp::InsertMovements, Duration::from_millis(500));

    let f = step_failure(engine.submit_installment(delivery(order.order_id)).await.unwrap_err());
    assert_eq!(f.failed_step, "write_movements");
    assert!(f.rollback.is_complete());

    assert_untouched(&store, &engine, order.order_id).await;
}

#[tokio::test]
async fn stock_adjustment_cut_off_by_a_timeout_is_a_partial_rollback() {
    let (store, _sink, engine) = setup(short_timeout());
    let order = store.create_order(Amount::new(1_000_000), t0());
    // SKU-A is adjusted, then the store stalls past the timeout.
    store.linger_after(FaultOp::AdjustStock, Duration::from_millis(500));

    let err = engine.submit_installment(delivery(order.order_id)).await.unwrap_err();
    assert_eq!(err.severity(), Severity::Critical);
    let f = step_failure(err);
    assert_eq!(f.failed_step, "adjust_stock");
    match &f.rollback {
        Rollback::PartialRollback { compensated, failed } => {
            assert_eq!(compensated, &vec!["insert_ledger_entry", "register_fingerprint"]);
            assert_eq!(failed.len(), 1);
            assert_eq!(failed[0].step, "adjust_stock");
            assert!(failed[0].cause.to_string().contains("SKU-A:-10"));
        }
        other => panic!("expected partial rollback, got {other:?}"),
    }
    // The ledger entry is gone; the stock change is left for an operator.
    assert!(store.installments_of(order.order_id).is_empty());
    assert_eq!(store.stock("SKU-A"), 90);
}
