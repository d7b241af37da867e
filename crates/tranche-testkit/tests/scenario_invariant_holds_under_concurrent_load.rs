//! Scenario: confirmed installments never exceed the order total, no matter
//! how many callers race on the same orders.
//!
//! The engine serializes per order and re-checks the remaining amount inside
//! the saga; these tests hammer it from a multi-threaded runtime and then
//! check the ledger from the outside.

use std::sync::Arc;

use tranche_config::EngineSettings;
use tranche_engine::{EngineError, OrderScope};
use tranche_money::Amount;
use tranche_schemas::{InstallmentStatus, OrderId};
use tranche_testkit::{request, TestLedger};

fn valid_sum(ledger: &TestLedger, order_id: OrderId) -> i64 {
    ledger
        .store
        .installments_of(order_id)
        .iter()
        .filter(|i| i.status.is_valid())
        .map(|i| i.amount.raw())
        .sum()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_submits_on_several_orders_never_over_allocate() {
    let ledger = Arc::new(TestLedger::new(EngineSettings::default()));
    let orders = [
        ledger.order(1_000_000),
        ledger.order(500_000),
        ledger.order(750_000),
    ];

    let mut handles = Vec::new();
    for (o, order_id) in orders.iter().enumerate() {
        for i in 0..25i64 {
            let ledger = Arc::clone(&ledger);
            let order_id = *order_id;
            let amount = 30_000 + (i * 7_919 + o as i64 * 1_013) % 20_000;
            handles.push(tokio::spawn(async move {
                ledger
                    .engine
                    .submit_installment(request(order_id, amount, &format!("buyer-{i}"), "s1"))
                    .await
            }));
        }
    }

    let mut accepted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(EngineError::ExceedsRemaining { .. }) => {}
            Err(other) => panic!("unexpected refusal: {other}"),
        }
    }
    assert!(accepted > 0);

    for order_id in orders {
        let total = ledger.store.order(order_id).unwrap().total_amount.raw();
        assert!(valid_sum(&ledger, order_id) <= total);

        // Dense 1..N in acceptance order.
        let seqs: Vec<i32> = ledger
            .store
            .installments_of(order_id)
            .iter()
            .map(|i| i.sequence_no)
            .collect();
        let expected: Vec<i32> = (1..=seqs.len() as i32).collect();
        assert_eq!(seqs, expected);

        for inst in ledger.store.installments_of(order_id) {
            ledger.engine.confirm_installment(inst.installment_id).await.unwrap();
        }
        ledger.assert_invariant(order_id);
    }

    let report = ledger.engine.run_repair_scan(OrderScope::All).await.unwrap();
    assert_eq!(report.orders_scanned, 3);
    assert!(report.is_clean(), "unexpected issues: {:?}", report.issues);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_confirms_stop_at_the_order_total_when_drafts_reserve_nothing() {
    let ledger = Arc::new(
        TestLedger::from_yaml(&["allocation:\n  counting_policy: confirmed_only\n"]).unwrap(),
    );
    let order_id = ledger.order(1_000_000);

    // Drafts reserve nothing, so all ten fit at submit time.
    for i in 0..10 {
        ledger
            .engine
            .submit_installment(request(order_id, 200_000, &format!("buyer-{i}"), "s1"))
            .await
            .unwrap();
    }
    assert_eq!(valid_sum(&ledger, order_id), 2_000_000);

    let mut handles = Vec::new();
    for inst in ledger.store.installments_of(order_id) {
        let ledger = Arc::clone(&ledger);
        handles.push(tokio::spawn(async move {
            ledger.engine.confirm_installment(inst.installment_id).await
        }));
    }

    let mut confirmed = 0;
    let mut refused = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => confirmed += 1,
            Err(EngineError::AmountIntegrity { .. }) => refused += 1,
            Err(other) => panic!("unexpected refusal: {other}"),
        }
    }
    assert_eq!((confirmed, refused), (5, 5));

    ledger.assert_invariant(order_id);
    let confirmed_sum: Amount = ledger
        .store
        .installments_of(order_id)
        .iter()
        .filter(|i| i.status == InstallmentStatus::Confirmed)
        .map(|i| i.amount)
        .sum();
    assert_eq!(confirmed_sum, Amount::new(1_000_000));
}
