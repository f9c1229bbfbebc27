//! End-to-end protocol scenarios driven against the in-memory ledger
//! simulator.

use ambrosia::{
    database::Database,
    event::Publisher,
    ledger::{simulator::Simulator, Address, Error, RejectReason},
    order::{Order, OrderId, Status},
    secret::Secret,
    secret_hash::HashAlgorithm,
    swap::{Coordinator, ExecutionParams, NewOrder, RetryPolicy},
    Amount, Timestamp,
};
use std::{sync::Arc, time::Duration};

const TIMELOCK_A_MS: u64 = 3_600_000;
const TIMELOCK_B_MS: u64 = 1_800_000;
const SAFETY_MARGIN_MS: u64 = 300_000;

fn execution_params(partial_fills_allowed: bool, confirmations_b: u32) -> ExecutionParams {
    ExecutionParams {
        hash_algorithm: HashAlgorithm::Sha256,
        timelock_a_ms: TIMELOCK_A_MS,
        timelock_b_ms: TIMELOCK_B_MS,
        safety_margin_ms: SAFETY_MARGIN_MS,
        confirmations_a: 1,
        confirmations_b,
        partial_fills_allowed,
        retry: RetryPolicy {
            max_retries: 2,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
        },
        poll_interval: Duration::from_millis(10),
    }
}

struct Harness {
    _tmp_dir: tempfile::TempDir,
    db: Arc<Database>,
    alpha: Arc<Simulator>,
    beta: Arc<Simulator>,
    coordinator: Arc<Coordinator<Simulator, Simulator>>,
}

fn harness(params: ExecutionParams, beta: Simulator) -> Harness {
    let tmp_dir = tempfile::TempDir::new().unwrap();
    let db = Arc::new(Database::new(tmp_dir.path()).unwrap());
    let alpha = Arc::new(Simulator::new("alpha", Amount::from_base_units(10_000_000)));
    let beta = Arc::new(beta);

    let coordinator = Arc::new(Coordinator::new(
        Arc::clone(&db),
        Arc::clone(&alpha),
        Arc::clone(&beta),
        Arc::new(Publisher::new()),
        params,
    ));

    Harness {
        _tmp_dir: tmp_dir,
        db,
        alpha,
        beta,
        coordinator,
    }
}

fn new_order() -> NewOrder {
    NewOrder {
        token_a: "OBK".to_owned(),
        token_b: "MRD".to_owned(),
        amount_a: Amount::from_base_units(1_000_000),
        amount_b: Amount::from_base_units(10_000),
        counterparty_b: Address::new("counterparty-b"),
    }
}

async fn wait_until<F>(db: &Database, order_id: &OrderId, predicate: F) -> Order
where
    F: Fn(&Order) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(order) = db.get_order(order_id).unwrap() {
                if predicate(&order) {
                    return order;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("order did not reach the expected state in time")
}

#[tokio::test]
async fn happy_path_completes_with_both_escrows_drained() {
    let harness = harness(
        execution_params(false, 1),
        Simulator::new("beta", Amount::from_base_units(10_000_000)),
    );

    let order = harness.coordinator.create_order(new_order()).await.unwrap();
    let order_id = order.order_id;
    let secret = order.secret;

    let coordinator = Arc::clone(&harness.coordinator);
    let driver = tokio::spawn(async move { coordinator.drive(&order_id).await });

    let locked = wait_until(&harness.db, &order_id, |order| {
        order.status == Status::BothLocked
    })
    .await;
    let escrow_b = locked.side_b.escrow_id.clone().unwrap();

    harness.alpha.advance_time(60_000);
    harness.beta.advance_time(60_000);

    // The counterparty received the secret through the quoting channel
    // and claims the whole escrow in one go.
    harness
        .beta
        .counterparty_claim(
            &escrow_b,
            &Address::new("counterparty-b"),
            secret,
            Amount::from_base_units(10_000),
        )
        .unwrap();

    let finished = driver.await.unwrap().unwrap();

    assert_eq!(finished.status, Status::Completed);
    assert_eq!(finished.side_a.claimed, Amount::from_base_units(1_000_000));
    assert_eq!(finished.side_b.claimed, Amount::from_base_units(10_000));
    assert!(finished.side_a.deposit_tx.is_some());
    assert!(finished.side_b.deposit_tx.is_some());
    assert_eq!(finished.side_a.claim_txs.len(), 1);
    assert_eq!(finished.side_b.claim_txs.len(), 1);

    let escrow_a = finished.side_a.escrow_id.clone().unwrap();
    assert_eq!(
        harness.alpha.escrow_remaining(&escrow_a),
        Some(Amount::ZERO)
    );
    assert_eq!(harness.beta.escrow_remaining(&escrow_b), Some(Amount::ZERO));

    let receipt = ambrosia::event::Receipt::from_order(&finished, Timestamp::from_millis(90_000));
    assert_eq!(receipt.revealed_preimage, Some(secret));

    let report = ambrosia::verify::verify_order(
        &harness.db,
        Arc::clone(&harness.alpha),
        Arc::clone(&harness.beta),
        &order_id,
    )
    .await
    .unwrap();
    assert!(report.all_ok());
}

#[tokio::test]
async fn absent_counterparty_leads_to_refunds_on_both_sides() {
    let harness = harness(
        execution_params(false, 1),
        Simulator::new("beta", Amount::from_base_units(10_000_000)),
    );

    let order = harness.coordinator.create_order(new_order()).await.unwrap();
    let order_id = order.order_id;

    let coordinator = Arc::clone(&harness.coordinator);
    let driver = tokio::spawn(async move { coordinator.drive(&order_id).await });

    wait_until(&harness.db, &order_id, |order| {
        order.status == Status::BothLocked
    })
    .await;

    // Nobody ever claims; both timelocks lapse.
    harness.beta.set_time(Timestamp::from_millis(TIMELOCK_B_MS + 1));
    harness.alpha.set_time(Timestamp::from_millis(TIMELOCK_A_MS + 1));

    let finished = driver.await.unwrap().unwrap();

    assert_eq!(finished.status, Status::Refunded);
    assert!(finished.side_a.refund_tx.is_some());
    assert!(finished.side_b.refund_tx.is_some());
    // The claim window closed without a reveal; no claim was ever
    // attempted against escrow A.
    assert!(finished.side_a.claim_txs.is_empty());

    use ambrosia::ledger::Adapter;
    assert_eq!(
        harness.alpha.balance().await.unwrap(),
        Amount::from_base_units(10_000_000)
    );
    assert_eq!(
        harness.beta.balance().await.unwrap(),
        Amount::from_base_units(10_000_000)
    );
}

#[tokio::test]
async fn partial_fills_mirror_counterparty_claims_proportionally() {
    let harness = harness(
        execution_params(true, 1),
        Simulator::new("beta", Amount::from_base_units(10_000_000)),
    );

    let order = harness.coordinator.create_order(new_order()).await.unwrap();
    let order_id = order.order_id;
    let secret = order.secret;

    let coordinator = Arc::clone(&harness.coordinator);
    let driver = tokio::spawn(async move { coordinator.drive(&order_id).await });

    let locked = wait_until(&harness.db, &order_id, |order| {
        order.status == Status::BothLocked
    })
    .await;
    let escrow_b = locked.side_b.escrow_id.clone().unwrap();
    let counterparty = Address::new("counterparty-b");

    harness
        .beta
        .counterparty_claim(
            &escrow_b,
            &counterparty,
            secret,
            Amount::from_base_units(4_000),
        )
        .unwrap();

    // Let the coordinator observe the first fill before the second one
    // lands.
    wait_until(&harness.db, &order_id, |order| {
        order.side_b.claimed == Amount::from_base_units(4_000)
    })
    .await;

    harness
        .beta
        .counterparty_claim(
            &escrow_b,
            &counterparty,
            secret,
            Amount::from_base_units(6_000),
        )
        .unwrap();

    let finished = driver.await.unwrap().unwrap();

    assert_eq!(finished.status, Status::Completed);
    assert_eq!(finished.side_b.claimed, Amount::from_base_units(10_000));
    assert_eq!(finished.side_b.claim_txs.len(), 2);
    assert_eq!(finished.side_a.claimed, Amount::from_base_units(1_000_000));
    assert_eq!(finished.side_a.claim_txs.len(), 2);
    assert_eq!(harness.beta.escrow_remaining(&escrow_b), Some(Amount::ZERO));

    let escrow_a = finished.side_a.escrow_id.unwrap();
    assert_eq!(
        harness.alpha.escrow_remaining(&escrow_a),
        Some(Amount::ZERO)
    );
}

#[tokio::test]
async fn wrong_secret_is_rejected_on_chain_and_the_order_refunds() {
    let harness = harness(
        execution_params(false, 1),
        Simulator::new("beta", Amount::from_base_units(10_000_000)),
    );

    let order = harness.coordinator.create_order(new_order()).await.unwrap();
    let order_id = order.order_id;

    let coordinator = Arc::clone(&harness.coordinator);
    let driver = tokio::spawn(async move { coordinator.drive(&order_id).await });

    let locked = wait_until(&harness.db, &order_id, |order| {
        order.status == Status::BothLocked
    })
    .await;
    let escrow_b = locked.side_b.escrow_id.clone().unwrap();

    let result = harness.beta.counterparty_claim(
        &escrow_b,
        &Address::new("counterparty-b"),
        Secret::random(),
        Amount::from_base_units(10_000),
    );
    assert_eq!(
        result.unwrap_err(),
        Error::ContractReject(RejectReason::BadSecret)
    );

    harness.beta.set_time(Timestamp::from_millis(TIMELOCK_B_MS + 1));
    harness.alpha.set_time(Timestamp::from_millis(TIMELOCK_A_MS + 1));

    let finished = driver.await.unwrap().unwrap();

    assert_eq!(finished.status, Status::Refunded);
    assert!(finished.side_a.claim_txs.is_empty());
    assert_eq!(
        harness.beta.escrow_remaining(&escrow_b),
        Some(Amount::ZERO)
    );
}

#[tokio::test]
async fn unconfirmed_claim_is_not_acted_upon_and_a_reorg_leads_to_refund() {
    // Claims on ledger B start out with a single confirmation; the
    // coordinator demands three before acting.
    let harness = harness(
        execution_params(false, 3),
        Simulator::with_confirmations("beta", Amount::from_base_units(10_000_000), 1),
    );

    let order = harness.coordinator.create_order(new_order()).await.unwrap();
    let order_id = order.order_id;
    let secret = order.secret;

    let coordinator = Arc::clone(&harness.coordinator);
    let driver = tokio::spawn(async move { coordinator.drive(&order_id).await });

    let locked = wait_until(&harness.db, &order_id, |order| {
        order.status == Status::BothLocked
    })
    .await;
    let escrow_b = locked.side_b.escrow_id.clone().unwrap();

    let claim_tx = harness
        .beta
        .counterparty_claim(
            &escrow_b,
            &Address::new("counterparty-b"),
            secret,
            Amount::from_base_units(10_000),
        )
        .unwrap();

    // Give the coordinator ample polls; with only one confirmation the
    // claim must not trigger anything on ledger A.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let pending = harness.db.get_order(&order_id).unwrap().unwrap();
    assert_eq!(pending.status, Status::BothLocked);
    assert!(pending.side_a.claim_txs.is_empty());
    assert!(pending.side_b.claim_txs.is_empty());

    // The chain reorganizes and the claim disappears for good.
    harness.beta.reorg_out_claim(&escrow_b, &claim_tx);

    harness.beta.set_time(Timestamp::from_millis(TIMELOCK_B_MS + 1));
    harness.alpha.set_time(Timestamp::from_millis(TIMELOCK_A_MS + 1));

    let finished = driver.await.unwrap().unwrap();

    assert_eq!(finished.status, Status::Refunded);
    assert!(finished.side_a.claim_txs.is_empty());
    assert!(finished.side_a.refund_tx.is_some());
    assert!(finished.side_b.refund_tx.is_some());
}

#[tokio::test]
async fn crash_between_lock_phases_resumes_without_double_deposits() {
    let params = execution_params(false, 1);
    let harness = harness(
        params.clone(),
        Simulator::new("beta", Amount::from_base_units(10_000_000)),
    );

    // Exhaust the retry budget on the ledger-B deposit to simulate a
    // crash after A_LOCKED was persisted.
    for _ in 0..4 {
        harness
            .beta
            .inject_error("deposit", Error::Transient("mempool congested".to_owned()));
    }

    let order = harness.coordinator.create_order(new_order()).await.unwrap();
    let order_id = order.order_id;
    let secret = order.secret;

    let stopped = harness.coordinator.drive(&order_id).await;
    assert!(stopped.is_err());

    let stranded = harness.db.get_order(&order_id).unwrap().unwrap();
    assert_eq!(stranded.status, Status::ALocked);
    assert!(stranded.side_b.deposit_nonce.is_some());
    assert_eq!(harness.alpha.deposit_submissions(), 1);
    assert_eq!(harness.beta.deposit_submissions(), 0);

    // Restart: a fresh coordinator against the same store and ledgers.
    let restarted = Arc::new(Coordinator::new(
        Arc::clone(&harness.db),
        Arc::clone(&harness.alpha),
        Arc::clone(&harness.beta),
        Arc::new(Publisher::new()),
        params,
    ));

    let driver = {
        let restarted = Arc::clone(&restarted);
        tokio::spawn(async move { restarted.drive(&order_id).await })
    };

    let locked = wait_until(&harness.db, &order_id, |order| {
        order.status == Status::BothLocked
    })
    .await;
    let escrow_b = locked.side_b.escrow_id.clone().unwrap();

    harness
        .beta
        .counterparty_claim(
            &escrow_b,
            &Address::new("counterparty-b"),
            secret,
            Amount::from_base_units(10_000),
        )
        .unwrap();

    let finished = driver.await.unwrap().unwrap();

    assert_eq!(finished.status, Status::Completed);
    // Exactly one deposit landed on each ledger across both runs.
    assert_eq!(harness.alpha.deposit_submissions(), 1);
    assert_eq!(harness.beta.deposit_submissions(), 1);
}

#[tokio::test]
async fn driving_a_terminal_order_again_is_a_no_op() {
    let harness = harness(
        execution_params(false, 1),
        Simulator::new("beta", Amount::from_base_units(10_000_000)),
    );

    let order = harness.coordinator.create_order(new_order()).await.unwrap();
    let order_id = order.order_id;
    let secret = order.secret;

    let coordinator = Arc::clone(&harness.coordinator);
    let driver = tokio::spawn(async move { coordinator.drive(&order_id).await });

    let locked = wait_until(&harness.db, &order_id, |order| {
        order.status == Status::BothLocked
    })
    .await;
    let escrow_b = locked.side_b.escrow_id.clone().unwrap();

    harness
        .beta
        .counterparty_claim(
            &escrow_b,
            &Address::new("counterparty-b"),
            secret,
            Amount::from_base_units(10_000),
        )
        .unwrap();

    let finished = driver.await.unwrap().unwrap();
    assert_eq!(finished.status, Status::Completed);

    let replayed = harness.coordinator.drive(&order_id).await.unwrap();

    assert_eq!(replayed, finished);
    assert_eq!(harness.alpha.deposit_submissions(), 1);
    assert_eq!(harness.beta.deposit_submissions(), 1);
}

#[tokio::test]
async fn cancellation_is_only_possible_before_the_first_lock() {
    let harness = harness(
        execution_params(false, 1),
        Simulator::new("beta", Amount::from_base_units(10_000_000)),
    );

    let order = harness.coordinator.create_order(new_order()).await.unwrap();

    let cancelled = harness.coordinator.cancel(&order.order_id).await.unwrap();
    assert_eq!(cancelled.status, Status::Failed);
    assert_eq!(
        cancelled.failure_reason.as_deref(),
        Some("cancelled-by-operator")
    );

    // A terminal order cannot be cancelled again.
    assert!(harness.coordinator.cancel(&order.order_id).await.is_err());
}
