//! Drive an order through the two-escrow secret-reveal protocol.
//!
//! One driver task per order; steps within an order are totally ordered
//! and every in-memory mutation is persisted before the task yields at a
//! ledger call. Recovery after a restart is the same code path: each
//! step first checks the stored record and skips work that already
//! happened, and every write carries a nonce derived from the order id
//! and the step name so a resubmission deduplicates on the ledger side.

use crate::{
    amount::Amount,
    database::Database,
    event::{Event, Kind, Publisher},
    ledger::{self, Adapter, Address, DepositParams, MonotonicTime, Nonce},
    order::{Order, OrderId, Side, Status},
    secret::Secret,
    secret_hash::HashAlgorithm,
    timestamp::Timestamp,
};
use anyhow::{anyhow, Context, Result};
use std::{future::Future, sync::Arc, time::Duration};

/// A claim of ledger-A funds is attempted with the preimage recovered
/// from ledger B; the on-chain verifier rejecting it afterwards means
/// the two escrows were never bound to the same hash. Never retried;
/// the record is frozen for audit.
#[derive(Clone, Debug, thiserror::Error)]
#[error("fatal inconsistency on order {order_id}: {reason}")]
pub struct FatalInconsistency {
    pub order_id: OrderId,
    pub reason: String,
}

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    fn next_backoff(&self, current: Duration) -> Duration {
        std::cmp::min(current * 2, self.max_backoff)
    }
}

/// Everything the coordinator needs besides the two adapters.
#[derive(Clone, Debug)]
pub struct ExecutionParams {
    pub hash_algorithm: HashAlgorithm,
    pub timelock_a_ms: u64,
    pub timelock_b_ms: u64,
    pub safety_margin_ms: u64,
    pub confirmations_a: u32,
    pub confirmations_b: u32,
    pub partial_fills_allowed: bool,
    pub retry: RetryPolicy,
    pub poll_interval: Duration,
}

#[derive(Clone, Debug)]
pub struct NewOrder {
    pub token_a: String,
    pub token_b: String,
    pub amount_a: Amount,
    pub amount_b: Amount,
    pub counterparty_b: Address,
}

pub struct Coordinator<A, B> {
    db: Arc<Database>,
    alpha: Arc<A>,
    beta: Arc<B>,
    publisher: Arc<Publisher>,
    params: ExecutionParams,
    alpha_clock: MonotonicTime,
    beta_clock: MonotonicTime,
}

impl<A, B> Coordinator<A, B>
where
    A: Adapter,
    B: Adapter,
{
    pub fn new(
        db: Arc<Database>,
        alpha: Arc<A>,
        beta: Arc<B>,
        publisher: Arc<Publisher>,
        params: ExecutionParams,
    ) -> Self {
        Coordinator {
            db,
            alpha,
            beta,
            publisher,
            params,
            alpha_clock: MonotonicTime::new(),
            beta_clock: MonotonicTime::new(),
        }
    }

    pub fn publisher(&self) -> Arc<Publisher> {
        Arc::clone(&self.publisher)
    }

    /// Create and persist a new order. The secret and its hash are fixed
    /// here, before any deposit is constructed, and threaded identically
    /// through both escrows.
    pub async fn create_order(&self, new: NewOrder) -> Result<Order> {
        if new.amount_a.is_zero() || new.amount_b.is_zero() {
            anyhow::bail!("swap amounts must not be zero");
        }
        if self.params.timelock_b_ms + self.params.safety_margin_ms > self.params.timelock_a_ms {
            anyhow::bail!(
                "timelock ordering violated: {}ms + {}ms margin exceeds {}ms",
                self.params.timelock_b_ms,
                self.params.safety_margin_ms,
                self.params.timelock_a_ms
            );
        }

        let secret = Secret::random();
        let secret_hash = self.params.hash_algorithm.hash_of(&secret);

        let alpha_now = self.alpha_now().await?;
        let beta_now = self.beta_now().await?;

        let our_address_a = self
            .alpha
            .address()
            .await
            .context("failed to fetch our ledger-A address")?;
        let our_address_b = self
            .beta
            .address()
            .await
            .context("failed to fetch our ledger-B address")?;

        let timelock_a = alpha_now.plus(self.params.timelock_a_ms);
        let timelock_b = beta_now.plus(self.params.timelock_b_ms);

        let order = Order {
            order_id: OrderId::random(),
            secret,
            secret_hash,
            hash_algorithm: self.params.hash_algorithm,
            partial_fills_allowed: self.params.partial_fills_allowed,
            side_a: Side {
                ledger: self.alpha.name().to_owned(),
                initiator: our_address_a.clone(),
                redeemer: our_address_a,
                token: new.token_a,
                amount: new.amount_a,
                timelock: timelock_a,
                escrow_id: None,
                deposit_nonce: None,
                deposit_tx: None,
                claim_txs: Vec::new(),
                claimed: Amount::ZERO,
                refund_tx: None,
            },
            side_b: Side {
                ledger: self.beta.name().to_owned(),
                initiator: our_address_b,
                redeemer: new.counterparty_b,
                token: new.token_b,
                amount: new.amount_b,
                timelock: timelock_b,
                escrow_id: None,
                deposit_nonce: None,
                deposit_tx: None,
                claim_txs: Vec::new(),
                claimed: Amount::ZERO,
                refund_tx: None,
            },
            created_at: alpha_now,
            expires_at: timelock_a.plus(self.params.safety_margin_ms),
            status: Status::Created,
            failure_reason: None,
        };

        self.db.insert_order(order.clone()).await?;
        self.emit(&order, alpha_now, Kind::Created { secret_hash }, 0);

        tracing::info!(order_id = %order.order_id, "created order");

        Ok(order)
    }

    /// Abort an order that has not locked anything yet.
    pub async fn cancel(&self, order_id: &OrderId) -> Result<Order> {
        let mut order = self.load(order_id)?;

        if order.status != Status::Created {
            anyhow::bail!(
                "order {} is already past the point of cancellation ({})",
                order_id,
                order.status
            );
        }

        self.fail(&mut order, "cancelled-by-operator").await?;

        Ok(order)
    }

    /// Operator-forced refund: stop waiting for the counterparty and
    /// enter the refund path. The timelocks themselves are still
    /// honoured by the refund loop.
    pub async fn force_refund(&self, order_id: &OrderId) -> Result<Order> {
        let mut order = self.load(order_id)?;

        match order.status {
            Status::ALocked | Status::BothLocked | Status::BClaimed => {
                order.transition(Status::RefundPending)?;
                self.db.update_order(&order).await?;
                self.drive(order_id).await
            }
            Status::RefundPending => self.drive(order_id).await,
            other => anyhow::bail!("order {} cannot be refunded from {}", order_id, other),
        }
    }

    /// Drive an order until it reaches a terminal status. Safe to call
    /// again after a crash or an error; completed steps are skipped.
    pub async fn drive(&self, order_id: &OrderId) -> Result<Order> {
        loop {
            let mut order = self.load(order_id)?;

            match order.status {
                Status::Created => {
                    let alpha_now = self.alpha_now().await?;
                    if alpha_now > order.expires_at {
                        order.transition(Status::Expired)?;
                        self.db.update_order(&order).await?;
                        self.emit(&order, alpha_now, Kind::Expired, 0);
                        continue;
                    }

                    self.lock_alpha(&mut order).await?;
                }
                Status::ALocked => {
                    self.ensure_alpha_funded(&mut order).await?;
                    self.lock_beta(&mut order).await?;
                }
                Status::BothLocked => {
                    self.watch_counterparty(&mut order).await?;
                }
                Status::BClaimed => {
                    self.reconcile_alpha_claims(&mut order).await?;

                    if order.side_a.is_fully_claimed() {
                        order.transition(Status::AClaimed)?;
                        self.db.update_order(&order).await?;
                    }
                }
                Status::AClaimed => {
                    self.finalize(&mut order).await?;
                }
                Status::RefundPending => {
                    self.run_refunds(&mut order).await?;
                }
                _ => return Ok(order),
            }
        }
    }

    async fn lock_alpha(&self, order: &mut Order) -> Result<()> {
        let nonce = self.deposit_nonce(order, true).await?;
        let deposited = match self.execute_deposit(order, true, nonce).await {
            Ok(deposited) => deposited,
            Err(e) => return self.handle_ledger_error(order, e, "deposit_a").await,
        };

        tracing::info!(
            order_id = %order.order_id,
            tx = %deposited.tx_id,
            "locked escrow on ledger A"
        );

        order.side_a.escrow_id = Some(deposited.escrow_id.clone());
        order.side_a.deposit_tx = Some(deposited.tx_id.clone());
        order.transition(Status::ALocked)?;
        self.db.update_order(order).await?;

        self.emit(
            order,
            deposited.included_at,
            Kind::DepositedA {
                escrow_id: deposited.escrow_id,
                tx_id: deposited.tx_id,
            },
            0,
        );

        Ok(())
    }

    /// A restart may find the record claiming a lock the ledger has
    /// since lost (or never saw). Re-query and re-issue the very same
    /// deposit if necessary.
    async fn ensure_alpha_funded(&self, order: &mut Order) -> Result<()> {
        let escrow_id = match &order.side_a.escrow_id {
            Some(escrow_id) => escrow_id.clone(),
            None => return Ok(()),
        };

        match self.alpha.observe(&escrow_id).await {
            Ok(snapshot) => {
                if snapshot.secret_hash != order.secret_hash {
                    self.fail(order, "fatal-inconsistency").await?;
                    return Err(FatalInconsistency {
                        order_id: order.order_id,
                        reason: "recorded ledger-A escrow is bound to a different secret hash"
                            .to_owned(),
                    }
                    .into());
                }

                Ok(())
            }
            Err(ledger::Error::ContractReject(ledger::RejectReason::UnknownEscrow)) => {
                tracing::warn!(
                    order_id = %order.order_id,
                    "recorded ledger-A escrow is unknown to the ledger, re-issuing the deposit"
                );

                let nonce = self.deposit_nonce(order, true).await?;
                let deposited = match self.execute_deposit(order, true, nonce).await {
                    Ok(deposited) => deposited,
                    Err(e) => return self.handle_ledger_error(order, e, "deposit_a").await,
                };

                order.side_a.escrow_id = Some(deposited.escrow_id);
                order.side_a.deposit_tx = Some(deposited.tx_id);
                self.db.update_order(order).await?;

                Ok(())
            }
            Err(e) => self.handle_ledger_error(order, e, "observe_a").await,
        }
    }

    async fn lock_beta(&self, order: &mut Order) -> Result<()> {
        if order.side_b.is_locked() {
            order.transition(Status::BothLocked)?;
            self.db.update_order(order).await?;
            return Ok(());
        }

        let nonce = self.deposit_nonce(order, false).await?;
        let deposited = match self.execute_deposit(order, false, nonce).await {
            Ok(deposited) => deposited,
            Err(e) => return self.handle_ledger_error(order, e, "deposit_b").await,
        };

        tracing::info!(
            order_id = %order.order_id,
            tx = %deposited.tx_id,
            "locked escrow on ledger B"
        );

        order.side_b.escrow_id = Some(deposited.escrow_id.clone());
        order.side_b.deposit_tx = Some(deposited.tx_id.clone());
        order.transition(Status::BothLocked)?;
        self.db.update_order(order).await?;

        self.emit(
            order,
            deposited.included_at,
            Kind::DepositedB {
                escrow_id: deposited.escrow_id,
                tx_id: deposited.tx_id,
            },
            0,
        );

        Ok(())
    }

    async fn execute_deposit(
        &self,
        order: &Order,
        alpha_side: bool,
        nonce: Nonce,
    ) -> Result<ledger::Deposited, ledger::Error> {
        let side = if alpha_side {
            &order.side_a
        } else {
            &order.side_b
        };
        let params = DepositParams {
            redeemer: side.redeemer.clone(),
            token: side.token.clone(),
            amount: side.amount,
            timelock: side.timelock,
            secret_hash: order.secret_hash,
            hash_algorithm: order.hash_algorithm,
            partial_fills_allowed: order.partial_fills_allowed,
        };

        if alpha_side {
            let alpha = Arc::clone(&self.alpha);
            self.with_retries("deposit_a", move || {
                let alpha = Arc::clone(&alpha);
                let params = params.clone();
                async move { alpha.deposit(params, nonce).await }
            })
            .await
        } else {
            let beta = Arc::clone(&self.beta);
            self.with_retries("deposit_b", move || {
                let beta = Arc::clone(&beta);
                let params = params.clone();
                async move { beta.deposit(params, nonce).await }
            })
            .await
        }
    }

    /// Watch ledger B for the counterparty's claims until the escrow is
    /// drained or the counterparty window closes.
    ///
    /// A claim event is only acted upon once its confirmations reach the
    /// configured threshold; an event reorged out before that is never
    /// acted upon at all.
    async fn watch_counterparty(&self, order: &mut Order) -> Result<()> {
        let escrow_b = order
            .side_b
            .escrow_id
            .clone()
            .ok_or_else(|| anyhow!("order {} has no ledger-B escrow", order.order_id))?;

        loop {
            let beta_now = match self.beta_now().await {
                Ok(now) => now,
                Err(e) => return self.handle_ledger_error(order, e, "ledger_time_b").await,
            };

            let claim_deadline = order.side_b.timelock.minus(self.params.safety_margin_ms);
            if beta_now > claim_deadline {
                tracing::warn!(
                    order_id = %order.order_id,
                    "counterparty window closed, entering the refund path"
                );

                order.transition(Status::RefundPending)?;
                self.db.update_order(order).await?;
                return Ok(());
            }

            let snapshot = match self.observe_beta(&escrow_b).await {
                Ok(snapshot) => snapshot,
                Err(e) => return self.handle_ledger_error(order, e, "observe_b").await,
            };

            let confirmed_new: Vec<_> = snapshot
                .claims
                .iter()
                .filter(|claim| claim.confirmations >= self.params.confirmations_b)
                .filter(|claim| !order.side_b.claim_txs.contains(&claim.tx_id))
                .cloned()
                .collect();

            for claim in confirmed_new {
                if !self
                    .params
                    .hash_algorithm
                    .verify(&claim.revealed_preimage, &order.secret_hash)
                {
                    self.fail(order, "fatal-inconsistency").await?;
                    return Err(FatalInconsistency {
                        order_id: order.order_id,
                        reason: "observed a claim event whose preimage does not match the order"
                            .to_owned(),
                    }
                    .into());
                }

                tracing::info!(
                    order_id = %order.order_id,
                    tx = %claim.tx_id,
                    amount = %claim.amount,
                    "counterparty claimed on ledger B, preimage is now public"
                );

                order.side_b.claimed = order
                    .side_b
                    .claimed
                    .checked_add(claim.amount)
                    .ok_or_else(|| anyhow!("claims against escrow B overflow its deposit"))?;
                order.side_b.claim_txs.push(claim.tx_id.clone());
                self.db.update_order(order).await?;

                let occurrence = order.side_b.claim_txs.len() as u64 - 1;
                self.emit(
                    order,
                    claim.at,
                    Kind::CounterpartyClaimed {
                        tx_id: claim.tx_id,
                        amount: claim.amount,
                    },
                    occurrence,
                );

                self.reconcile_alpha_claims_with(order, claim.revealed_preimage)
                    .await?;

                if order.status != Status::BothLocked {
                    return Ok(());
                }
            }

            // Judge completion by the claims we recorded as confirmed,
            // not by the snapshot's remaining balance: an unconfirmed
            // claim already lowers the latter but may still reorg away.
            if order.side_b.is_fully_claimed() {
                order.transition(Status::BClaimed)?;
                self.db.update_order(order).await?;
                return Ok(());
            }

            tokio::time::sleep(self.params.poll_interval).await;
        }
    }

    /// Re-derive the preimage from the recorded ledger-B events and
    /// claim the outstanding ledger-A share.
    async fn reconcile_alpha_claims(&self, order: &mut Order) -> Result<()> {
        let escrow_b = order
            .side_b
            .escrow_id
            .clone()
            .ok_or_else(|| anyhow!("order {} has no ledger-B escrow", order.order_id))?;

        let snapshot = match self.observe_beta(&escrow_b).await {
            Ok(snapshot) => snapshot,
            Err(e) => return self.handle_ledger_error(order, e, "observe_b").await,
        };

        let revealed = snapshot
            .claims
            .iter()
            .find(|claim| {
                self.params
                    .hash_algorithm
                    .verify(&claim.revealed_preimage, &order.secret_hash)
            })
            .map(|claim| claim.revealed_preimage)
            .ok_or_else(|| anyhow!("no valid preimage revealed on ledger B"))?;

        self.reconcile_alpha_claims_with(order, revealed).await
    }

    async fn reconcile_alpha_claims_with(&self, order: &mut Order, revealed: Secret) -> Result<()> {
        let target = if order.side_b.is_fully_claimed() {
            order.side_a.amount
        } else if order.partial_fills_allowed {
            // Mirror the counterparty's fills proportionally; the final
            // claim takes whatever rounding left behind.
            order
                .side_b
                .claimed
                .proportion(order.side_a.amount, order.side_b.amount)
                .ok_or_else(|| anyhow!("escrow B has a zero deposit"))?
        } else {
            Amount::ZERO
        };

        let shortfall = match target.checked_sub(order.side_a.claimed) {
            Some(shortfall) if !shortfall.is_zero() => shortfall,
            _ => return Ok(()),
        };

        let escrow_a = order
            .side_a
            .escrow_id
            .clone()
            .ok_or_else(|| anyhow!("order {} has no ledger-A escrow", order.order_id))?;

        let claim_index = order.side_a.claim_txs.len();
        let nonce = Nonce::derive(
            order.order_id.as_bytes(),
            &format!("claim_a/{}", claim_index),
        );

        let alpha = Arc::clone(&self.alpha);
        let claimed = match self
            .with_retries("claim_a", move || {
                let alpha = Arc::clone(&alpha);
                let escrow = escrow_a.clone();
                async move { alpha.claim(&escrow, revealed, shortfall, nonce).await }
            })
            .await
        {
            Ok(claimed) => claimed,
            Err(ledger::Error::ContractReject(ledger::RejectReason::BadSecret)) => {
                self.fail(order, "fatal-inconsistency").await?;
                return Err(FatalInconsistency {
                    order_id: order.order_id,
                    reason: "ledger A rejected the preimage revealed on ledger B".to_owned(),
                }
                .into());
            }
            Err(ledger::Error::ContractReject(ledger::RejectReason::Expired)) => {
                tracing::warn!(
                    order_id = %order.order_id,
                    "our claim window on ledger A closed, entering the refund path"
                );

                order.transition(Status::RefundPending)?;
                self.db.update_order(order).await?;
                return Ok(());
            }
            Err(e) => return self.handle_ledger_error(order, e, "claim_a").await,
        };

        tracing::info!(
            order_id = %order.order_id,
            tx = %claimed.tx_id,
            amount = %shortfall,
            "claimed on ledger A"
        );

        order.side_a.claimed = order
            .side_a
            .claimed
            .checked_add(shortfall)
            .ok_or_else(|| anyhow!("claims against escrow A overflow its deposit"))?;
        order.side_a.claim_txs.push(claimed.tx_id.clone());
        self.db.update_order(order).await?;

        self.emit(
            order,
            claimed.included_at,
            Kind::ClaimedA {
                tx_id: claimed.tx_id,
                amount: shortfall,
            },
            claim_index as u64,
        );

        Ok(())
    }

    /// The record says we claimed everything; confirm it against the
    /// ledger before declaring the order complete. A stale record after
    /// a crash is reconciled here.
    async fn finalize(&self, order: &mut Order) -> Result<()> {
        let escrow_a = order
            .side_a
            .escrow_id
            .clone()
            .ok_or_else(|| anyhow!("order {} has no ledger-A escrow", order.order_id))?;

        let alpha = Arc::clone(&self.alpha);
        let snapshot = match self
            .with_retries("observe_a", move || {
                let alpha = Arc::clone(&alpha);
                let escrow = escrow_a.clone();
                async move { alpha.observe(&escrow).await }
            })
            .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => return self.handle_ledger_error(order, e, "observe_a").await,
        };

        if snapshot.status != crate::escrow::Status::FullyClaimed {
            anyhow::bail!(
                "order {} is recorded as claimed but escrow A still holds {}",
                order.order_id,
                snapshot.remaining
            );
        }

        let all_claims_confirmed = order.side_a.claim_txs.iter().all(|tx_id| {
            snapshot
                .claims
                .iter()
                .any(|claim| &claim.tx_id == tx_id
                    && claim.confirmations >= self.params.confirmations_a)
        });
        if !all_claims_confirmed {
            tracing::debug!(
                order_id = %order.order_id,
                "waiting for our ledger-A claims to reach the confirmation threshold"
            );
            tokio::time::sleep(self.params.poll_interval).await;
            return Ok(());
        }

        let alpha_now = self.alpha_now().await?;

        order.transition(Status::Completed)?;
        self.db.update_order(order).await?;
        self.emit(order, alpha_now, Kind::Completed, 0);

        tracing::info!(order_id = %order.order_id, "swap completed");

        Ok(())
    }

    /// Refund whatever is refundable, independently per side, retrying
    /// without bound: past this point funds are at stake and the
    /// timelocks have already made claims illegal.
    async fn run_refunds(&self, order: &mut Order) -> Result<()> {
        loop {
            let mut waiting = false;

            if side_needs_refund(&order.side_a) {
                match self.try_refund_side(order, true).await? {
                    RefundOutcome::Done => {}
                    RefundOutcome::NotYet => waiting = true,
                }
            }

            if side_needs_refund(&order.side_b) {
                match self.try_refund_side(order, false).await? {
                    RefundOutcome::Done => {}
                    RefundOutcome::NotYet => waiting = true,
                }
            }

            if !side_needs_refund(&order.side_a) && !side_needs_refund(&order.side_b) && !waiting {
                order.transition(Status::Refunded)?;
                self.db.update_order(order).await?;

                tracing::info!(order_id = %order.order_id, "refund path finished");

                return Ok(());
            }

            tokio::time::sleep(self.params.poll_interval).await;
        }
    }

    async fn try_refund_side(&self, order: &mut Order, alpha_side: bool) -> Result<RefundOutcome> {
        let (now, timelock) = if alpha_side {
            (self.alpha_now().await, order.side_a.timelock)
        } else {
            (self.beta_now().await, order.side_b.timelock)
        };

        let now = match now {
            Ok(now) => now,
            Err(e) => {
                tracing::warn!(error = %e, "could not read ledger time, refund postponed");
                return Ok(RefundOutcome::NotYet);
            }
        };

        if now <= timelock {
            return Ok(RefundOutcome::NotYet);
        }

        let side = if alpha_side {
            &order.side_a
        } else {
            &order.side_b
        };
        let escrow_id = side
            .escrow_id
            .clone()
            .ok_or_else(|| anyhow!("refund requires a locked escrow"))?;
        let label = if alpha_side { "refund_a" } else { "refund_b" };
        let nonce = Nonce::derive(order.order_id.as_bytes(), label);

        let result = if alpha_side {
            let alpha = Arc::clone(&self.alpha);
            self.retry_unbounded(label, move || {
                let alpha = Arc::clone(&alpha);
                let escrow = escrow_id.clone();
                async move { alpha.refund(&escrow, nonce).await }
            })
            .await
        } else {
            let beta = Arc::clone(&self.beta);
            self.retry_unbounded(label, move || {
                let beta = Arc::clone(&beta);
                let escrow = escrow_id.clone();
                async move { beta.refund(&escrow, nonce).await }
            })
            .await
        };

        match result {
            Ok(refunded) => {
                tracing::info!(
                    order_id = %order.order_id,
                    tx = %refunded.tx_id,
                    amount = %refunded.amount,
                    "refunded escrow"
                );

                let side = if alpha_side {
                    &mut order.side_a
                } else {
                    &mut order.side_b
                };
                side.refund_tx = Some(refunded.tx_id.clone());
                self.db.update_order(order).await?;

                let kind = if alpha_side {
                    Kind::RefundedA {
                        tx_id: refunded.tx_id,
                        amount: refunded.amount,
                    }
                } else {
                    Kind::RefundedB {
                        tx_id: refunded.tx_id,
                        amount: refunded.amount,
                    }
                };
                self.emit(order, refunded.included_at, kind, 0);

                Ok(RefundOutcome::Done)
            }
            Err(ledger::Error::ContractReject(ledger::RejectReason::NothingToRefund)) => {
                // Fully claimed in the meantime; nothing left for us.
                let side = if alpha_side {
                    &mut order.side_a
                } else {
                    &mut order.side_b
                };
                side.claimed = side.amount;
                self.db.update_order(order).await?;

                Ok(RefundOutcome::Done)
            }
            Err(ledger::Error::ContractReject(ledger::RejectReason::TooEarly)) => {
                Ok(RefundOutcome::NotYet)
            }
            Err(e) => Err(anyhow::Error::new(e).context(format!("{} failed", label))),
        }
    }

    async fn fail(&self, order: &mut Order, reason: &str) -> Result<()> {
        order.failure_reason = Some(reason.to_owned());
        order.transition(Status::Failed)?;
        self.db.update_order(order).await?;

        let ts = self.alpha_now().await.unwrap_or(order.created_at);
        self.emit(
            order,
            ts,
            Kind::Failed {
                reason: reason.to_owned(),
            },
            0,
        );

        tracing::error!(order_id = %order.order_id, reason, "order failed");

        Ok(())
    }

    /// Classify a ledger error that survived the retry policy.
    ///
    /// Errors requiring operator action propagate without touching the
    /// order, so a rerun picks up where this attempt stopped. Past the
    /// order's expiry the order enters the refund path if anything is
    /// locked, otherwise it is failed.
    async fn handle_ledger_error<T>(
        &self,
        order: &mut Order,
        error: ledger::Error,
        label: &str,
    ) -> Result<T> {
        let expired = match self.alpha_now().await {
            Ok(alpha_now) => alpha_now > order.expires_at,
            Err(_) => false,
        };

        if expired {
            let funds_locked = side_needs_refund(&order.side_a) || side_needs_refund(&order.side_b);

            if funds_locked {
                tracing::warn!(
                    order_id = %order.order_id,
                    "order expired with funds locked, entering the refund path"
                );
                order.transition(Status::RefundPending)?;
                self.db.update_order(order).await?;
            } else if order.status == Status::Created {
                order.transition(Status::Expired)?;
                self.db.update_order(order).await?;
                self.emit(order, order.expires_at, Kind::Expired, 0);
            } else {
                self.fail(order, &format!("{}: {}", label, error)).await?;
            }
        }

        Err(anyhow::Error::new(error)
            .context(format!("{} failed for order {}", label, order.order_id)))
    }

    async fn deposit_nonce(&self, order: &mut Order, alpha_side: bool) -> Result<Nonce> {
        let label = if alpha_side { "deposit_a" } else { "deposit_b" };
        let side = if alpha_side {
            &mut order.side_a
        } else {
            &mut order.side_b
        };

        match side.deposit_nonce {
            Some(nonce) => Ok(nonce),
            None => {
                let nonce = Nonce::derive(order.order_id.as_bytes(), label);
                side.deposit_nonce = Some(nonce);
                // Checkpoint the intent before the ledger sees the write.
                self.db.update_order(order).await?;

                Ok(nonce)
            }
        }
    }

    async fn observe_beta(
        &self,
        escrow_id: &ledger::EscrowId,
    ) -> Result<ledger::Snapshot, ledger::Error> {
        let beta = Arc::clone(&self.beta);
        let escrow = escrow_id.clone();
        self.with_retries("observe_b", move || {
            let beta = Arc::clone(&beta);
            let escrow = escrow.clone();
            async move { beta.observe(&escrow).await }
        })
        .await
    }

    async fn alpha_now(&self) -> Result<Timestamp, ledger::Error> {
        let alpha = Arc::clone(&self.alpha);
        let reported = self
            .with_retries("ledger_time_a", move || {
                let alpha = Arc::clone(&alpha);
                async move { alpha.ledger_time().await }
            })
            .await?;

        self.alpha_clock.check(reported)
    }

    async fn beta_now(&self) -> Result<Timestamp, ledger::Error> {
        let beta = Arc::clone(&self.beta);
        let reported = self
            .with_retries("ledger_time_b", move || {
                let beta = Arc::clone(&beta);
                async move { beta.ledger_time().await }
            })
            .await?;

        self.beta_clock.check(reported)
    }

    async fn with_retries<T, F, Fut>(&self, label: &str, f: F) -> Result<T, ledger::Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ledger::Error>>,
    {
        retry(self.params.retry, label, false, f).await
    }

    async fn retry_unbounded<T, F, Fut>(&self, label: &str, f: F) -> Result<T, ledger::Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ledger::Error>>,
    {
        retry(self.params.retry, label, true, f).await
    }

    fn emit(&self, order: &Order, ts: Timestamp, kind: Kind, occurrence: u64) {
        self.publisher
            .publish(Event::new(order.order_id, ts, kind, occurrence));
    }

    fn load(&self, order_id: &OrderId) -> Result<Order> {
        self.db
            .get_order(order_id)?
            .ok_or_else(|| anyhow!("order {} does not exist", order_id))
    }
}

enum RefundOutcome {
    Done,
    NotYet,
}

fn side_needs_refund(side: &Side) -> bool {
    side.is_locked() && !side.is_fully_claimed() && side.refund_tx.is_none()
}

/// Exponential backoff around one ledger call.
///
/// `ConfirmationTimeout` and `TransactionNotFound` are retried with the
/// very same nonce: the ledger deduplicates, so the retry can only
/// finish the original submission, never double-spend it.
async fn retry<T, F, Fut>(
    policy: RetryPolicy,
    label: &str,
    unbounded: bool,
    mut f: F,
) -> Result<T, ledger::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ledger::Error>>,
{
    let mut backoff = policy.initial_backoff;
    let mut attempts = 0u32;

    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(error) if retryable(&error) || (unbounded && !fatal_for_refund(&error)) => {
                attempts += 1;
                if !unbounded && attempts > policy.max_retries {
                    tracing::error!(label, error = %error, "retries exhausted");
                    return Err(error);
                }

                tracing::warn!(label, error = %error, attempt = attempts, "retrying after backoff");
                tokio::time::sleep(backoff).await;
                backoff = policy.next_backoff(backoff);
            }
            Err(error) => return Err(error),
        }
    }
}

fn retryable(error: &ledger::Error) -> bool {
    matches!(
        error,
        ledger::Error::Transient(_)
            | ledger::Error::ConfirmationTimeout
            | ledger::Error::TransactionNotFound
    )
}

fn fatal_for_refund(error: &ledger::Error) -> bool {
    matches!(error, ledger::Error::ContractReject(_))
}
