//! A deterministic in-memory ledger.
//!
//! Runs the same escrow state machine a real chain's contract would and
//! implements the full adapter surface, so the coordinator cannot tell
//! it apart from a production ledger. Test-only knobs (advancing the
//! clock, acting as the counterparty, reorging a claim out, injecting
//! failures) live on the simulator itself, not on the adapter trait.

use crate::{
    amount::Amount,
    escrow::{Escrow, Params},
    ledger::{
        Adapter, Address, ClaimEvent, Claimed, DepositParams, Deposited, Error, EscrowId, Nonce,
        RejectReason, Refunded, Snapshot, TxId, TxReport, TxStatus,
    },
    secret::Secret,
    timestamp::Timestamp,
};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

#[derive(Clone, Debug)]
struct TxMeta {
    confirmations: u32,
    block_number: u64,
    reverted: bool,
}

#[derive(Debug)]
struct EscrowEntry {
    escrow: Escrow,
    deposit_tx: TxId,
    claims: Vec<ClaimEvent>,
    refund_tx: Option<TxId>,
}

#[derive(Debug, Default)]
struct State {
    now: u64,
    balance: u64,
    escrows: HashMap<EscrowId, EscrowEntry>,
    txs: HashMap<TxId, TxMeta>,
    deposits_by_nonce: HashMap<Nonce, Deposited>,
    claims_by_nonce: HashMap<Nonce, Claimed>,
    refunds_by_nonce: HashMap<Nonce, Refunded>,
    deposit_submissions: u64,
    next_id: u64,
    next_block: u64,
    faults: HashMap<&'static str, VecDeque<Error>>,
}

impl State {
    fn next_tx(&mut self, prefix: &str, confirmations: u32) -> TxId {
        self.next_id += 1;
        self.next_block += 1;
        let tx = TxId::new(format!("{}-{}", prefix, self.next_id));
        self.txs.insert(
            tx.clone(),
            TxMeta {
                confirmations,
                block_number: self.next_block,
                reverted: false,
            },
        );

        tx
    }

    fn take_fault(&mut self, op: &'static str) -> Option<Error> {
        self.faults.get_mut(op).and_then(VecDeque::pop_front)
    }
}

/// One simulated ledger with a single local wallet.
#[derive(Clone, Debug)]
pub struct Simulator {
    name: String,
    wallet: Address,
    /// Confirmations a transaction is considered to have immediately
    /// after inclusion; reorg tests lower individual transactions.
    initial_confirmations: u32,
    state: Arc<Mutex<State>>,
}

impl Simulator {
    pub fn new(name: &str, balance: Amount) -> Self {
        Self::with_confirmations(name, balance, u32::MAX)
    }

    pub fn with_confirmations(name: &str, balance: Amount, initial_confirmations: u32) -> Self {
        Simulator {
            name: name.to_owned(),
            wallet: Address::new(format!("{}-wallet", name)),
            initial_confirmations,
            state: Arc::new(Mutex::new(State {
                balance: balance.as_base_units(),
                ..State::default()
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .expect("no thread panicked while holding the lock")
    }

    pub fn advance_time(&self, millis: u64) {
        let mut state = self.lock();
        state.now += millis;
    }

    pub fn set_time(&self, now: Timestamp) {
        let mut state = self.lock();
        state.now = now.as_millis();
    }

    /// Queue an error to be returned by the next call of `op`
    /// (`"deposit"`, `"claim"`, `"refund"`, `"observe"`, `"ledger_time"`).
    pub fn inject_error(&self, op: &'static str, error: Error) {
        let mut state = self.lock();
        state.faults.entry(op).or_default().push_back(error);
    }

    /// How many deposit transactions were actually submitted, nonce
    /// replays excluded.
    pub fn deposit_submissions(&self) -> u64 {
        self.lock().deposit_submissions
    }

    /// Act as the external counterparty: claim against an escrow from
    /// an arbitrary caller address. The preimage ends up in the emitted
    /// event, exactly like a claim transaction on a real chain.
    pub fn counterparty_claim(
        &self,
        escrow_id: &EscrowId,
        caller: &Address,
        preimage: Secret,
        amount: Amount,
    ) -> Result<TxId, Error> {
        let mut state = self.lock();
        let now = Timestamp::from_millis(state.now);

        let entry = state
            .escrows
            .get_mut(escrow_id)
            .ok_or(Error::ContractReject(RejectReason::UnknownEscrow))?;

        entry
            .escrow
            .claim(&preimage, amount, caller, now)
            .map_err(|e| Error::ContractReject(e.into()))?;

        let confirmations = self.initial_confirmations;
        let tx = state.next_tx("claim", confirmations);
        let entry = state
            .escrows
            .get_mut(escrow_id)
            .expect("escrow still exists");
        entry.claims.push(ClaimEvent {
            tx_id: tx.clone(),
            amount,
            at: now,
            revealed_preimage: preimage,
            confirmations,
        });

        Ok(tx)
    }

    pub fn set_tx_confirmations(&self, tx_id: &TxId, confirmations: u32) {
        let mut state = self.lock();
        if let Some(meta) = state.txs.get_mut(tx_id) {
            meta.confirmations = confirmations;
        }
        for entry in state.escrows.values_mut() {
            for claim in &mut entry.claims {
                if &claim.tx_id == tx_id {
                    claim.confirmations = confirmations;
                }
            }
        }
    }

    /// Drop a claim transaction as if a reorg removed it, rebuilding the
    /// escrow from the deposit and the surviving claim events.
    pub fn reorg_out_claim(&self, escrow_id: &EscrowId, tx_id: &TxId) {
        let mut state = self.lock();

        let entry = match state.escrows.get_mut(escrow_id) {
            Some(entry) => entry,
            None => return,
        };

        entry.claims.retain(|claim| &claim.tx_id != tx_id);

        let params = entry.escrow.params().clone();
        let surviving = entry.claims.clone();
        let mut rebuilt =
            Escrow::deposit(params.clone(), params.timelock.minus(1)).expect("deposit was valid");
        for claim in &surviving {
            rebuilt
                .claim(
                    &claim.revealed_preimage,
                    claim.amount,
                    &params.redeemer,
                    claim.at,
                )
                .expect("surviving claims replay cleanly");
        }
        entry.escrow = rebuilt;

        state.txs.remove(tx_id);
    }

    pub fn escrow_remaining(&self, escrow_id: &EscrowId) -> Option<Amount> {
        let state = self.lock();
        state
            .escrows
            .get(escrow_id)
            .map(|entry| entry.escrow.remaining())
    }

    fn snapshot_locked(state: &State, escrow_id: &EscrowId) -> Result<Snapshot, Error> {
        let entry = state
            .escrows
            .get(escrow_id)
            .ok_or(Error::ContractReject(RejectReason::UnknownEscrow))?;

        Ok(Snapshot {
            escrow_id: escrow_id.clone(),
            deposit_tx: entry.deposit_tx.clone(),
            initiator: entry.escrow.params().initiator.clone(),
            redeemer: entry.escrow.params().redeemer.clone(),
            secret_hash: entry.escrow.params().secret_hash,
            deposited: entry.escrow.deposited(),
            remaining: entry.escrow.remaining(),
            claimed_total: entry.escrow.claimed_total(),
            status: entry.escrow.status(),
            timelock: entry.escrow.params().timelock,
            claims: entry.claims.clone(),
            refund_tx: entry.refund_tx.clone(),
        })
    }
}

#[async_trait::async_trait]
impl Adapter for Simulator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn address(&self) -> Result<Address, Error> {
        Ok(self.wallet.clone())
    }

    async fn balance(&self) -> Result<Amount, Error> {
        Ok(Amount::from_base_units(self.lock().balance))
    }

    async fn ledger_time(&self) -> Result<Timestamp, Error> {
        let mut state = self.lock();
        if let Some(error) = state.take_fault("ledger_time") {
            return Err(error);
        }

        Ok(Timestamp::from_millis(state.now))
    }

    async fn deposit(&self, params: DepositParams, nonce: Nonce) -> Result<Deposited, Error> {
        let mut state = self.lock();

        if let Some(error) = state.take_fault("deposit") {
            return Err(error);
        }

        // The ledger deduplicates by nonce: a resubmission after a crash
        // returns the original inclusion instead of a second escrow.
        if let Some(deposited) = state.deposits_by_nonce.get(&nonce) {
            return Ok(deposited.clone());
        }

        if state.balance < params.amount.as_base_units() {
            return Err(Error::InsufficientFunds);
        }

        let now = Timestamp::from_millis(state.now);
        let escrow = Escrow::deposit(
            Params {
                initiator: self.wallet.clone(),
                redeemer: params.redeemer,
                secret_hash: params.secret_hash,
                hash_algorithm: params.hash_algorithm,
                amount: params.amount,
                timelock: params.timelock,
                partial_fills_allowed: params.partial_fills_allowed,
            },
            now,
        )
        .map_err(|e| Error::ContractReject(e.into()))?;

        state.balance -= params.amount.as_base_units();
        state.deposit_submissions += 1;

        let tx = state.next_tx("deposit", self.initial_confirmations);
        state.next_id += 1;
        let escrow_id = EscrowId::new(format!("{}-escrow-{}", self.name, state.next_id));

        state.escrows.insert(
            escrow_id.clone(),
            EscrowEntry {
                escrow,
                deposit_tx: tx.clone(),
                claims: Vec::new(),
                refund_tx: None,
            },
        );

        let deposited = Deposited {
            escrow_id,
            tx_id: tx,
            included_at: now,
        };
        state.deposits_by_nonce.insert(nonce, deposited.clone());

        Ok(deposited)
    }

    async fn claim(
        &self,
        escrow_id: &EscrowId,
        preimage: Secret,
        amount: Amount,
        nonce: Nonce,
    ) -> Result<Claimed, Error> {
        let mut state = self.lock();

        if let Some(error) = state.take_fault("claim") {
            return Err(error);
        }

        if let Some(claimed) = state.claims_by_nonce.get(&nonce) {
            return Ok(claimed.clone());
        }

        let now = Timestamp::from_millis(state.now);
        let caller = self.wallet.clone();

        let entry = state
            .escrows
            .get_mut(escrow_id)
            .ok_or(Error::ContractReject(RejectReason::UnknownEscrow))?;

        entry
            .escrow
            .claim(&preimage, amount, &caller, now)
            .map_err(|e| Error::ContractReject(e.into()))?;

        let confirmations = self.initial_confirmations;
        let tx = state.next_tx("claim", confirmations);
        let entry = state
            .escrows
            .get_mut(escrow_id)
            .expect("escrow still exists");
        entry.claims.push(ClaimEvent {
            tx_id: tx.clone(),
            amount,
            at: now,
            revealed_preimage: preimage,
            confirmations,
        });

        state.balance += amount.as_base_units();

        // The preimage handed back comes from the recorded event, the
        // same place an external watcher would read it from.
        let revealed_preimage = state
            .escrows
            .get(escrow_id)
            .and_then(|entry| entry.claims.last())
            .map(|claim| claim.revealed_preimage)
            .expect("the claim event was just recorded");

        let claimed = Claimed {
            tx_id: tx,
            included_at: now,
            revealed_preimage,
        };
        state.claims_by_nonce.insert(nonce, claimed.clone());

        Ok(claimed)
    }

    async fn refund(&self, escrow_id: &EscrowId, nonce: Nonce) -> Result<Refunded, Error> {
        let mut state = self.lock();

        if let Some(error) = state.take_fault("refund") {
            return Err(error);
        }

        if let Some(refunded) = state.refunds_by_nonce.get(&nonce) {
            return Ok(refunded.clone());
        }

        let now = Timestamp::from_millis(state.now);
        let caller = self.wallet.clone();

        let entry = state
            .escrows
            .get_mut(escrow_id)
            .ok_or(Error::ContractReject(RejectReason::UnknownEscrow))?;

        let amount = entry
            .escrow
            .refund(&caller, now)
            .map_err(|e| Error::ContractReject(e.into()))?;

        let tx = state.next_tx("refund", self.initial_confirmations);
        let entry = state
            .escrows
            .get_mut(escrow_id)
            .expect("escrow still exists");
        entry.refund_tx = Some(tx.clone());

        state.balance += amount.as_base_units();

        let refunded = Refunded {
            tx_id: tx,
            included_at: now,
            amount,
        };
        state.refunds_by_nonce.insert(nonce, refunded.clone());

        Ok(refunded)
    }

    async fn observe(&self, escrow_id: &EscrowId) -> Result<Snapshot, Error> {
        let mut state = self.lock();

        if let Some(error) = state.take_fault("observe") {
            return Err(error);
        }

        Self::snapshot_locked(&state, escrow_id)
    }

    async fn verify_tx(&self, tx_id: &TxId) -> Result<TxReport, Error> {
        let state = self.lock();

        let report = match state.txs.get(tx_id) {
            Some(meta) => TxReport {
                found: true,
                confirmed: meta.confirmations > 0,
                block_number: Some(meta.block_number),
                status: Some(if meta.reverted {
                    TxStatus::Reverted
                } else {
                    TxStatus::Ok
                }),
            },
            None => TxReport {
                found: false,
                confirmed: false,
                block_number: None,
                status: None,
            },
        };

        Ok(report)
    }

    fn explorer_url(&self, tx_id: &TxId) -> String {
        format!("sim://{}/tx/{}", self.name, tx_id)
    }
}
