//! The uniform seam between the coordinator and a concrete ledger.
//!
//! Writes (deposit, claim, refund) are signed, broadcast and awaited by
//! the adapter; reads (observe, ledger_time, verify_tx) never mutate
//! anything. Adapters are stateless across calls apart from their node
//! connection; all durable protocol state lives in the order record
//! store.

pub mod rpc;
pub mod simulator;

use crate::{
    amount::Amount,
    escrow,
    secret::Secret,
    secret_hash::{HashAlgorithm, SecretHash},
    timestamp::Timestamp,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

/// An address on some ledger, opaque to the coordinator.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(String);

impl Address {
    pub fn new(inner: impl Into<String>) -> Self {
        Address(inner.into())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An opaque transaction identifier, kept for provenance.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxId(String);

impl TxId {
    pub fn new(inner: impl Into<String>) -> Self {
        TxId(inner.into())
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies an escrow on its ledger.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EscrowId(String);

impl EscrowId {
    pub fn new(inner: impl Into<String>) -> Self {
        EscrowId(inner.into())
    }
}

impl fmt::Display for EscrowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A deduplication token attached to every write.
///
/// Nonces are derived deterministically from the order id and the step
/// name, so a coordinator restarted mid-protocol resubmits with the very
/// same nonce and the adapter (or the ledger) can recognize the
/// duplicate.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Nonce([u8; 32]);

impl Nonce {
    pub fn derive(seed: &[u8], label: &str) -> Self {
        let mut sha = Sha256::new();
        sha.update(seed);
        sha.update(b"/");
        sha.update(label.as_bytes());

        Nonce(sha.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nonce({})", hex::encode(self.0))
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Reasons a ledger's contract runtime rejects a transaction, mirroring
/// the escrow state machine errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum RejectReason {
    #[error("bad secret")]
    BadSecret,
    #[error("unauthorized caller")]
    Unauthorized,
    #[error("amount out of range")]
    AmountOutOfRange,
    #[error("partial fills not allowed")]
    PartialNotAllowed,
    #[error("claim window expired")]
    Expired,
    #[error("refund attempted before the timelock")]
    TooEarly,
    #[error("nothing to refund")]
    NothingToRefund,
    #[error("zero amount")]
    ZeroAmount,
    #[error("timelock not in the future")]
    TimelockInPast,
    #[error("unknown escrow id")]
    UnknownEscrow,
}

impl From<escrow::ClaimError> for RejectReason {
    fn from(e: escrow::ClaimError) -> Self {
        match e {
            escrow::ClaimError::BadSecret => RejectReason::BadSecret,
            escrow::ClaimError::Unauthorized => RejectReason::Unauthorized,
            escrow::ClaimError::AmountOutOfRange => RejectReason::AmountOutOfRange,
            escrow::ClaimError::PartialNotAllowed => RejectReason::PartialNotAllowed,
            escrow::ClaimError::Expired => RejectReason::Expired,
        }
    }
}

impl From<escrow::RefundError> for RejectReason {
    fn from(e: escrow::RefundError) -> Self {
        match e {
            escrow::RefundError::TooEarly => RejectReason::TooEarly,
            escrow::RefundError::Unauthorized => RejectReason::Unauthorized,
            escrow::RefundError::NothingToRefund => RejectReason::NothingToRefund,
        }
    }
}

impl From<escrow::DepositError> for RejectReason {
    fn from(e: escrow::DepositError) -> Self {
        match e {
            escrow::DepositError::ZeroAmount => RejectReason::ZeroAmount,
            escrow::DepositError::TimelockInPast { .. } => RejectReason::TimelockInPast,
        }
    }
}

/// The error taxonomy adapters classify low-level failures into.
///
/// Only `Transient` is retryable without operator action.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("transient ledger error: {0}")]
    Transient(String),
    #[error("insufficient funds")]
    InsufficientFunds,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("nonce conflict")]
    NonceConflict,
    #[error("contract rejected the transaction: {0}")]
    ContractReject(RejectReason),
    #[error("transaction not found past the submission horizon")]
    TransactionNotFound,
    #[error("transaction unconfirmed past the inclusion deadline")]
    ConfirmationTimeout,
}

impl Error {
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

/// Everything the adapter needs to construct a deposit; the initiator is
/// the adapter's own wallet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DepositParams {
    pub redeemer: Address,
    pub token: String,
    pub amount: Amount,
    pub timelock: Timestamp,
    pub secret_hash: SecretHash,
    pub hash_algorithm: HashAlgorithm,
    pub partial_fills_allowed: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Deposited {
    pub escrow_id: EscrowId,
    pub tx_id: TxId,
    pub included_at: Timestamp,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Claimed {
    pub tx_id: TxId,
    pub included_at: Timestamp,
    /// Parsed from the transaction's emitted event, never echoed from
    /// the submitter's input.
    pub revealed_preimage: Secret,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Refunded {
    pub tx_id: TxId,
    pub included_at: Timestamp,
    pub amount: Amount,
}

/// A claim event as emitted by the ledger, the source from which anybody
/// watching can recover the preimage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClaimEvent {
    pub tx_id: TxId,
    pub amount: Amount,
    pub at: Timestamp,
    pub revealed_preimage: Secret,
    pub confirmations: u32,
}

/// The coordinator's shadow of one escrow, reconstructed from ledger
/// events on every observation. Carries everything the deposit emitted,
/// so an external watcher can audit the escrow without trusting us.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub escrow_id: EscrowId,
    pub deposit_tx: TxId,
    pub initiator: Address,
    pub redeemer: Address,
    pub secret_hash: SecretHash,
    pub deposited: Amount,
    pub remaining: Amount,
    pub claimed_total: Amount,
    pub status: escrow::Status,
    pub timelock: Timestamp,
    pub claims: Vec<ClaimEvent>,
    pub refund_tx: Option<TxId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Ok,
    Reverted,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReport {
    pub found: bool,
    pub confirmed: bool,
    pub block_number: Option<u64>,
    pub status: Option<TxStatus>,
}

#[async_trait::async_trait]
pub trait Adapter: Send + Sync + 'static {
    /// A short name identifying the ledger, used in records and logs.
    fn name(&self) -> &str;

    async fn address(&self) -> Result<Address, Error>;

    async fn balance(&self) -> Result<Amount, Error>;

    /// The ledger's own notion of now.
    async fn ledger_time(&self) -> Result<Timestamp, Error>;

    async fn deposit(&self, params: DepositParams, nonce: Nonce) -> Result<Deposited, Error>;

    async fn claim(
        &self,
        escrow_id: &EscrowId,
        preimage: Secret,
        amount: Amount,
        nonce: Nonce,
    ) -> Result<Claimed, Error>;

    async fn refund(&self, escrow_id: &EscrowId, nonce: Nonce) -> Result<Refunded, Error>;

    async fn observe(&self, escrow_id: &EscrowId) -> Result<Snapshot, Error>;

    async fn verify_tx(&self, tx_id: &TxId) -> Result<TxReport, Error>;

    /// Purely informational.
    fn explorer_url(&self, tx_id: &TxId) -> String;
}

/// Guards against a ledger reporting time running backwards.
///
/// Within one session the values handed to the coordinator are
/// non-decreasing; a backward jump is classified as transient so the
/// caller backs off and asks again.
#[derive(Debug, Default)]
pub struct MonotonicTime {
    last_millis: AtomicU64,
}

impl MonotonicTime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self, reported: Timestamp) -> Result<Timestamp, Error> {
        let reported_millis = reported.as_millis();
        let last = self.last_millis.fetch_max(reported_millis, Ordering::SeqCst);

        if reported_millis < last {
            return Err(Error::Transient(format!(
                "ledger time went backwards: {} < {}",
                reported_millis, last
            )));
        }

        Ok(reported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_derivation_is_deterministic() {
        let lhs = Nonce::derive(b"order", "deposit_a");
        let rhs = Nonce::derive(b"order", "deposit_a");

        assert_eq!(lhs, rhs);
    }

    #[test]
    fn nonce_derivation_separates_steps() {
        let lhs = Nonce::derive(b"order", "deposit_a");
        let rhs = Nonce::derive(b"order", "deposit_b");

        assert_ne!(lhs, rhs);
    }

    #[test]
    fn monotonic_time_rejects_backward_jumps() {
        let clock = MonotonicTime::new();

        clock.check(Timestamp::from_millis(100)).unwrap();
        let result = clock.check(Timestamp::from_millis(99));

        assert!(matches!(result, Err(Error::Transient(_))));

        clock.check(Timestamp::from_millis(100)).unwrap();
        clock.check(Timestamp::from_millis(101)).unwrap();
    }
}
