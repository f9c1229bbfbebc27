//! A ledger adapter speaking JSON-RPC against an escrow signing daemon.
//!
//! Transaction construction, signing and broadcast live in the daemon;
//! this adapter only classifies its answers into the error taxonomy the
//! coordinator understands.

use crate::{
    amount::Amount,
    escrow,
    ledger::{
        Adapter, Address, ClaimEvent, Claimed, DepositParams, Deposited, Error, EscrowId, Nonce,
        RejectReason, Refunded, Snapshot, TxId, TxReport,
    },
    secret::Secret,
    secret_hash::SecretHash,
    timestamp::Timestamp,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt::Debug;

// Application error codes of the escrow daemon's JSON-RPC surface.
const CODE_INSUFFICIENT_FUNDS: i64 = 1001;
const CODE_INVALID_SIGNATURE: i64 = 1002;
const CODE_NONCE_CONFLICT: i64 = 1003;
const CODE_CONTRACT_REJECT: i64 = 1004;
const CODE_TX_NOT_FOUND: i64 = 1005;
const CODE_CONFIRMATION_TIMEOUT: i64 = 1006;

#[derive(Clone, Debug)]
pub struct Client {
    inner: reqwest::Client,
    url: url::Url,
}

impl Client {
    pub fn new(base_url: url::Url) -> Self {
        Self {
            inner: reqwest::Client::new(),
            url: base_url,
        }
    }

    pub async fn send<Req, Res>(&self, method: &str, params: Req) -> Result<Res, Error>
    where
        Req: Debug + Serialize,
        Res: Debug + DeserializeOwned,
    {
        let request = Request {
            id: "1",
            jsonrpc: "2.0",
            method,
            params,
        };

        let response = self
            .inner
            .post(self.url.clone())
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Transient(format!("connection error: {}", e)))?
            .json::<Response<Res>>()
            .await
            .map_err(|e| Error::Transient(format!("malformed JSON-RPC response: {}", e)))?;

        match response.payload {
            ResponsePayload::Result(result) => Ok(result),
            ResponsePayload::Error(e) => Err(classify(e)),
        }
    }
}

#[derive(Serialize, Debug, Clone)]
struct Request<'a, T> {
    id: &'a str,
    jsonrpc: &'a str,
    method: &'a str,
    params: T,
}

#[derive(Deserialize, Debug)]
struct Response<R> {
    #[serde(flatten)]
    payload: ResponsePayload<R>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "lowercase")]
enum ResponsePayload<R> {
    Result(R),
    Error(JsonRpcError),
}

#[derive(Debug, Deserialize, thiserror::Error, PartialEq)]
#[error("JSON-RPC request failed with code {code}: {message}")]
pub struct JsonRpcError {
    code: i64,
    message: String,
    data: Option<serde_json::Value>,
}

fn classify(e: JsonRpcError) -> Error {
    match e.code {
        CODE_INSUFFICIENT_FUNDS => Error::InsufficientFunds,
        CODE_INVALID_SIGNATURE => Error::InvalidSignature,
        CODE_NONCE_CONFLICT => Error::NonceConflict,
        CODE_CONTRACT_REJECT => Error::ContractReject(reject_reason(e.data.as_ref())),
        CODE_TX_NOT_FOUND => Error::TransactionNotFound,
        CODE_CONFIRMATION_TIMEOUT => Error::ConfirmationTimeout,
        _ => Error::Transient(e.to_string()),
    }
}

fn reject_reason(data: Option<&serde_json::Value>) -> RejectReason {
    data.and_then(|value| value.get("reason"))
        .and_then(|reason| serde_json::from_value(reason.clone()).ok())
        // An unmapped reject code still must not be retried; surface it
        // as an authorization-level reject for the audit trail.
        .unwrap_or(RejectReason::Unauthorized)
}

#[derive(Debug, Deserialize)]
struct DepositedDto {
    escrow_id: String,
    tx_id: String,
    included_at: u64,
}

#[derive(Debug, Deserialize)]
struct ClaimedDto {
    tx_id: String,
    included_at: u64,
    revealed_preimage: Secret,
}

#[derive(Debug, Deserialize)]
struct RefundedDto {
    tx_id: String,
    included_at: u64,
    amount: u64,
}

#[derive(Debug, Deserialize)]
struct ClaimEventDto {
    tx_id: String,
    amount: u64,
    at: u64,
    revealed_preimage: Secret,
    confirmations: u32,
}

#[derive(Debug, Deserialize)]
struct SnapshotDto {
    escrow_id: String,
    deposit_tx: String,
    initiator: String,
    redeemer: String,
    secret_hash: SecretHash,
    deposited: u64,
    remaining: u64,
    claimed_total: u64,
    status: escrow::Status,
    timelock: u64,
    claims: Vec<ClaimEventDto>,
    refund_tx: Option<String>,
}

/// The production adapter: one instance per ledger, configured with the
/// daemon's URL and the confirmation threshold to request.
#[derive(Clone, Debug)]
pub struct RpcAdapter {
    name: String,
    client: Client,
    confirmations: u32,
    explorer_base: Option<url::Url>,
}

impl RpcAdapter {
    pub fn new(name: &str, url: url::Url, confirmations: u32) -> Self {
        RpcAdapter {
            name: name.to_owned(),
            client: Client::new(url),
            confirmations,
            explorer_base: None,
        }
    }

    pub fn with_explorer(mut self, base: url::Url) -> Self {
        self.explorer_base = Some(base);
        self
    }
}

#[async_trait::async_trait]
impl Adapter for RpcAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn address(&self) -> Result<Address, Error> {
        let address: String = self.client.send("wallet_address", ()).await?;

        Ok(Address::new(address))
    }

    async fn balance(&self) -> Result<Amount, Error> {
        let balance: u64 = self.client.send("wallet_balance", ()).await?;

        Ok(Amount::from_base_units(balance))
    }

    async fn ledger_time(&self) -> Result<Timestamp, Error> {
        let millis: u64 = self.client.send("ledger_time", ()).await?;

        Ok(Timestamp::from_millis(millis))
    }

    async fn deposit(&self, params: DepositParams, nonce: Nonce) -> Result<Deposited, Error> {
        let dto: DepositedDto = self
            .client
            .send(
                "htlc_deposit",
                serde_json::json!({
                    "redeemer": params.redeemer.to_string(),
                    "token": params.token,
                    "amount": params.amount.as_base_units(),
                    "timelock": params.timelock.as_millis(),
                    "secret_hash": params.secret_hash.to_string(),
                    "hash_algorithm": params.hash_algorithm.to_string(),
                    "partial_fills_allowed": params.partial_fills_allowed,
                    "nonce": nonce.to_string(),
                    "confirmations": self.confirmations,
                }),
            )
            .await?;

        Ok(Deposited {
            escrow_id: EscrowId::new(dto.escrow_id),
            tx_id: TxId::new(dto.tx_id),
            included_at: Timestamp::from_millis(dto.included_at),
        })
    }

    async fn claim(
        &self,
        escrow_id: &EscrowId,
        preimage: Secret,
        amount: Amount,
        nonce: Nonce,
    ) -> Result<Claimed, Error> {
        let dto: ClaimedDto = self
            .client
            .send(
                "htlc_claim",
                serde_json::json!({
                    "escrow_id": escrow_id.to_string(),
                    "preimage": preimage.to_revealed_hex(),
                    "amount": amount.as_base_units(),
                    "nonce": nonce.to_string(),
                    "confirmations": self.confirmations,
                }),
            )
            .await?;

        Ok(Claimed {
            tx_id: TxId::new(dto.tx_id),
            included_at: Timestamp::from_millis(dto.included_at),
            revealed_preimage: dto.revealed_preimage,
        })
    }

    async fn refund(&self, escrow_id: &EscrowId, nonce: Nonce) -> Result<Refunded, Error> {
        let dto: RefundedDto = self
            .client
            .send(
                "htlc_refund",
                serde_json::json!({
                    "escrow_id": escrow_id.to_string(),
                    "nonce": nonce.to_string(),
                    "confirmations": self.confirmations,
                }),
            )
            .await?;

        Ok(Refunded {
            tx_id: TxId::new(dto.tx_id),
            included_at: Timestamp::from_millis(dto.included_at),
            amount: Amount::from_base_units(dto.amount),
        })
    }

    async fn observe(&self, escrow_id: &EscrowId) -> Result<Snapshot, Error> {
        let dto: SnapshotDto = self
            .client
            .send(
                "htlc_observe",
                serde_json::json!({ "escrow_id": escrow_id.to_string() }),
            )
            .await?;

        Ok(Snapshot {
            escrow_id: EscrowId::new(dto.escrow_id),
            deposit_tx: TxId::new(dto.deposit_tx),
            initiator: Address::new(dto.initiator),
            redeemer: Address::new(dto.redeemer),
            secret_hash: dto.secret_hash,
            deposited: Amount::from_base_units(dto.deposited),
            remaining: Amount::from_base_units(dto.remaining),
            claimed_total: Amount::from_base_units(dto.claimed_total),
            status: dto.status,
            timelock: Timestamp::from_millis(dto.timelock),
            claims: dto
                .claims
                .into_iter()
                .map(|claim| ClaimEvent {
                    tx_id: TxId::new(claim.tx_id),
                    amount: Amount::from_base_units(claim.amount),
                    at: Timestamp::from_millis(claim.at),
                    revealed_preimage: claim.revealed_preimage,
                    confirmations: claim.confirmations,
                })
                .collect(),
            refund_tx: dto.refund_tx.map(TxId::new),
        })
    }

    async fn verify_tx(&self, tx_id: &TxId) -> Result<TxReport, Error> {
        self.client
            .send(
                "verify_tx",
                serde_json::json!({ "tx_id": tx_id.to_string() }),
            )
            .await
    }

    fn explorer_url(&self, tx_id: &TxId) -> String {
        match &self.explorer_base {
            Some(base) => format!("{}tx/{}", base, tx_id),
            None => format!("{}:{}", self.name, tx_id),
        }
    }
}
