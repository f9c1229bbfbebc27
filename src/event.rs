//! Typed progress events and the final receipt.
//!
//! The stream is at-least-once: after a crash the coordinator replays
//! the protocol and may emit an event a consumer has already seen.
//! Sequence numbers are derived from the event's position in the
//! protocol, so a replayed event carries the same `(order_id, seq)` and
//! consumers can deduplicate on that pair.

use crate::{
    amount::Amount,
    ledger::{EscrowId, TxId},
    order::{Order, OrderId, Status},
    secret::Secret,
    secret_hash::SecretHash,
    timestamp::Timestamp,
};
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Mutex};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Kind {
    Created {
        secret_hash: SecretHash,
    },
    DepositedA {
        escrow_id: EscrowId,
        tx_id: TxId,
    },
    DepositedB {
        escrow_id: EscrowId,
        tx_id: TxId,
    },
    CounterpartyClaimed {
        tx_id: TxId,
        amount: Amount,
    },
    ClaimedA {
        tx_id: TxId,
        amount: Amount,
    },
    ClaimedB {
        tx_id: TxId,
        amount: Amount,
    },
    RefundedA {
        tx_id: TxId,
        amount: Amount,
    },
    RefundedB {
        tx_id: TxId,
        amount: Amount,
    },
    Completed,
    Failed {
        reason: String,
    },
    Expired,
}

impl Kind {
    fn base_seq(&self) -> u64 {
        match self {
            Kind::Created { .. } => 0,
            Kind::DepositedA { .. } => 1,
            Kind::DepositedB { .. } => 2,
            Kind::CounterpartyClaimed { .. } => 3,
            Kind::ClaimedB { .. } => 4,
            Kind::ClaimedA { .. } => 5,
            Kind::RefundedA { .. } => 6,
            Kind::RefundedB { .. } => 7,
            Kind::Completed => 8,
            Kind::Failed { .. } => 9,
            Kind::Expired => 10,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub order_id: OrderId,
    pub seq: u64,
    pub ts: Timestamp,
    #[serde(flatten)]
    pub kind: Kind,
}

impl Event {
    /// `occurrence` distinguishes repeated events of the same kind, e.g.
    /// the n-th partial claim; derive it from persisted state so a
    /// replay after a crash produces the same sequence number.
    pub fn new(order_id: OrderId, ts: Timestamp, kind: Kind, occurrence: u64) -> Self {
        let seq = kind.base_seq() * 100 + occurrence;

        Event {
            order_id,
            seq,
            ts,
            kind,
        }
    }
}

/// Fans events out to per-order subscribers.
///
/// Subscribers that went away are dropped on the next publish.
#[derive(Debug, Default)]
pub struct Publisher {
    subscribers: Mutex<HashMap<OrderId, Vec<UnboundedSender<Event>>>>,
}

impl Publisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, order_id: OrderId) -> UnboundedReceiver<Event> {
        let (sender, receiver) = mpsc::unbounded();

        let mut subscribers = self
            .subscribers
            .lock()
            .expect("no thread panicked while holding the lock");
        subscribers.entry(order_id).or_default().push(sender);

        receiver
    }

    pub fn publish(&self, event: Event) {
        let mut subscribers = self
            .subscribers
            .lock()
            .expect("no thread panicked while holding the lock");

        if let Some(senders) = subscribers.get_mut(&event.order_id) {
            senders.retain(|sender| sender.unbounded_send(event.clone()).is_ok());
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReceiptSide {
    pub ledger: String,
    pub token: String,
    pub amount: Amount,
    pub escrow_id: Option<EscrowId>,
    pub deposit_tx: Option<TxId>,
    pub claim_txs: Vec<TxId>,
    pub refund_tx: Option<TxId>,
}

/// Issued once an order reaches a terminal status. The revealed
/// preimage is included only when it became public on-chain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub order_id: OrderId,
    pub status: Status,
    pub secret_hash: SecretHash,
    pub revealed_preimage: Option<Secret>,
    pub side_a: ReceiptSide,
    pub side_b: ReceiptSide,
    pub created_at: Timestamp,
    pub finished_at: Timestamp,
    pub failure_reason: Option<String>,
}

impl Receipt {
    pub fn from_order(order: &Order, finished_at: Timestamp) -> Self {
        let secret_was_revealed = !order.side_b.claim_txs.is_empty();

        Receipt {
            order_id: order.order_id,
            status: order.status,
            secret_hash: order.secret_hash,
            revealed_preimage: secret_was_revealed.then_some(order.secret),
            side_a: receipt_side(&order.side_a),
            side_b: receipt_side(&order.side_b),
            created_at: order.created_at,
            finished_at,
            failure_reason: order.failure_reason.clone(),
        }
    }
}

fn receipt_side(side: &crate::order::Side) -> ReceiptSide {
    ReceiptSide {
        ledger: side.ledger.clone(),
        token: side.token.clone(),
        amount: side.amount,
        escrow_id: side.escrow_id.clone(),
        deposit_tx: side.deposit_tx.clone(),
        claim_txs: side.claim_txs.clone(),
        refund_tx: side.refund_tx.clone(),
    }
}
