//! The durable record binding a pair of escrows to one secret.

use crate::{
    amount::Amount,
    ledger::{Address, EscrowId, Nonce, TxId},
    secret::Secret,
    secret_hash::{HashAlgorithm, SecretHash},
    timestamp::Timestamp,
};
use rand::prelude::*;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};

const LENGTH: usize = 32;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OrderId([u8; LENGTH]);

impl OrderId {
    pub fn random() -> Self {
        let mut bytes = [0u8; LENGTH];
        rand::thread_rng().fill_bytes(&mut bytes);

        OrderId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; LENGTH] {
        &self.0
    }
}

impl fmt::Debug for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OrderId({})", hex::encode(self.0))
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

#[derive(PartialEq, Clone, Copy, Debug, thiserror::Error)]
#[error("failed to parse order id")]
pub struct ParseOrderIdError;

impl FromStr for OrderId {
    type Err = ParseOrderIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let vec = hex::decode(s).map_err(|_| ParseOrderIdError)?;
        if vec.len() != LENGTH {
            return Err(ParseOrderIdError);
        }
        let mut bytes = [0u8; LENGTH];
        bytes.copy_from_slice(&vec);

        Ok(OrderId(bytes))
    }
}

impl Serialize for OrderId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for OrderId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct Visitor;

        impl<'vde> de::Visitor<'vde> for Visitor {
            type Value = OrderId;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
                formatter.write_str("a hex encoded 32 byte order id")
            }

            fn visit_str<E>(self, v: &str) -> Result<OrderId, E>
            where
                E: de::Error,
            {
                OrderId::from_str(v).map_err(|_| {
                    de::Error::invalid_value(de::Unexpected::Str(v), &"hex encoded bytes")
                })
            }
        }

        deserializer.deserialize_str(Visitor)
    }
}

/// One half of an order: everything the coordinator knows about the
/// escrow on one ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Side {
    pub ledger: String,
    pub initiator: Address,
    pub redeemer: Address,
    pub token: String,
    pub amount: Amount,
    pub timelock: Timestamp,
    pub escrow_id: Option<EscrowId>,
    pub deposit_nonce: Option<Nonce>,
    pub deposit_tx: Option<TxId>,
    pub claim_txs: Vec<TxId>,
    /// Total observed or executed claims against this escrow.
    pub claimed: Amount,
    pub refund_tx: Option<TxId>,
}

impl Side {
    pub fn is_locked(&self) -> bool {
        self.escrow_id.is_some() && self.deposit_tx.is_some()
    }

    pub fn is_fully_claimed(&self) -> bool {
        self.claimed == self.amount
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Created,
    ALocked,
    BothLocked,
    BClaimed,
    AClaimed,
    Completed,
    RefundPending,
    Refunded,
    Failed,
    Expired,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Completed | Status::Refunded | Status::Failed | Status::Expired
        )
    }

    /// The order lifecycle is a DAG; no transition is reversible.
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;

        matches!(
            (self, to),
            (Created, ALocked)
                | (Created, Failed)
                | (Created, Expired)
                | (ALocked, BothLocked)
                | (ALocked, RefundPending)
                | (ALocked, Failed)
                | (BothLocked, BClaimed)
                | (BothLocked, RefundPending)
                | (BothLocked, Failed)
                | (BClaimed, AClaimed)
                | (BClaimed, RefundPending)
                | (BClaimed, Failed)
                | (AClaimed, Completed)
                | (AClaimed, Failed)
                | (RefundPending, Refunded)
                | (RefundPending, Failed)
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Created => "created",
            Status::ALocked => "a_locked",
            Status::BothLocked => "both_locked",
            Status::BClaimed => "b_claimed",
            Status::AClaimed => "a_claimed",
            Status::Completed => "completed",
            Status::RefundPending => "refund_pending",
            Status::Refunded => "refunded",
            Status::Failed => "failed",
            Status::Expired => "expired",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("order {order_id} cannot transition from {from} to {to}")]
pub struct IllegalTransition {
    pub order_id: OrderId,
    pub from: Status,
    pub to: Status,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: OrderId,
    /// Held until the order is garbage collected; rendered redacted
    /// everywhere except the stored record itself.
    pub secret: Secret,
    pub secret_hash: SecretHash,
    pub hash_algorithm: HashAlgorithm,
    /// Threaded identically into both escrows' deposits.
    pub partial_fills_allowed: bool,
    pub side_a: Side,
    pub side_b: Side,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
    pub status: Status,
    /// Machine-readable reason accompanying `Failed`.
    pub failure_reason: Option<String>,
}

impl Order {
    pub fn transition(&mut self, to: Status) -> Result<(), IllegalTransition> {
        if !self.status.can_transition_to(to) {
            return Err(IllegalTransition {
                order_id: self.order_id,
                from: self.status,
                to,
            });
        }
        self.status = to;

        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// `Order` sans secret, for status output and logs.
#[derive(Clone, Debug, Serialize)]
pub struct StatusSummary {
    pub order_id: OrderId,
    pub secret_hash: SecretHash,
    pub hash_algorithm: HashAlgorithm,
    pub status: Status,
    pub side_a: Side,
    pub side_b: Side,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
    pub failure_reason: Option<String>,
}

impl From<&Order> for StatusSummary {
    fn from(order: &Order) -> Self {
        StatusSummary {
            order_id: order.order_id,
            secret_hash: order.secret_hash,
            hash_algorithm: order.hash_algorithm,
            status: order.status,
            side_a: order.side_a.clone(),
            side_b: order.side_b.clone(),
            created_at: order.created_at,
            expires_at: order.expires_at,
            failure_reason: order.failure_reason.clone(),
        }
    }
}

#[cfg(test)]
pub mod arbitrary {
    use super::*;
    use quickcheck::{Arbitrary, Gen};

    impl Arbitrary for OrderId {
        fn arbitrary<G: Gen>(g: &mut G) -> Self {
            let mut bytes = [0u8; 32];
            for byte in &mut bytes {
                *byte = u8::arbitrary(g);
            }
            OrderId(bytes)
        }
    }

    pub fn secret<G: Gen>(g: &mut G) -> Secret {
        let mut bytes = [0u8; 32];
        for byte in &mut bytes {
            *byte = u8::arbitrary(g);
        }
        Secret::from(bytes)
    }

    fn address<G: Gen>(g: &mut G) -> Address {
        Address::new(format!("addr-{}", u32::arbitrary(g)))
    }

    fn side<G: Gen>(g: &mut G, ledger: &str) -> Side {
        Side {
            ledger: ledger.to_owned(),
            initiator: address(g),
            redeemer: address(g),
            token: String::arbitrary(g),
            amount: Amount::from_base_units(u64::arbitrary(g)),
            timelock: Timestamp::from_millis(u64::arbitrary(g)),
            escrow_id: Option::<u32>::arbitrary(g).map(|n| EscrowId::new(format!("escrow-{}", n))),
            deposit_nonce: if bool::arbitrary(g) {
                Some(Nonce::derive(b"seed", "step"))
            } else {
                None
            },
            deposit_tx: Option::<u32>::arbitrary(g).map(|n| TxId::new(format!("tx-{}", n))),
            claim_txs: Vec::<u32>::arbitrary(g)
                .into_iter()
                .map(|n| TxId::new(format!("claim-{}", n)))
                .collect(),
            claimed: Amount::from_base_units(u64::arbitrary(g)),
            refund_tx: Option::<u32>::arbitrary(g).map(|n| TxId::new(format!("refund-{}", n))),
        }
    }

    impl Arbitrary for Status {
        fn arbitrary<G: Gen>(g: &mut G) -> Self {
            let all = [
                Status::Created,
                Status::ALocked,
                Status::BothLocked,
                Status::BClaimed,
                Status::AClaimed,
                Status::Completed,
                Status::RefundPending,
                Status::Refunded,
                Status::Failed,
                Status::Expired,
            ];
            all[usize::arbitrary(g) % all.len()]
        }
    }

    impl Arbitrary for Order {
        fn arbitrary<G: Gen>(g: &mut G) -> Self {
            let secret = secret(g);
            let hash_algorithm = if bool::arbitrary(g) {
                HashAlgorithm::Sha256
            } else {
                HashAlgorithm::Blake2b256
            };

            Order {
                order_id: OrderId::arbitrary(g),
                secret,
                secret_hash: hash_algorithm.hash_of(&secret),
                hash_algorithm,
                partial_fills_allowed: bool::arbitrary(g),
                side_a: side(g, "alpha"),
                side_b: side(g, "beta"),
                created_at: Timestamp::from_millis(u64::arbitrary(g)),
                expires_at: Timestamp::from_millis(u64::arbitrary(g)),
                status: Status::arbitrary(g),
                failure_reason: Option::<String>::arbitrary(g),
            }
        }
    }
}
