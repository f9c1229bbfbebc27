//! Pure hash time-locked escrow state machine.
//!
//! This module mirrors the on-chain contract semantics and is used in two
//! places: the coordinator reasons about escrows through it, and the
//! in-memory ledger simulator executes it as its contract runtime.

use crate::{
    amount::Amount,
    ledger::Address,
    secret::Secret,
    secret_hash::{HashAlgorithm, SecretHash},
    timestamp::Timestamp,
};
use serde::{Deserialize, Serialize};

/// Everything fixed at deposit time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Params {
    pub initiator: Address,
    pub redeemer: Address,
    pub secret_hash: SecretHash,
    pub hash_algorithm: HashAlgorithm,
    pub amount: Amount,
    pub timelock: Timestamp,
    pub partial_fills_allowed: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Open,
    FullyClaimed,
    Refunded,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DepositError {
    #[error("deposit amount must not be zero")]
    ZeroAmount,
    #[error("timelock {timelock} is not in the future of ledger time {ledger_now}")]
    TimelockInPast {
        timelock: Timestamp,
        ledger_now: Timestamp,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ClaimError {
    #[error("preimage does not hash to the escrow's secret hash")]
    BadSecret,
    #[error("caller is not the redeemer")]
    Unauthorized,
    #[error("requested amount is zero or exceeds the remaining balance")]
    AmountOutOfRange,
    #[error("partial fills are not allowed on this escrow")]
    PartialNotAllowed,
    #[error("the refund window is open, claims are no longer accepted")]
    Expired,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RefundError {
    #[error("the timelock has not elapsed yet")]
    TooEarly,
    #[error("caller is not the initiator")]
    Unauthorized,
    #[error("nothing left to refund")]
    NothingToRefund,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escrow {
    params: Params,
    remaining: Amount,
    claimed_total: Amount,
    refunded: Amount,
    status: Status,
}

impl Escrow {
    /// The only constructor; corresponds to the deposit operation on the
    /// underlying ledger.
    pub fn deposit(params: Params, ledger_now: Timestamp) -> Result<Self, DepositError> {
        if params.amount.is_zero() {
            return Err(DepositError::ZeroAmount);
        }
        if params.timelock <= ledger_now {
            return Err(DepositError::TimelockInPast {
                timelock: params.timelock,
                ledger_now,
            });
        }

        Ok(Escrow {
            remaining: params.amount,
            claimed_total: Amount::ZERO,
            refunded: Amount::ZERO,
            status: Status::Open,
            params,
        })
    }

    pub fn claim(
        &mut self,
        preimage: &Secret,
        requested: Amount,
        caller: &Address,
        ledger_now: Timestamp,
    ) -> Result<(), ClaimError> {
        if !self
            .params
            .hash_algorithm
            .verify(preimage, &self.params.secret_hash)
        {
            return Err(ClaimError::BadSecret);
        }
        if caller != &self.params.redeemer {
            return Err(ClaimError::Unauthorized);
        }
        if requested.is_zero() || requested > self.remaining {
            return Err(ClaimError::AmountOutOfRange);
        }
        if !self.params.partial_fills_allowed && requested < self.remaining {
            return Err(ClaimError::PartialNotAllowed);
        }
        if ledger_now > self.params.timelock {
            return Err(ClaimError::Expired);
        }

        self.remaining = self
            .remaining
            .checked_sub(requested)
            .expect("requested amount is validated against remaining");
        self.claimed_total = self
            .claimed_total
            .checked_add(requested)
            .expect("claimed total is bounded by the deposited amount");

        if self.remaining.is_zero() {
            self.status = Status::FullyClaimed;
        }

        Ok(())
    }

    /// Returns the amount handed back to the initiator.
    pub fn refund(
        &mut self,
        caller: &Address,
        ledger_now: Timestamp,
    ) -> Result<Amount, RefundError> {
        if ledger_now <= self.params.timelock {
            return Err(RefundError::TooEarly);
        }
        if caller != &self.params.initiator {
            return Err(RefundError::Unauthorized);
        }
        if self.remaining.is_zero() {
            return Err(RefundError::NothingToRefund);
        }

        let refunded = self.remaining;
        self.refunded = refunded;
        self.remaining = Amount::ZERO;
        self.status = Status::Refunded;

        Ok(refunded)
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn deposited(&self) -> Amount {
        self.params.amount
    }

    pub fn remaining(&self) -> Amount {
        self.remaining
    }

    pub fn claimed_total(&self) -> Amount {
        self.claimed_total
    }

    pub fn refunded(&self) -> Amount {
        self.refunded
    }

    pub fn status(&self) -> Status {
        self.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{Arbitrary, Gen, TestResult};

    fn algorithm() -> HashAlgorithm {
        HashAlgorithm::Sha256
    }

    fn secret() -> Secret {
        Secret::from(*b"hello world, you are beautiful!!")
    }

    fn params(amount: u64, timelock: u64, partial_fills_allowed: bool) -> Params {
        Params {
            initiator: Address::new("initiator"),
            redeemer: Address::new("redeemer"),
            secret_hash: algorithm().hash_of(&secret()),
            hash_algorithm: algorithm(),
            amount: Amount::from_base_units(amount),
            timelock: Timestamp::from_millis(timelock),
            partial_fills_allowed,
        }
    }

    fn open_escrow(amount: u64, timelock: u64, partial_fills_allowed: bool) -> Escrow {
        Escrow::deposit(
            params(amount, timelock, partial_fills_allowed),
            Timestamp::from_millis(0),
        )
        .unwrap()
    }

    #[test]
    fn deposit_rejects_zero_amount() {
        let result = Escrow::deposit(params(0, 100, true), Timestamp::from_millis(0));

        assert_eq!(result.unwrap_err(), DepositError::ZeroAmount);
    }

    #[test]
    fn deposit_rejects_timelock_at_or_before_now() {
        let result = Escrow::deposit(params(10, 100, true), Timestamp::from_millis(100));

        assert!(matches!(result, Err(DepositError::TimelockInPast { .. })));
    }

    #[test]
    fn claim_of_exactly_remaining_succeeds_without_partial_fills() {
        let mut escrow = open_escrow(10_000, 1_000, false);

        escrow
            .claim(
                &secret(),
                Amount::from_base_units(10_000),
                &Address::new("redeemer"),
                Timestamp::from_millis(1),
            )
            .unwrap();

        assert_eq!(escrow.status(), Status::FullyClaimed);
        assert_eq!(escrow.remaining(), Amount::ZERO);
        assert_eq!(escrow.claimed_total(), Amount::from_base_units(10_000));
    }

    #[test]
    fn partial_claim_fails_when_partial_fills_are_disabled() {
        let mut escrow = open_escrow(10_000, 1_000, false);

        let result = escrow.claim(
            &secret(),
            Amount::from_base_units(4_000),
            &Address::new("redeemer"),
            Timestamp::from_millis(1),
        );

        assert_eq!(result.unwrap_err(), ClaimError::PartialNotAllowed);
    }

    #[test]
    fn partial_claims_summing_to_deposited_fully_claim_the_escrow() {
        let mut escrow = open_escrow(10_000, 1_000, true);
        let redeemer = Address::new("redeemer");

        escrow
            .claim(
                &secret(),
                Amount::from_base_units(4_000),
                &redeemer,
                Timestamp::from_millis(1),
            )
            .unwrap();
        escrow
            .claim(
                &secret(),
                Amount::from_base_units(6_000),
                &redeemer,
                Timestamp::from_millis(2),
            )
            .unwrap();

        assert_eq!(escrow.status(), Status::FullyClaimed);
        assert_eq!(escrow.claimed_total(), Amount::from_base_units(10_000));

        let one_more = escrow.claim(
            &secret(),
            Amount::from_base_units(1),
            &redeemer,
            Timestamp::from_millis(3),
        );
        assert_eq!(one_more.unwrap_err(), ClaimError::AmountOutOfRange);
    }

    #[test]
    fn claim_with_wrong_preimage_fails() {
        let mut escrow = open_escrow(10_000, 1_000, true);

        let result = escrow.claim(
            &Secret::from(*b"this is not the right preimage!!"),
            Amount::from_base_units(10_000),
            &Address::new("redeemer"),
            Timestamp::from_millis(1),
        );

        assert_eq!(result.unwrap_err(), ClaimError::BadSecret);
    }

    #[test]
    fn claim_by_non_redeemer_fails() {
        let mut escrow = open_escrow(10_000, 1_000, true);

        let result = escrow.claim(
            &secret(),
            Amount::from_base_units(10_000),
            &Address::new("somebody else"),
            Timestamp::from_millis(1),
        );

        assert_eq!(result.unwrap_err(), ClaimError::Unauthorized);
    }

    #[test]
    fn claim_after_the_timelock_fails() {
        let mut escrow = open_escrow(10_000, 1_000, true);

        let result = escrow.claim(
            &secret(),
            Amount::from_base_units(10_000),
            &Address::new("redeemer"),
            Timestamp::from_millis(1_001),
        );

        assert_eq!(result.unwrap_err(), ClaimError::Expired);
    }

    #[test]
    fn refund_at_exactly_the_timelock_is_too_early() {
        let mut escrow = open_escrow(10_000, 1_000, true);

        let result = escrow.refund(&Address::new("initiator"), Timestamp::from_millis(1_000));

        assert_eq!(result.unwrap_err(), RefundError::TooEarly);
    }

    #[test]
    fn refund_one_past_the_timelock_succeeds() {
        let mut escrow = open_escrow(10_000, 1_000, true);

        let refunded = escrow
            .refund(&Address::new("initiator"), Timestamp::from_millis(1_001))
            .unwrap();

        assert_eq!(refunded, Amount::from_base_units(10_000));
        assert_eq!(escrow.status(), Status::Refunded);
        assert_eq!(escrow.remaining(), Amount::ZERO);
    }

    #[test]
    fn refund_by_non_initiator_fails() {
        let mut escrow = open_escrow(10_000, 1_000, true);

        let result = escrow.refund(&Address::new("redeemer"), Timestamp::from_millis(1_001));

        assert_eq!(result.unwrap_err(), RefundError::Unauthorized);
    }

    #[test]
    fn refund_of_fully_claimed_escrow_has_nothing_to_refund() {
        let mut escrow = open_escrow(10_000, 1_000, false);

        escrow
            .claim(
                &secret(),
                Amount::from_base_units(10_000),
                &Address::new("redeemer"),
                Timestamp::from_millis(1),
            )
            .unwrap();

        let result = escrow.refund(&Address::new("initiator"), Timestamp::from_millis(1_001));

        assert_eq!(result.unwrap_err(), RefundError::NothingToRefund);
    }

    #[derive(Clone, Debug)]
    enum Op {
        Claim {
            amount: u64,
            good_secret: bool,
            good_caller: bool,
            at: u64,
        },
        Refund {
            good_caller: bool,
            at: u64,
        },
    }

    impl Arbitrary for Op {
        fn arbitrary<G: Gen>(g: &mut G) -> Self {
            if bool::arbitrary(g) {
                Op::Claim {
                    amount: u64::arbitrary(g) % 2_000,
                    good_secret: bool::arbitrary(g),
                    good_caller: bool::arbitrary(g),
                    at: u64::arbitrary(g) % 2_000,
                }
            } else {
                Op::Refund {
                    good_caller: bool::arbitrary(g),
                    at: u64::arbitrary(g) % 2_000,
                }
            }
        }
    }

    #[test]
    fn accounting_invariants_hold_under_arbitrary_operations() {
        fn prop(ops: Vec<Op>) -> TestResult {
            let mut escrow = open_escrow(1_000, 1_000, true);

            for op in ops {
                let _ = match op {
                    Op::Claim {
                        amount,
                        good_secret,
                        good_caller,
                        at,
                    } => {
                        let preimage = if good_secret {
                            secret()
                        } else {
                            Secret::from([7u8; 32])
                        };
                        let caller = if good_caller {
                            Address::new("redeemer")
                        } else {
                            Address::new("intruder")
                        };
                        escrow
                            .claim(
                                &preimage,
                                Amount::from_base_units(amount),
                                &caller,
                                Timestamp::from_millis(at),
                            )
                            .map(|_| ())
                            .map_err(|e| e.to_string())
                    }
                    Op::Refund { good_caller, at } => {
                        let caller = if good_caller {
                            Address::new("initiator")
                        } else {
                            Address::new("intruder")
                        };
                        escrow
                            .refund(&caller, Timestamp::from_millis(at))
                            .map(|_| ())
                            .map_err(|e| e.to_string())
                    }
                };

                let balance = escrow
                    .claimed_total()
                    .checked_add(escrow.remaining())
                    .and_then(|sum| sum.checked_add(escrow.refunded()));
                if balance != Some(escrow.deposited()) {
                    return TestResult::failed();
                }

                let fully_claimed = escrow.remaining().is_zero()
                    && escrow.claimed_total() == escrow.deposited();
                if (escrow.status() == Status::FullyClaimed) != fully_claimed {
                    return TestResult::failed();
                }
            }

            TestResult::passed()
        }

        quickcheck::quickcheck(prop as fn(Vec<Op>) -> TestResult);
    }
}
