//! On-demand audit of a stored order against both ledgers.
//!
//! Strictly read-only: every phase the order's status implies is checked
//! for a confirmed transaction with the expected effect on escrow state.
//! Intended for `swap verify` and an external "am I really done?"
//! button.

use crate::{
    database::Database,
    ledger::{self, Adapter, EscrowId, TxId},
    order::{Order, OrderId, Side, Status},
};
use anyhow::{anyhow, Result};
use serde::Serialize;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    DepositA,
    DepositB,
    ClaimB,
    ClaimA,
    RefundA,
    RefundB,
}

#[derive(Clone, Debug, Serialize)]
pub struct Check {
    pub phase: Phase,
    pub tx_id: TxId,
    pub found: bool,
    pub confirmed: bool,
    pub block_number: Option<u64>,
    pub effect_ok: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct Report {
    pub order_id: OrderId,
    pub status: Status,
    pub checks: Vec<Check>,
}

impl Report {
    pub fn all_ok(&self) -> bool {
        self.checks
            .iter()
            .all(|check| check.found && check.confirmed && check.effect_ok)
    }
}

pub async fn verify_order<A, B>(
    db: &Database,
    alpha: Arc<A>,
    beta: Arc<B>,
    order_id: &OrderId,
) -> Result<Report>
where
    A: Adapter,
    B: Adapter,
{
    let order = db
        .get_order(order_id)?
        .ok_or_else(|| anyhow!("order {} does not exist", order_id))?;

    let mut checks = Vec::new();

    check_side(&*alpha, &order, &order.side_a, true, &mut checks).await?;
    check_side(&*beta, &order, &order.side_b, false, &mut checks).await?;

    Ok(Report {
        order_id: order.order_id,
        status: order.status,
        checks,
    })
}

async fn check_side<L>(
    adapter: &L,
    order: &Order,
    side: &Side,
    alpha_side: bool,
    checks: &mut Vec<Check>,
) -> Result<()>
where
    L: Adapter,
{
    let snapshot = match &side.escrow_id {
        Some(escrow_id) => observe(adapter, escrow_id).await,
        None => None,
    };

    if let Some(deposit_tx) = &side.deposit_tx {
        let report = adapter
            .verify_tx(deposit_tx)
            .await
            .map_err(anyhow::Error::new)?;
        let effect_ok = snapshot
            .as_ref()
            .map(|snapshot| &snapshot.deposit_tx == deposit_tx)
            .unwrap_or(false);

        checks.push(Check {
            phase: if alpha_side {
                Phase::DepositA
            } else {
                Phase::DepositB
            },
            tx_id: deposit_tx.clone(),
            found: report.found,
            confirmed: report.confirmed,
            block_number: report.block_number,
            effect_ok: effect_ok && report.status == Some(ledger::TxStatus::Ok),
        });
    }

    for claim_tx in &side.claim_txs {
        let report = adapter
            .verify_tx(claim_tx)
            .await
            .map_err(anyhow::Error::new)?;
        let effect_ok = snapshot
            .as_ref()
            .map(|snapshot| snapshot.claims.iter().any(|claim| &claim.tx_id == claim_tx))
            .unwrap_or(false);

        checks.push(Check {
            phase: if alpha_side {
                Phase::ClaimA
            } else {
                Phase::ClaimB
            },
            tx_id: claim_tx.clone(),
            found: report.found,
            confirmed: report.confirmed,
            block_number: report.block_number,
            effect_ok,
        });
    }

    if order.status == Status::Completed {
        // A completed order implies both escrows drained; surface a
        // mismatch even if every individual transaction checks out.
        if let Some(snapshot) = &snapshot {
            if !snapshot.remaining.is_zero() {
                if let Some(deposit_tx) = &side.deposit_tx {
                    checks.push(Check {
                        phase: if alpha_side {
                            Phase::ClaimA
                        } else {
                            Phase::ClaimB
                        },
                        tx_id: deposit_tx.clone(),
                        found: true,
                        confirmed: true,
                        block_number: None,
                        effect_ok: false,
                    });
                }
            }
        }
    }

    if let Some(refund_tx) = &side.refund_tx {
        let report = adapter
            .verify_tx(refund_tx)
            .await
            .map_err(anyhow::Error::new)?;
        let effect_ok = snapshot
            .as_ref()
            .map(|snapshot| {
                snapshot.status == crate::escrow::Status::Refunded
                    && snapshot.refund_tx.as_ref() == Some(refund_tx)
            })
            .unwrap_or(false);

        checks.push(Check {
            phase: if alpha_side {
                Phase::RefundA
            } else {
                Phase::RefundB
            },
            tx_id: refund_tx.clone(),
            found: report.found,
            confirmed: report.confirmed,
            block_number: report.block_number,
            effect_ok,
        });
    }

    Ok(())
}

async fn observe<L>(adapter: &L, escrow_id: &EscrowId) -> Option<ledger::Snapshot>
where
    L: Adapter,
{
    adapter.observe(escrow_id).await.ok()
}
