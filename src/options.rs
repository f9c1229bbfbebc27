use crate::order::OrderId;
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
#[structopt(name = "ambrosia", about = "Atomic cross-chain swap coordinator")]
pub struct Options {
    /// Path to configuration file
    #[structopt(short = "c", long = "config", parse(from_os_str))]
    pub config_file: Option<PathBuf>,
    #[structopt(subcommand)]
    pub cmd: Command,
}

#[derive(StructOpt, Debug, Clone)]
pub enum Command {
    /// Create a new order and drive it to a terminal status
    Start {
        /// Token symbol on ledger A
        #[structopt(long = "token-a")]
        token_a: String,
        /// Token symbol on ledger B
        #[structopt(long = "token-b")]
        token_b: String,
        /// Amount to lock on ledger A, in base units
        #[structopt(long = "amount-a")]
        amount_a: u64,
        /// Amount to lock on ledger B, in base units
        #[structopt(long = "amount-b")]
        amount_b: u64,
        /// The counterparty's claim address on ledger B, as quoted
        #[structopt(long = "counterparty-b")]
        counterparty_b: String,
    },
    /// Print the stored state of an order
    Status { order_id: OrderId },
    /// Re-check an order's transactions against both ledgers
    Verify { order_id: OrderId },
    /// Force an order onto the refund path (only legal after its
    /// timelocks have passed)
    Refund { order_id: OrderId },
    /// Abort an order that has not locked any funds yet
    Cancel { order_id: OrderId },
    /// Show wallet addresses and balances on both ledgers
    Balance,
}
