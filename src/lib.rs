#![warn(
    unused_extern_crates,
    missing_debug_implementations,
    missing_copy_implementations,
    rust_2018_idioms,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::fallible_impl_from,
    clippy::cast_precision_loss,
    clippy::cast_possible_wrap,
    clippy::dbg_macro
)]
#![forbid(unsafe_code)]

pub mod amount;
pub mod config;
pub mod database;
pub mod escrow;
pub mod event;
pub mod fs;
pub mod history;
pub mod ledger;
pub mod options;
pub mod order;
pub mod secret;
pub mod secret_hash;
pub mod swap;
pub mod timestamp;
pub mod trace;
pub mod verify;

pub use amount::Amount;
pub use database::Database;
pub use order::{Order, OrderId};
pub use secret::Secret;
pub use secret_hash::{HashAlgorithm, SecretHash};
pub use swap::Coordinator;
pub use timestamp::Timestamp;
