use crate::{
    config::{file, Data, File},
    secret_hash::HashAlgorithm,
    swap::{ExecutionParams, RetryPolicy},
};
use log::LevelFilter;
use std::time::Duration;
use url::Url;

/// Configuration faults are fatal at startup and map to exit code 2;
/// the runtime never sees an invalid `Settings`.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum Error {
    #[error(
        "invalid timelock ordering: timelock_b ({timelock_b_ms}ms) + safety margin \
         ({safety_margin_ms}ms) must not exceed timelock_a ({timelock_a_ms}ms)"
    )]
    TimelockOrdering {
        timelock_a_ms: u64,
        timelock_b_ms: u64,
        safety_margin_ms: u64,
    },
    #[error("ledger {0} has no node url configured and no default applies")]
    MissingNodeUrl(String),
    #[error("data directory could not be determined")]
    MissingDataDir,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    pub data: Data,
    pub logging: Logging,
    pub swap: Swap,
    pub ledger_a: Ledger,
    pub ledger_b: Ledger,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Logging {
    pub level: LevelFilter,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::Info,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Ledger {
    pub name: String,
    pub node_url: Url,
    pub confirmations: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Swap {
    pub hash_algorithm: HashAlgorithm,
    pub timelock_a_ms: u64,
    pub timelock_b_ms: u64,
    pub safety_margin_ms: u64,
    pub partial_fills_allowed: bool,
    pub max_retries: u32,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    pub order_retention_ms: u64,
}

impl Default for Swap {
    fn default() -> Self {
        Swap {
            hash_algorithm: HashAlgorithm::Sha256,
            timelock_a_ms: 3_600_000,
            timelock_b_ms: 1_800_000,
            safety_margin_ms: 300_000,
            partial_fills_allowed: false,
            max_retries: 10,
            retry_initial_backoff_ms: 500,
            retry_max_backoff_ms: 30_000,
            order_retention_ms: 7 * 24 * 3_600_000,
        }
    }
}

fn default_node_url(port: u16) -> Url {
    let url = format!("http://localhost:{}", port);
    url.parse().expect("static string to be a valid url")
}

impl Settings {
    pub fn from_config_file_and_defaults(file: File) -> Result<Self, Error> {
        let File {
            data,
            logging,
            swap,
            ledger_a,
            ledger_b,
        } = file;

        let data = match data {
            Some(data) => data,
            None => Data {
                dir: crate::fs::data_dir().ok_or(Error::MissingDataDir)?,
            },
        };

        let logging = logging
            .and_then(|logging| logging.level)
            .map(|level| Logging {
                level: level.into(),
            })
            .unwrap_or_default();

        let defaults = Swap::default();
        let swap = match swap {
            Some(file::Swap {
                hash_algorithm,
                timelock_a_ms,
                timelock_b_ms,
                safety_margin_ms,
                partial_fills_allowed,
                max_retries,
                retry_initial_backoff_ms,
                retry_max_backoff_ms,
                order_retention_ms,
            }) => Swap {
                hash_algorithm: hash_algorithm.unwrap_or(defaults.hash_algorithm),
                timelock_a_ms: timelock_a_ms.unwrap_or(defaults.timelock_a_ms),
                timelock_b_ms: timelock_b_ms.unwrap_or(defaults.timelock_b_ms),
                safety_margin_ms: safety_margin_ms.unwrap_or(defaults.safety_margin_ms),
                partial_fills_allowed: partial_fills_allowed
                    .unwrap_or(defaults.partial_fills_allowed),
                max_retries: max_retries.unwrap_or(defaults.max_retries),
                retry_initial_backoff_ms: retry_initial_backoff_ms
                    .unwrap_or(defaults.retry_initial_backoff_ms),
                retry_max_backoff_ms: retry_max_backoff_ms
                    .unwrap_or(defaults.retry_max_backoff_ms),
                order_retention_ms: order_retention_ms.unwrap_or(defaults.order_retention_ms),
            },
            None => defaults,
        };

        if swap.timelock_b_ms + swap.safety_margin_ms > swap.timelock_a_ms {
            return Err(Error::TimelockOrdering {
                timelock_a_ms: swap.timelock_a_ms,
                timelock_b_ms: swap.timelock_b_ms,
                safety_margin_ms: swap.safety_margin_ms,
            });
        }

        let ledger_a = ledger_from_file(ledger_a, "ledger-a", 18900);
        let ledger_b = ledger_from_file(ledger_b, "ledger-b", 18901);

        Ok(Settings {
            data,
            logging,
            swap,
            ledger_a,
            ledger_b,
        })
    }

    pub fn execution_params(&self) -> ExecutionParams {
        ExecutionParams {
            hash_algorithm: self.swap.hash_algorithm,
            timelock_a_ms: self.swap.timelock_a_ms,
            timelock_b_ms: self.swap.timelock_b_ms,
            safety_margin_ms: self.swap.safety_margin_ms,
            confirmations_a: self.ledger_a.confirmations,
            confirmations_b: self.ledger_b.confirmations,
            partial_fills_allowed: self.swap.partial_fills_allowed,
            retry: RetryPolicy {
                max_retries: self.swap.max_retries,
                initial_backoff: Duration::from_millis(self.swap.retry_initial_backoff_ms),
                max_backoff: Duration::from_millis(self.swap.retry_max_backoff_ms),
            },
            poll_interval: Duration::from_secs(1),
        }
    }
}

fn ledger_from_file(ledger: Option<file::Ledger>, default_name: &str, default_port: u16) -> Ledger {
    let ledger = ledger.unwrap_or(file::Ledger {
        name: None,
        node_url: None,
        confirmations: None,
    });

    Ledger {
        name: ledger.name.unwrap_or_else(|| default_name.to_owned()),
        node_url: ledger
            .node_url
            .unwrap_or_else(|| default_node_url(default_port)),
        confirmations: ledger.confirmations.unwrap_or(1),
    }
}
