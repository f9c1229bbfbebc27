use crate::{config::Data, secret_hash::HashAlgorithm};
use config as config_rs;
use serde::{Deserialize, Serialize};
use std::{ffi::OsStr, path::Path};
use url::Url;

/// This struct aims to represent the configuration file as it appears on
/// disk.
///
/// Most importantly, optional elements of the configuration file are
/// represented as `Option`s here. This allows us to create a dedicated
/// step for filling in default values for absent configuration options.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct File {
    pub data: Option<Data>,
    pub logging: Option<Logging>,
    pub swap: Option<Swap>,
    pub ledger_a: Option<Ledger>,
    pub ledger_b: Option<Ledger>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Ledger {
    pub name: Option<String>,
    pub node_url: Option<Url>,
    pub confirmations: Option<u32>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Swap {
    pub hash_algorithm: Option<HashAlgorithm>,
    pub timelock_a_ms: Option<u64>,
    pub timelock_b_ms: Option<u64>,
    pub safety_margin_ms: Option<u64>,
    pub partial_fills_allowed: Option<bool>,
    pub max_retries: Option<u32>,
    pub retry_initial_backoff_ms: Option<u64>,
    pub retry_max_backoff_ms: Option<u64>,
    pub order_retention_ms: Option<u64>,
}

impl File {
    pub fn default() -> Self {
        File {
            data: None,
            logging: None,
            swap: None,
            ledger_a: None,
            ledger_b: None,
        }
    }

    pub fn read<D>(config_file: D) -> Result<Self, config_rs::ConfigError>
    where
        D: AsRef<OsStr>,
    {
        let config_file = Path::new(&config_file);

        config_rs::Config::builder()
            .add_source(config_rs::File::from(config_file))
            .build()?
            .try_deserialize()
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct Logging {
    pub level: Option<Level>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub enum Level {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<Level> for log::LevelFilter {
    fn from(level: Level) -> Self {
        match level {
            Level::Error => log::LevelFilter::Error,
            Level::Warn => log::LevelFilter::Warn,
            Level::Info => log::LevelFilter::Info,
            Level::Debug => log::LevelFilter::Debug,
            Level::Trace => log::LevelFilter::Trace,
        }
    }
}
