pub mod file;
pub mod settings;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub use self::{file::File, settings::Settings};

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Data {
    pub dir: PathBuf,
}

pub fn read_config(config_file: &Option<PathBuf>) -> anyhow::Result<File> {
    // if the user specifies a config path, use it
    if let Some(path) = config_file {
        eprintln!("Using config file {}", path.display());

        return File::read(path)
            .with_context(|| format!("failed to read config file {}", path.display()));
    }

    // try to load default config
    let default_path = crate::fs::default_config_path()?;

    if !default_path.exists() {
        return Ok(File::default());
    }

    eprintln!(
        "Using config file at default path: {}",
        default_path.display()
    );

    File::read(&default_path)
        .with_context(|| format!("failed to read config file {}", default_path.display()))
}
