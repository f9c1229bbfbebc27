use anyhow::Context;
use std::path::{Path, PathBuf};

// Linux: /home/<user>/.config/ambrosia/
// OSX: /Users/<user>/Library/Preferences/ambrosia/
fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "ambrosia")
        .map(|proj_dirs| proj_dirs.config_dir().to_path_buf())
}

pub fn default_config_path() -> anyhow::Result<PathBuf> {
    config_dir()
        .map(|dir| Path::join(&dir, "config.toml"))
        .context("could not generate the default configuration path")
}

// Linux: /home/<user>/.local/share/ambrosia/
// OSX: /Users/<user>/Library/Application Support/ambrosia/
pub fn data_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "ambrosia")
        .map(|proj_dirs| proj_dirs.data_dir().to_path_buf())
}

pub fn ensure_directory_exists(file: &Path) -> Result<(), std::io::Error> {
    if let Some(path) = file.parent() {
        if !path.exists() {
            tracing::info!(
                "parent directory does not exist, creating recursively: {}",
                file.display()
            );
            return std::fs::create_dir_all(path);
        }
    }
    Ok(())
}
