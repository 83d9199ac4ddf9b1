use std::path::PathBuf;

use anyhow::{Context, Result};

/// Returns the config directory: ~/.config/termbridge
pub fn config_dir() -> Result<PathBuf> {
    let config = dirs::config_dir().context("Could not determine config directory")?;
    Ok(config.join("termbridge"))
}

/// Returns the default config path: ~/.config/termbridge/config.toml
pub fn default_config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}
