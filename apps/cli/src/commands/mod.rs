//! Command implementations for the cachet CLI.

pub mod config;
pub mod walkthrough;

use std::path::Path;

use cachet_core::{CacheServiceConfig, load_service_config};

/// Loads configuration under `root`, applies environment overrides, and
/// validates the result.
pub fn load_config(root: &Path) -> anyhow::Result<CacheServiceConfig> {
    let mut config = load_service_config(root)?;
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}
