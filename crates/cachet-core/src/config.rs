//! Configuration for the context cache service.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Smallest cache the service accepts, in tokens.
pub const DEFAULT_MIN_CACHEABLE_TOKENS: u64 = 32_769;

/// Configuration for the context cache service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheServiceConfig {
    /// Project segment of resource names.
    #[serde(default = "default_project")]
    pub project: String,

    /// Location segment of resource names.
    #[serde(default = "default_location")]
    pub location: String,

    /// Minimum token count for cacheable content (default: 32769).
    #[serde(default = "default_min_cacheable_tokens")]
    pub min_cacheable_tokens: u64,

    /// TTL applied when a cache is created without one (default: 3600 = 60 minutes).
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,

    /// Longest expiration accepted, measured from the request (default: 604800 = 7 days).
    #[serde(default = "default_max_ttl_secs")]
    pub max_ttl_secs: u64,

    /// How often the expiration sweep runs in seconds (default: 5).
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// How long expired caches stay readable before being purged (default: 86400 = 24 hours).
    #[serde(default = "default_expired_retention_secs")]
    pub expired_retention_secs: u64,
}

fn default_project() -> String {
    "local".to_string()
}

fn default_location() -> String {
    "us-central1".to_string()
}

fn default_min_cacheable_tokens() -> u64 {
    DEFAULT_MIN_CACHEABLE_TOKENS
}

fn default_ttl_secs() -> u64 {
    3600 // 60 minutes
}

fn default_max_ttl_secs() -> u64 {
    604_800 // 7 days
}

fn default_sweep_interval_secs() -> u64 {
    5
}

fn default_expired_retention_secs() -> u64 {
    86_400 // 24 hours
}

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error reading config file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Project or location is empty or contains a `/`.
    #[error("Invalid resource segment {field}: {value:?}")]
    InvalidResourceSegment {
        /// Field name.
        field: &'static str,
        /// Offending value.
        value: String,
    },

    /// Minimum cacheable tokens must be > 0.
    #[error("Invalid min_cacheable_tokens: must be greater than 0")]
    InvalidMinTokens,

    /// Default TTL must be > 0 and no longer than the maximum TTL.
    #[error("Invalid default_ttl_secs {default}: must be between 1 and max_ttl_secs ({max})")]
    InvalidDefaultTtl {
        /// Configured default TTL.
        default: u64,
        /// Configured maximum TTL.
        max: u64,
    },

    /// Sweep interval must be > 0.
    #[error("Invalid sweep interval: must be greater than 0")]
    InvalidSweepInterval,
}

impl Default for CacheServiceConfig {
    fn default() -> Self {
        Self {
            project: default_project(),
            location: default_location(),
            min_cacheable_tokens: default_min_cacheable_tokens(),
            default_ttl_secs: default_ttl_secs(),
            max_ttl_secs: default_max_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            expired_retention_secs: default_expired_retention_secs(),
        }
    }
}

impl CacheServiceConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns `ConfigError` if any configuration value is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [("project", &self.project), ("location", &self.location)] {
            if value.is_empty() || value.contains('/') {
                return Err(ConfigError::InvalidResourceSegment { field, value: value.clone() });
            }
        }

        if self.min_cacheable_tokens == 0 {
            return Err(ConfigError::InvalidMinTokens);
        }

        if self.default_ttl_secs == 0 || self.default_ttl_secs > self.max_ttl_secs {
            return Err(ConfigError::InvalidDefaultTtl {
                default: self.default_ttl_secs,
                max: self.max_ttl_secs,
            });
        }

        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::InvalidSweepInterval);
        }

        Ok(())
    }

    /// Get the default TTL as a Duration.
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    /// Get the maximum TTL as a Duration.
    #[must_use]
    pub fn max_ttl(&self) -> Duration {
        Duration::from_secs(self.max_ttl_secs)
    }

    /// Get the sweep interval as a Duration.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Get the expired-entry retention as a Duration.
    #[must_use]
    pub fn expired_retention(&self) -> Duration {
        Duration::from_secs(self.expired_retention_secs)
    }

    /// Prefix shared by every resource name this service issues.
    #[must_use]
    pub fn resource_prefix(&self) -> String {
        format!("projects/{}/locations/{}/cachedContents/", self.project, self.location)
    }

    /// Apply `CACHET_PROJECT` / `CACHET_LOCATION` from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup (the environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(project) = lookup("CACHET_PROJECT").filter(|v| !v.is_empty()) {
            self.project = project;
        }
        if let Some(location) = lookup("CACHET_LOCATION").filter(|v| !v.is_empty()) {
            self.location = location;
        }
    }
}

/// Load service configuration from a root directory.
///
/// Reads the `[context_cache]` table of `<root>/.cachet/config.toml`.
/// If the file or the table is missing, returns the default configuration.
///
/// # Errors
/// Returns error if the config file exists but cannot be read, parsed, or validated.
pub fn load_service_config(root: &Path) -> Result<CacheServiceConfig, ConfigError> {
    let config_path = default_config_path(root);

    if !config_path.exists() {
        return Ok(CacheServiceConfig::default());
    }

    let content = std::fs::read_to_string(&config_path)?;
    let table: toml::Table = toml::from_str(&content)?;

    let Some(section) = table.get("context_cache") else {
        return Ok(CacheServiceConfig::default());
    };

    let config: CacheServiceConfig = section
        .clone()
        .try_into()
        .map_err(ConfigError::TomlParse)?;

    config.validate()?;

    Ok(config)
}

/// Get the default config file path under `root`.
#[must_use]
pub fn default_config_path(root: &Path) -> PathBuf {
    root.join(".cachet").join("config.toml")
}
