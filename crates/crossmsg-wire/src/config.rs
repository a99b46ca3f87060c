//! Messenger configuration loading from TOML, with defaults.

use crossmsg_types::MessengerConfig;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

/// Errors from strict configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Parse a TOML document. Missing fields take their defaults.
pub fn parse_config(contents: &str) -> Result<MessengerConfig, ConfigError> {
    Ok(toml::from_str(contents)?)
}

/// Read and parse the TOML file at `path`.
pub fn read_config(path: &Path) -> Result<MessengerConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents)
}

/// Load messenger configuration from `path`, falling back to defaults.
///
/// A missing file, unreadable file or invalid TOML is logged and never
/// fatal.
pub fn load_config(path: Option<&Path>) -> MessengerConfig {
    let Some(path) = path else {
        return MessengerConfig::default();
    };
    if !path.exists() {
        info!(path = %path.display(), "Config file not found, using defaults");
        return MessengerConfig::default();
    }
    match read_config(path) {
        Ok(config) => {
            info!(path = %path.display(), "Loaded messenger configuration");
            config
        }
        Err(e) => {
            warn!(
                error = %e,
                path = %path.display(),
                "Failed to load config, using defaults"
            );
            MessengerConfig::default()
        }
    }
}
