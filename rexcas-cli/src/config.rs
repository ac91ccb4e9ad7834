//! Configuration management
//!
//! Handles storing and loading CLI configuration.
//! Config directory: ~/.rexcas/ (cross-platform)
//!
//! Config file format (~/.rexcas/config.toml):
//! ```toml
//! [client]
//! concurrency_limit = 500
//! max_batch_size = 4194304
//!
//! [client.rpc_timeouts]
//! default = "30s"
//! Read = "0"
//!
//! [cli]
//! store_path = "/home/me/.rexcas/store"
//! persist_file_cache = true
//! ```

use anyhow::{Context, Result};
use rexcas_client::ClientConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Structure of ~/.rexcas/config.toml
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RexcasConfig {
    /// Transfer engine settings
    #[serde(default)]
    pub client: ClientConfig,

    /// CLI-specific settings
    #[serde(default)]
    pub cli: CliSettings,
}

/// CLI-specific settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliSettings {
    /// Directory of the local blob store
    #[serde(default)]
    pub store_path: Option<PathBuf>,

    /// Keep file digests in the store across runs
    #[serde(default = "default_persist_file_cache")]
    pub persist_file_cache: bool,
}

impl Default for CliSettings {
    fn default() -> Self {
        Self {
            store_path: None,
            persist_file_cache: default_persist_file_cache(),
        }
    }
}

fn default_persist_file_cache() -> bool {
    true
}

impl RexcasConfig {
    /// Store directory: config value, else ~/.rexcas/store
    pub fn store_path(&self) -> Result<PathBuf> {
        match &self.cli.store_path {
            Some(path) => Ok(path.clone()),
            None => Ok(config_dir()?.join("store")),
        }
    }
}

/// Get the config directory path (~/.rexcas/)
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    let config_dir = home.join(".rexcas");

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir).context("Failed to create config directory ~/.rexcas/")?;
    }

    Ok(config_dir)
}

/// Get the config file path
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

/// Load configuration from file, falling back to defaults if it doesn't exist.
/// Environment overrides are applied on top.
pub fn load_config() -> RexcasConfig {
    let mut config = match config_file_path() {
        Ok(path) if path.exists() => match fs::read_to_string(&path) {
            Ok(content) => parse_config(&content).unwrap_or_else(|e| {
                eprintln!("Warning: Failed to parse config file: {:#}", e);
                RexcasConfig::default()
            }),
            Err(e) => {
                eprintln!("Warning: Failed to read config file: {}", e);
                RexcasConfig::default()
            }
        },
        _ => RexcasConfig::default(),
    };
    config.client = config.client.with_env_overrides();
    config
}

/// Parse the contents of a config file
pub fn parse_config(content: &str) -> Result<RexcasConfig> {
    toml::from_str(content).context("Invalid config file")
}

/// Save configuration to file
pub fn save_config(config: &RexcasConfig) -> Result<()> {
    let path = config_file_path()?;
    let content = toml::to_string_pretty(config).context("Failed to serialize config")?;
    fs::write(&path, content).context("Failed to write config file")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RexcasConfig::default();
        assert_eq!(config.client, ClientConfig::default());
        assert!(config.cli.store_path.is_none());
        assert!(config.cli.persist_file_cache);
    }

    #[test]
    fn test_config_serialization() {
        let config = RexcasConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();

        assert!(toml_str.contains("[client]"));
        assert!(toml_str.contains("[cli]"));
        assert!(toml_str.contains("concurrency_limit"));

        let parsed = parse_config(&toml_str).unwrap();
        assert_eq!(parsed.client, config.client);
    }

    #[test]
    fn test_partial_config() {
        let parsed = parse_config(
            r#"
            [client]
            concurrency_limit = 16

            [client.rpc_timeouts]
            default = "30s"

            [cli]
            store_path = "/tmp/rexcas-store"
            "#,
        )
        .unwrap();

        assert_eq!(parsed.client.concurrency_limit, 16);
        assert_eq!(parsed.client.rpc_timeouts["default"], "30s");
        assert_eq!(
            parsed.store_path().unwrap(),
            PathBuf::from("/tmp/rexcas-store")
        );
        assert!(parsed.cli.persist_file_cache);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(parse_config("[client]\nconcurrency_limit = \"many\"").is_err());
    }
}
