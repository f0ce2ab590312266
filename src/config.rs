//! Configuration for the allocator server.
//!
//! Settings come from a JSON config file whose fields all carry serde
//! defaults that fall back to environment variables, then to hardcoded
//! defaults. A missing config file is fine; everything can run off the
//! environment. `.env` values are loaded by the entrypoint before this
//! module reads anything.

use alloy_primitives::B256;
use alloy_signer_local::PrivateKeySigner;
use clap::Parser;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use url::Url;

use crate::service::FinalizationThresholds;

/// CLI arguments for the allocator server.
#[derive(Parser, Debug)]
#[command(name = "compact-allocator")]
#[command(about = "Resource-lock allocator HTTP server for The Compact")]
struct CliArgs {
    /// Path to the JSON configuration file
    #[arg(long, short, env = "CONFIG", default_value = "config.json")]
    config: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("No signer key configured: set PRIVATE_KEY or the signerKey config field")]
    MissingSignerKey,
    #[error("Invalid signer key: {0}")]
    InvalidSignerKey(String),
    #[error("Invalid finalization threshold chain key {0:?}")]
    InvalidThresholdChain(String),
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "config_defaults::default_host")]
    host: IpAddr,
    #[serde(default = "config_defaults::default_port")]
    port: u16,
    #[serde(default = "config_defaults::default_database")]
    database: PathBuf,
    #[serde(default = "config_defaults::default_indexer_url")]
    indexer_url: Url,
    #[serde(default = "config_defaults::default_signer_key")]
    signer_key: Option<EvmPrivateKey>,
    #[serde(default)]
    finalization: FinalizationConfig,
}

mod config_defaults {
    use super::EvmPrivateKey;
    use std::net::IpAddr;
    use std::path::PathBuf;
    use url::Url;

    pub fn default_host() -> IpAddr {
        std::env::var("HOST")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_else(|| "0.0.0.0".parse().expect("valid fallback host"))
    }

    pub fn default_port() -> u16 {
        std::env::var("PORT")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(8080)
    }

    pub fn default_database() -> PathBuf {
        std::env::var("DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("allocator.db3"))
    }

    pub fn default_indexer_url() -> Url {
        std::env::var("INDEXER_URL")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_else(|| {
                Url::parse("http://localhost:42069/graphql").expect("valid fallback url")
            })
    }

    pub fn default_signer_key() -> Option<EvmPrivateKey> {
        std::env::var("PRIVATE_KEY")
            .ok()
            .and_then(|raw| raw.parse().ok())
    }
}

impl Config {
    /// Loads configuration from the path given by `--config`/`CONFIG`,
    /// falling back to environment variables when the file is absent.
    pub fn load() -> Result<Self, ConfigError> {
        let args = CliArgs::parse();
        Self::load_from(&args.config)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let config: Config = if path.exists() {
            serde_json::from_str(&fs::read_to_string(path)?)?
        } else {
            serde_json::from_value(serde_json::json!({}))?
        };
        Ok(config)
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn database(&self) -> &Path {
        &self.database
    }

    pub fn indexer_url(&self) -> &Url {
        &self.indexer_url
    }

    /// Builds the signing key. Fails when no key is configured at all.
    pub fn signer(&self) -> Result<PrivateKeySigner, ConfigError> {
        let key = self
            .signer_key
            .as_ref()
            .ok_or(ConfigError::MissingSignerKey)?;
        PrivateKeySigner::from_bytes(&key.0)
            .map_err(|e| ConfigError::InvalidSignerKey(e.to_string()))
    }

    pub fn thresholds(&self) -> Result<FinalizationThresholds, ConfigError> {
        self.finalization.thresholds()
    }
}

/// A 32-byte secp256k1 private key. Debug and Display never print the key.
#[derive(Clone)]
pub struct EvmPrivateKey(B256);

impl fmt::Debug for EvmPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EvmPrivateKey(***)")
    }
}

impl FromStr for EvmPrivateKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim_start_matches("0x");
        let key: B256 = trimmed
            .parse()
            .map_err(|_| "private key must be 32 bytes of hex".to_string())?;
        Ok(EvmPrivateKey(key))
    }
}

impl<'de> Deserialize<'de> for EvmPrivateKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Per-chain settlement grace periods in seconds. On-chain settlement can lag
/// the indexer by roughly one finality interval, so each chain gets its own
/// horizon during which an expired compact still counts as outstanding.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizationConfig {
    #[serde(default = "FinalizationConfig::default_secs")]
    default_secs: u64,
    /// Chain id (decimal string) to threshold seconds.
    #[serde(default)]
    per_chain: HashMap<String, u64>,
}

impl FinalizationConfig {
    fn default_secs() -> u64 {
        25
    }

    fn thresholds(&self) -> Result<FinalizationThresholds, ConfigError> {
        let mut overrides = HashMap::with_capacity(self.per_chain.len());
        for (chain, secs) in &self.per_chain {
            let chain_id: u64 = chain
                .parse()
                .map_err(|_| ConfigError::InvalidThresholdChain(chain.clone()))?;
            overrides.insert(chain_id, *secs);
        }
        Ok(FinalizationThresholds::new(self.default_secs, overrides))
    }
}

impl Default for FinalizationConfig {
    fn default() -> Self {
        Self {
            default_secs: Self::default_secs(),
            per_chain: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChainId;

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(config.port(), 8080);
        assert_eq!(config.database(), Path::new("allocator.db3"));
    }

    #[test]
    fn finalization_overrides_apply_per_chain() {
        let config: Config = serde_json::from_value(serde_json::json!({
            "finalization": {
                "defaultSecs": 25,
                "perChain": { "10": 4, "8453": 2 }
            }
        }))
        .unwrap();
        let thresholds = config.thresholds().unwrap();
        assert_eq!(thresholds.for_chain(ChainId::new(1)), 25);
        assert_eq!(thresholds.for_chain(ChainId::new(10)), 4);
        assert_eq!(thresholds.for_chain(ChainId::new(8453)), 2);
    }

    #[test]
    fn bad_threshold_chain_key_is_rejected() {
        let config: Config = serde_json::from_value(serde_json::json!({
            "finalization": { "perChain": { "not-a-chain": 4 } }
        }))
        .unwrap();
        assert!(matches!(
            config.thresholds(),
            Err(ConfigError::InvalidThresholdChain(_))
        ));
    }

    #[test]
    fn signer_key_parses_with_or_without_prefix() {
        let bare: EvmPrivateKey =
            "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"
                .parse()
                .unwrap();
        let prefixed: EvmPrivateKey =
            "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"
                .parse()
                .unwrap();
        assert_eq!(bare.0, prefixed.0);
        // debug output never leaks the key
        assert_eq!(format!("{bare:?}"), "EvmPrivateKey(***)");
    }

    #[test]
    fn missing_signer_key_fails_closed() {
        let config: Config = serde_json::from_value(serde_json::json!({})).unwrap();
        if std::env::var("PRIVATE_KEY").is_err() {
            assert!(matches!(config.signer(), Err(ConfigError::MissingSignerKey)));
        }
    }
}
