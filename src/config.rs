//! Configuration loading.
//!
//! Out of scope per the domain design (§1): this module is the ambient
//! plumbing a runnable binary needs, not a CLI/flag design exercise. The CLI
//! surface is a single `--config` flag (`clap`, mirroring the example
//! facilitator's `CliArgs`), and secrets may be literals or `$ENV_VAR` /
//! `${ENV_VAR}` references resolved at load time.

use std::collections::HashMap;
use std::fs;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use clap::Parser;
use serde::Deserialize;

use crate::error::FatalConfigError;
use crate::extractor::FactorySignature;

#[derive(Parser, Debug)]
#[command(name = "contract-watch")]
#[command(about = "Multi-chain EVM contract deployment discovery, classification, and attribution")]
struct CliArgs {
    /// Path to the JSON configuration file.
    #[arg(long, short, env = "CONFIG", default_value = "config.json")]
    config: PathBuf,
}

/// A config value that may be a literal or a `$VAR` / `${VAR}` environment
/// variable reference, resolved during deserialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiteralOrEnv<T>(T);

impl<T> LiteralOrEnv<T> {
    pub fn into_inner(self) -> T {
        self.0
    }

    fn parse_env_var_syntax(s: &str) -> Option<String> {
        if let Some(stripped) = s.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
            Some(stripped.to_string())
        } else if let Some(name) = s.strip_prefix('$') {
            if !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_') {
                Some(name.to_string())
            } else {
                None
            }
        } else {
            None
        }
    }
}

impl<T> Deref for LiteralOrEnv<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.0
    }
}

impl<'de, T> Deserialize<'de> for LiteralOrEnv<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        let resolved = match Self::parse_env_var_syntax(&raw) {
            Some(var_name) => std::env::var(&var_name)
                .map_err(|_| serde::de::Error::custom(format!("environment variable '{var_name}' not set")))?,
            None => raw,
        };
        let value = resolved
            .parse::<T>()
            .map_err(|e| serde::de::Error::custom(format!("{e}")))?;
        Ok(LiteralOrEnv(value))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// Ordered RPC endpoint URLs; the adapter fails over left to right.
    pub rpc_endpoints: Vec<url::Url>,
    /// `eip155` is the only supported family today; others are skipped with
    /// a warning at startup (§6: "non-EVM chain list").
    #[serde(default = "default_family")]
    pub family: String,
}

fn default_family() -> String {
    "eip155".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttributionConfig {
    pub base_url: url::Url,
    #[serde(default)]
    pub api_key: Option<LiteralOrEnv<String>>,
}

fn default_block_check_interval_secs() -> u64 {
    12
}

fn default_batch_size() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_persistence_location() -> String {
    "sqlite://contract-watch.db".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Configured chain name -> chain config.
    pub chains: HashMap<String, ChainConfig>,
    /// Subset of `chains` keys to run; `["all"]` selects every EVM chain.
    #[serde(default = "default_chain_selection")]
    pub chain_selection: Vec<String>,
    pub attribution: AttributionConfig,
    /// Opaque persistence URI, e.g. `sqlite://contract-watch.db`.
    #[serde(default = "default_persistence_location")]
    pub persistence_location: String,
    #[serde(default = "default_block_check_interval_secs")]
    pub block_check_interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Configurable factory-event signature registry (design notes, §9).
    #[serde(default)]
    pub factory_signatures: Vec<FactorySignatureConfig>,
}

fn default_chain_selection() -> Vec<String> {
    vec!["all".to_string()]
}

#[derive(Debug, Clone, Deserialize)]
pub struct FactorySignatureConfig {
    pub topic0: String,
    pub child_word_offset: usize,
    #[serde(default)]
    pub deployer_word_offset: Option<usize>,
}

impl From<FactorySignatureConfig> for FactorySignature {
    fn from(c: FactorySignatureConfig) -> Self {
        FactorySignature {
            topic0: c.topic0.to_lowercase(),
            child_word_offset: c.child_word_offset,
            deployer_word_offset: c.deployer_word_offset,
        }
    }
}

impl Config {
    /// Loads configuration from the `--config` CLI flag (or `CONFIG` env
    /// var), defaulting to `config.json`.
    pub fn load() -> Result<Self, FatalConfigError> {
        let cli_args = CliArgs::parse();
        Self::load_from_path(&cli_args.config)
    }

    fn load_from_path(path: &Path) -> Result<Self, FatalConfigError> {
        let content = fs::read_to_string(path).map_err(|source| FatalConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Chains to actually run: the configured selection, resolved against
    /// the EVM-family subset of `self.chains`. Non-EVM families are skipped
    /// with a warning, matching the external-interface contract (§6).
    pub fn selected_chains(&self) -> Vec<(String, ChainConfig)> {
        let evm_chains: Vec<(String, ChainConfig)> = self
            .chains
            .iter()
            .filter_map(|(name, cfg)| {
                if cfg.family == "eip155" {
                    Some((name.clone(), cfg.clone()))
                } else {
                    tracing::warn!(chain = name, family = %cfg.family, "skipping non-EVM chain");
                    None
                }
            })
            .collect();

        if self.chain_selection.iter().any(|s| s == "all") {
            return evm_chains;
        }

        evm_chains
            .into_iter()
            .filter(|(name, _)| self.chain_selection.contains(name))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_or_env_resolves_braced_reference() {
        // SAFETY: test-only, single-threaded access to a unique var name.
        unsafe { std::env::set_var("CW_TEST_TOKEN", "secret-value") };
        let json = serde_json::json!("${CW_TEST_TOKEN}");
        let value: LiteralOrEnv<String> = serde_json::from_value(json).unwrap();
        assert_eq!(value.into_inner(), "secret-value");
        unsafe { std::env::remove_var("CW_TEST_TOKEN") };
    }

    #[test]
    fn literal_or_env_passes_through_plain_literal() {
        let json = serde_json::json!("plain-value");
        let value: LiteralOrEnv<String> = serde_json::from_value(json).unwrap();
        assert_eq!(value.into_inner(), "plain-value");
    }

    #[test]
    fn selected_chains_skips_non_evm_families() {
        let mut chains = HashMap::new();
        chains.insert(
            "ethereum".to_string(),
            ChainConfig { rpc_endpoints: vec![url::Url::parse("http://localhost:8545").unwrap()], family: "eip155".to_string() },
        );
        chains.insert(
            "solana-mainnet".to_string(),
            ChainConfig { rpc_endpoints: vec![url::Url::parse("http://localhost:8899").unwrap()], family: "solana".to_string() },
        );
        let config = Config {
            chains,
            chain_selection: default_chain_selection(),
            attribution: AttributionConfig { base_url: url::Url::parse("http://localhost:9000").unwrap(), api_key: None },
            persistence_location: default_persistence_location(),
            block_check_interval_secs: default_block_check_interval_secs(),
            batch_size: default_batch_size(),
            log_level: default_log_level(),
            factory_signatures: Vec::new(),
        };

        let selected = config.selected_chains();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].0, "ethereum");
    }
}
