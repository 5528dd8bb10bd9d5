//! Configuration management for the multisig coordinator
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub coordinator: CoordinatorConfig,
    pub chain: ChainConfig,
    pub relay: RelayConfig,
    pub wallet: WalletConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    /// Owner address whose wallet instances this client coordinates.
    pub owner_address: String,
    /// On-chain log polling interval.
    pub poll_interval_ms: u64,
    /// Relay signature-accumulation polling interval.
    pub relay_poll_interval_ms: u64,
    /// How long a submitted transaction may wait for inclusion.
    pub submission_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    pub ws_url: Option<String>,
    /// MultisigWalletFactory address.
    pub factory_address: String,
    /// Block the factory was deployed at; instance discovery replays from here.
    pub factory_deploy_block: u64,
    pub confirmation_blocks: u64,
    pub max_gas_price_gwei: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Base URL of the signature-collection relay.
    pub base_url: String,
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    /// Environment variable holding the signer private key. Absent means
    /// read-only operation: no proposals can be submitted on-chain.
    pub private_key_env: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Settings {
    /// Load settings from the configuration file
    pub fn load() -> Result<Self> {
        let config_path = env::var("MULTISIG_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &PathBuf) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.chain.rpc_urls.is_empty() {
            anyhow::bail!("Chain {} has no RPC URLs configured", self.chain.name);
        }

        if self.chain.factory_address.is_empty() {
            anyhow::bail!("No factory address configured for chain {}", self.chain.name);
        }

        if self.coordinator.owner_address.is_empty() {
            anyhow::bail!("No owner address configured");
        }

        if self.relay.base_url.is_empty() {
            anyhow::bail!("No relay base URL configured");
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TEST_RELAY_HOST", "relay.example.com");
        let input = "base_url = \"https://${TEST_RELAY_HOST}/pool\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "base_url = \"https://relay.example.com/pool\"");
    }

    #[test]
    fn test_load_rejects_missing_factory() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [coordinator]
            owner_address = "0x34aA3F359A9D614239015126635CE7732c18fDF3"
            poll_interval_ms = 2000
            relay_poll_interval_ms = 3000
            submission_timeout_secs = 90

            [chain]
            chain_id = 31337
            name = "localhost"
            rpc_urls = ["http://127.0.0.1:8545"]
            factory_address = ""
            factory_deploy_block = 0
            confirmation_blocks = 1
            max_gas_price_gwei = 100

            [relay]
            base_url = "http://127.0.0.1:49832"
            request_timeout_ms = 5000

            [wallet]

            [api]
            host = "127.0.0.1"
            port = 8080

            [metrics]
            enabled = false
            port = 9090
            "#
        )
        .unwrap();

        let err = Settings::load_from(&file.path().to_path_buf()).unwrap_err();
        assert!(err.to_string().contains("factory address"));
    }
}
