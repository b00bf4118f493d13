use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub networks: HashMap<String, NetworkConfig>,
    pub default_network: String,
    pub security: SecurityConfig,
    pub broadcast: BroadcastConfig,
    pub simulation: SimulationConfig,
    pub lookup: LookupConfig,
    pub game: GameConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub rpc_url: String,
    pub chain_id: u64,
    pub explorer_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub allow_broadcast: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Extra attempts after the first one.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_jitter_ms: u64,
    /// Sequential sends are spaced to stay under this budget.
    pub transactions_per_minute: Option<u32>,
    pub request_timeout_secs: u64,
    pub endpoints: EndpointConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub bitcoin_provider: String,
    pub mempool_api_url: String,
    pub blockcypher_api_url: String,
    pub bitcoin_com_api_url: String,
    pub solana_rpc_url: String,
    pub xrp_rpc_url: String,
    pub stellar_horizon_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub trace: bool,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupConfig {
    pub concurrency: usize,
    pub mempool_api_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameConfig {
    pub contract_address: Option<String>,
    pub network: Option<String>,
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub transport: String,
}

impl Default for Config {
    fn default() -> Self {
        let mut networks = HashMap::new();

        networks.insert(
            "ethereum".to_string(),
            NetworkConfig {
                rpc_url: "https://eth-mainnet.g.alchemy.com/v2/demo".to_string(),
                chain_id: 1,
                explorer_url: Some("https://etherscan.io".to_string()),
            },
        );

        networks.insert(
            "sepolia".to_string(),
            NetworkConfig {
                rpc_url: "https://eth-sepolia.g.alchemy.com/v2/demo".to_string(),
                chain_id: 11155111,
                explorer_url: Some("https://sepolia.etherscan.io".to_string()),
            },
        );

        networks.insert(
            "base".to_string(),
            NetworkConfig {
                rpc_url: "https://mainnet.base.org".to_string(),
                chain_id: 8453,
                explorer_url: Some("https://basescan.org".to_string()),
            },
        );

        networks.insert(
            "polygon".to_string(),
            NetworkConfig {
                rpc_url: "https://polygon-mainnet.g.alchemy.com/v2/demo".to_string(),
                chain_id: 137,
                explorer_url: Some("https://polygonscan.com".to_string()),
            },
        );

        networks.insert(
            "arbitrum".to_string(),
            NetworkConfig {
                rpc_url: "https://arb-mainnet.g.alchemy.com/v2/demo".to_string(),
                chain_id: 42161,
                explorer_url: Some("https://arbiscan.io".to_string()),
            },
        );

        Self {
            networks,
            default_network: "ethereum".to_string(),
            security: SecurityConfig {
                allow_broadcast: false,
            },
            broadcast: BroadcastConfig {
                max_retries: 3,
                base_delay_ms: 1000,
                max_jitter_ms: 1000,
                transactions_per_minute: Some(60),
                request_timeout_secs: 30,
                endpoints: EndpointConfig {
                    bitcoin_provider: "mempool".to_string(),
                    mempool_api_url: "https://mempool.space/api".to_string(),
                    blockcypher_api_url: "https://api.blockcypher.com/v1/btc/main".to_string(),
                    bitcoin_com_api_url: "https://rest.bitcoin.com/v2".to_string(),
                    solana_rpc_url: "https://api.mainnet-beta.solana.com".to_string(),
                    xrp_rpc_url: "https://s1.ripple.com:51234".to_string(),
                    stellar_horizon_url: "https://horizon.stellar.org".to_string(),
                },
            },
            simulation: SimulationConfig {
                trace: true,
                request_timeout_secs: 30,
            },
            lookup: LookupConfig {
                concurrency: 5,
                mempool_api_url: "https://mempool.space/api".to_string(),
            },
            game: GameConfig {
                contract_address: None,
                network: None,
                poll_interval_secs: 4,
            },
            server: ServerConfig {
                transport: "stdio".to_string(),
            },
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {:?}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {:?}: {}", path, e))?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)
            .map_err(|e| anyhow!("Failed to serialize config: {}", e))?;

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    anyhow!("Failed to create config directory {:?}: {}", parent, e)
                })?;
            }
        }

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {:?}: {}", path, e))?;

        Ok(())
    }

    /// Load configuration with fallback to default
    pub async fn load_or_default<P: AsRef<Path>>(path: Option<P>) -> Self {
        let mut config = match path {
            Some(path) => match Self::load_from_file(path).await {
                Ok(config) => {
                    tracing::info!("Loaded configuration from file");
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to load config file, using defaults: {}", e);
                    Self::default()
                }
            },
            None => Self::default(),
        };

        config.apply_env_vars();
        config
    }

    /// Network whose chain id matches, if one is configured.
    ///
    /// The default network wins when it matches; otherwise the first match by
    /// name, so the pick does not depend on map order.
    pub fn network_for_chain(&self, chain_id: u64) -> Option<(&String, &NetworkConfig)> {
        if let Some(default) = self
            .networks
            .get_key_value(&self.default_network)
            .filter(|(_, network)| network.chain_id == chain_id)
        {
            return Some(default);
        }
        self.networks
            .iter()
            .filter(|(_, network)| network.chain_id == chain_id)
            .min_by(|(a, _), (b, _)| a.cmp(b))
    }

    fn apply_env_vars(&mut self) {
        if let Ok(api_key) = std::env::var("ALCHEMY_API_KEY") {
            tracing::info!("Using ALCHEMY_API_KEY environment variable for RPC URLs");

            for (network_name, network_config) in &mut self.networks {
                if network_config.rpc_url.contains("alchemy.com/v2/demo") {
                    network_config.rpc_url = network_config
                        .rpc_url
                        .replace("/demo", &format!("/{}", api_key));
                    tracing::debug!("Updated {} RPC URL with API key", network_name);
                } else if network_config.rpc_url.contains("YOUR_API_KEY_HERE") {
                    network_config.rpc_url = network_config
                        .rpc_url
                        .replace("YOUR_API_KEY_HERE", &api_key);
                    tracing::debug!("Updated {} RPC URL with API key", network_name);
                }
            }
        } else {
            for (network_name, network_config) in &self.networks {
                if network_config.rpc_url.contains("/demo") {
                    tracing::warn!("Using demo RPC endpoint for {}, set ALCHEMY_API_KEY environment variable for better reliability", network_name);
                }
            }
        }

        if let Ok(address) = std::env::var("CONTRACT_ADDRESS") {
            tracing::debug!("Using CONTRACT_ADDRESS for the game contract");
            self.game.contract_address = Some(address);
        }

        if let Ok(url) = std::env::var("MEMPOOL_API_URL") {
            tracing::debug!("Using MEMPOOL_API_URL for bitcoin endpoints");
            self.broadcast.endpoints.mempool_api_url = url.clone();
            self.lookup.mempool_api_url = url;
        }
    }

    /// Get default config file path
    pub fn default_config_path() -> Result<std::path::PathBuf> {
        let config_dir =
            dirs::config_dir().ok_or_else(|| anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("rawtx-mcp").join("config.toml"))
    }

    /// Generate a sample configuration file
    pub fn generate_sample() -> String {
        let sample_config = r#"# rawtx-mcp configuration file
# Networks, broadcast policy and collaborator endpoints

# Network used when a tool call names none and the chain id matches nothing
default_network = "ethereum"

[networks.ethereum]
rpc_url = "https://eth-mainnet.g.alchemy.com/v2/YOUR_API_KEY_HERE"
chain_id = 1
explorer_url = "https://etherscan.io"

[networks.sepolia]
rpc_url = "https://eth-sepolia.g.alchemy.com/v2/YOUR_API_KEY_HERE"
chain_id = 11155111
explorer_url = "https://sepolia.etherscan.io"

[networks.base]
rpc_url = "https://mainnet.base.org"
chain_id = 8453
explorer_url = "https://basescan.org"

[networks.polygon]
rpc_url = "https://polygon-mainnet.g.alchemy.com/v2/YOUR_API_KEY_HERE"
chain_id = 137
explorer_url = "https://polygonscan.com"

[networks.arbitrum]
rpc_url = "https://arb-mainnet.g.alchemy.com/v2/YOUR_API_KEY_HERE"
chain_id = 42161
explorer_url = "https://arbiscan.io"

[security]
allow_broadcast = false

[broadcast]
max_retries = 3
base_delay_ms = 1000          # doubled per attempt, capped at 30s
max_jitter_ms = 1000
transactions_per_minute = 60  # omit to send back to back
request_timeout_secs = 30

[broadcast.endpoints]
bitcoin_provider = "mempool"  # mempool | blockcypher | bitcoin.com
mempool_api_url = "https://mempool.space/api"
blockcypher_api_url = "https://api.blockcypher.com/v1/btc/main"
bitcoin_com_api_url = "https://rest.bitcoin.com/v2"
solana_rpc_url = "https://api.mainnet-beta.solana.com"
xrp_rpc_url = "https://s1.ripple.com:51234"
stellar_horizon_url = "https://horizon.stellar.org"

[simulation]
trace = true                  # debug_traceCall, falling back to trace_call
request_timeout_secs = 30

[lookup]
concurrency = 5
mempool_api_url = "https://mempool.space/api"

[game]
# contract_address = "0x..."
# network = "base"
poll_interval_secs = 4

[server]
transport = "stdio"

# Environment variables that can be used:
# ALCHEMY_API_KEY - Your Alchemy API key (replace YOUR_API_KEY_HERE above)
# CONTRACT_ADDRESS - Game contract address
# MEMPOOL_API_URL - Alternative mempool.space compatible API
"#;
        sample_config.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_sample_config_parses() {
        let config: Config = toml::from_str(&Config::generate_sample()).unwrap();
        assert_eq!(config.default_network, "ethereum");
        assert_eq!(config.networks["base"].chain_id, 8453);
        assert_eq!(config.broadcast.max_retries, 3);
        assert_eq!(config.broadcast.transactions_per_minute, Some(60));
        assert!(!config.security.allow_broadcast);
        assert_eq!(config.game.contract_address, None);
    }

    #[test]
    fn test_network_for_chain() {
        let config = Config::default();
        let (name, network) = config.network_for_chain(42161).unwrap();
        assert_eq!(name, "arbitrum");
        assert_eq!(network.chain_id, 42161);
        assert!(config.network_for_chain(999_999).is_none());
    }

    #[test]
    fn test_shared_chain_id_prefers_default_then_name() {
        let mut config = Config::default();
        for name in ["mainnet-b", "mainnet-a"] {
            config.networks.insert(
                name.to_string(),
                NetworkConfig {
                    rpc_url: format!("https://{name}.example"),
                    chain_id: 1,
                    explorer_url: None,
                },
            );
        }
        assert_eq!(config.network_for_chain(1).unwrap().0, "ethereum");

        config.default_network = "base".to_string();
        for _ in 0..10 {
            assert_eq!(config.network_for_chain(1).unwrap().0, "ethereum");
        }

        config.default_network = "mainnet-b".to_string();
        assert_eq!(config.network_for_chain(1).unwrap().0, "mainnet-b");
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.broadcast.transactions_per_minute = None;
        config.lookup.concurrency = 9;
        config.save_to_file(&path).await.unwrap();

        let loaded = Config::load_from_file(&path).await.unwrap();
        assert_eq!(loaded.broadcast.transactions_per_minute, None);
        assert_eq!(loaded.lookup.concurrency, 9);
        assert_eq!(loaded.networks.len(), config.networks.len());
    }

    #[tokio::test]
    async fn test_missing_file_falls_back_to_default() {
        let config = Config::load_or_default(Some("/nonexistent/rawtx-mcp.toml")).await;
        assert_eq!(config.default_network, "ethereum");
    }
}
