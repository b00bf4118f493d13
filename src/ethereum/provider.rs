use crate::config::{Config, NetworkConfig};
use alloy::{
    providers::{ProviderBuilder, RootProvider},
    transports::http::{Client, Http},
};
use anyhow::{anyhow, Result};
use std::collections::HashMap;

/// One HTTP provider per configured network, built once at startup.
#[derive(Debug)]
pub struct ProviderManager {
    providers: HashMap<String, RootProvider<Http<Client>>>,
    networks: HashMap<String, NetworkConfig>,
    default_network: String,
}

impl ProviderManager {
    pub fn new(config: &Config) -> Result<Self> {
        let mut providers = HashMap::new();

        for (network_name, network_config) in &config.networks {
            let url = network_config.rpc_url.parse().map_err(|e| {
                anyhow!(
                    "Invalid RPC URL for network '{}': {}",
                    network_name,
                    e
                )
            })?;
            providers.insert(network_name.clone(), ProviderBuilder::new().on_http(url));
        }

        Ok(Self {
            providers,
            networks: config.networks.clone(),
            default_network: config.default_network.clone(),
        })
    }

    pub fn get_provider(&self, network: Option<&str>) -> Result<&RootProvider<Http<Client>>> {
        let network_name = network.unwrap_or(&self.default_network);
        self.providers.get(network_name).ok_or_else(|| {
            anyhow!(
                "Network '{}' not found. Available networks: {}",
                network_name,
                self.get_available_networks().join(", ")
            )
        })
    }

    pub fn default_network(&self) -> &str {
        &self.default_network
    }

    pub fn get_available_networks(&self) -> Vec<String> {
        let mut names: Vec<String> = self.networks.keys().cloned().collect();
        names.sort();
        names
    }
}
