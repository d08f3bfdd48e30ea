use anyhow::{Context, Result};
use kbridge_gateways_common::SimulatedGatewayConfig;
use kbridge_market::MarketConfig;
use kbridge_proxy::ServerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Everything the `kbridge` binary can be configured with, one table per
/// component. Missing tables and keys fall back to their defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub market: MarketConfig,
    pub server: ServerConfig,
    pub simulator: SimulatedGatewayConfig,
}

impl BridgeConfig {
    /// Read a TOML config file, or use the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
