//! Configuration management
//!
//! Handles loading and parsing of JSON configuration files. The strategy
//! section stays raw JSON; its grammar belongs to the external strategy
//! editor and is parsed by the `condition` module.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::risk::RiskGateConfig;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub trading: TradingConfig,
    #[serde(default)]
    pub risk: RiskGateConfig,
    #[serde(default)]
    pub backtest: BacktestConfig,
    #[serde(default)]
    pub settlement: SettlementConfig,
    /// Raw strategy payload (conditions + actions), consumed by `condition`
    #[serde(default)]
    pub strategy: serde_json::Value,
}

impl Config {
    /// Load configuration from JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            trading: TradingConfig::default(),
            risk: RiskGateConfig::default(),
            backtest: BacktestConfig::default(),
            settlement: SettlementConfig::default(),
            strategy: serde_json::Value::Null,
        }
    }
}

/// Trading configuration shared by the scheduler and the simulator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    pub initial_capital: f64,
    pub commission_rate: f64,
    pub slippage_rate: f64,
    /// Scheduler tick interval in seconds
    pub tick_interval_secs: u64,
    /// Number of ticks fetched per strategy execution
    pub market_window: usize,
}

impl Default for TradingConfig {
    fn default() -> Self {
        TradingConfig {
            initial_capital: 100_000.0,
            commission_rate: 0.001,  // 0.1%
            slippage_rate: 0.0005,   // 0.05%
            tick_interval_secs: 5,
            market_window: 24,
        }
    }
}

/// Backtest configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub data_dir: String,
    pub results_dir: String,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        BacktestConfig {
            data_dir: "data".to_string(),
            results_dir: "results".to_string(),
        }
    }
}

/// Settlement configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementConfig {
    /// Default distribution policy name (CAPACITY_WEIGHTED,
    /// CONTRIBUTION_WEIGHTED, or EQUAL_SHARE)
    pub default_policy: String,
    /// kg CO2 avoided per unit of disposed volume, fed to the
    /// carbon-accounting collaborator default
    pub carbon_factor_kg: f64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        SettlementConfig {
            default_policy: "CAPACITY_WEIGHTED".to_string(),
            carbon_factor_kg: 0.4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DistributionPolicy;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.trading.initial_capital > 0.0);
        assert!(config.trading.commission_rate > 0.0);
        assert!(DistributionPolicy::parse(&config.settlement.default_policy).is_some());
    }

    #[test]
    fn test_partial_config_parses() {
        let json = r#"{ "trading": { "initial_capital": 10000.0,
            "commission_rate": 0.001, "slippage_rate": 0.0005,
            "tick_interval_secs": 5, "market_window": 24 } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.trading.initial_capital, 10_000.0);
        // Missing sections fall back to defaults
        assert_eq!(config.backtest.data_dir, "data");
    }
}
