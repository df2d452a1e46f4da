//! Environment-based configuration for the account subsystem.
//!
//! Mirrors the original backend's "required on mainnet, defaulted on
//! devnet" pattern, trimmed to the knobs this crate actually owns: network
//! selection, gap-limit tuning, and storage location.
//!
//! # Environment Variables
//!
//! - `ZBTC_NETWORK` - "mainnet", "testnet", or "devnet" (default: "devnet")
//! - `ZBTC_GAP_LIMIT` - reservation gap-limit window (default: 20)
//! - `ZBTC_MAX_LOOKAHEAD` - maximum lookahead batch size (default: 1000)
//! - `ZBTC_STORAGE_PATH` - SQLite database path (devnet default: in-memory)
//! - `ZBTC_LOG_LEVEL` - logging level (debug, info, warn, error)

use std::env;
use std::str::FromStr;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Network environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
    Devnet,
}

impl FromStr for Network {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" | "main" => Ok(Network::Mainnet),
            "testnet" | "test" => Ok(Network::Testnet),
            "devnet" | "dev" => Ok(Network::Devnet),
            _ => Err(ConfigError::InvalidValue(
                "ZBTC_NETWORK".to_string(),
                format!("unknown network: {}", s),
            )),
        }
    }
}

impl Network {
    /// Get the corresponding `bitcoin` crate network.
    pub fn bitcoin_network(&self) -> bitcoin::Network {
        match self {
            Network::Mainnet => bitcoin::Network::Bitcoin,
            Network::Testnet | Network::Devnet => bitcoin::Network::Testnet,
        }
    }
}

/// Main configuration struct.
#[derive(Debug, Clone)]
pub struct Config {
    /// Network environment.
    pub network: Network,

    /// Reservation gap-limit window (elements scanned past `used_index`
    /// before giving up on a batch).
    pub gap_limit: u32,

    /// Maximum lookahead batch size the doubling strategy will grow to.
    pub max_lookahead: u32,

    /// SQLite database path. `None` means use an in-memory backend.
    pub storage_path: Option<String>,

    /// Log level.
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let network: Network = env::var("ZBTC_NETWORK")
            .unwrap_or_else(|_| "devnet".to_string())
            .parse()?;

        let gap_limit = env::var("ZBTC_GAP_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(20);

        let max_lookahead = env::var("ZBTC_MAX_LOOKAHEAD")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1000);

        let storage_path = match env::var("ZBTC_STORAGE_PATH") {
            Ok(path) => Some(path),
            Err(_) => {
                if network == Network::Mainnet {
                    return Err(ConfigError::MissingEnvVar(
                        "ZBTC_STORAGE_PATH".to_string(),
                    ));
                }
                None
            }
        };

        let log_level = env::var("ZBTC_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            network,
            gap_limit,
            max_lookahead,
            storage_path,
            log_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_parsing() {
        assert!(matches!("mainnet".parse::<Network>(), Ok(Network::Mainnet)));
        assert!(matches!("testnet".parse::<Network>(), Ok(Network::Testnet)));
        assert!(matches!("devnet".parse::<Network>(), Ok(Network::Devnet)));
        assert!("invalid".parse::<Network>().is_err());
    }

    #[test]
    fn test_bitcoin_network_mapping() {
        assert_eq!(Network::Mainnet.bitcoin_network(), bitcoin::Network::Bitcoin);
        assert_eq!(Network::Testnet.bitcoin_network(), bitcoin::Network::Testnet);
    }
}
