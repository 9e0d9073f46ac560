//! Client configuration.
//!
//! [`ClientConfig`] is an explicit value passed to the client constructor.
//! [`ClientConfig::load`] layers an optional TOML file under `KEEL_*`
//! environment variables (`KEEL_API_KEY`, `KEEL_TESTNET`, ...); anything
//! unset keeps its default.

use std::fmt;
use std::path::Path;

use ::config::{Config, Environment, File};
use bitcoin::Network;
use serde::{Deserialize, Serialize};

use crate::error::ClientError;

pub const DEFAULT_ENDPOINT: &str = "https://api.blocktrail.com";
pub const DEFAULT_API_VERSION: &str = "v1";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub api_key: String,
    pub api_secret: String,
    /// Coin ticker; only `BTC` is supported.
    pub network: String,
    pub testnet: bool,
    pub api_version: String,
    pub endpoint: String,
    pub timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_secret: String::new(),
            network: "BTC".to_string(),
            testnet: false,
            api_version: DEFAULT_API_VERSION.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl ClientConfig {
    /// Load from `path` (if given and present) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ClientError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }
        builder
            .add_source(Environment::with_prefix("KEEL").try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ClientError::Config(e.to_string()))
    }

    pub fn bitcoin_network(&self) -> Result<Network, ClientError> {
        match (self.network.to_ascii_lowercase().as_str(), self.testnet) {
            ("btc", false) => Ok(Network::Bitcoin),
            ("btc", true) => Ok(Network::Testnet),
            ("regtest", _) => Ok(Network::Regtest),
            ("signet", _) => Ok(Network::Signet),
            _ => Err(ClientError::UnsupportedNetwork { network: self.network.clone(), testnet: self.testnet }),
        }
    }

    /// `<endpoint>/<version>/<network>`, with a `t` prefix on testnet.
    pub fn base_url(&self) -> String {
        let network = self.network.to_ascii_lowercase();
        let network = if self.testnet { format!("t{network}") } else { network };
        format!("{}/{}/{}", self.endpoint.trim_end_matches('/'), self.api_version, network)
    }

    /// Credentials are required for the HTTP client.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.api_key.is_empty() || self.api_secret.is_empty() {
            return Err(ClientError::Config("api_key and api_secret are required".into()));
        }
        if self.timeout_secs == 0 {
            return Err(ClientError::Config("timeout_secs must be positive".into()));
        }
        self.bitcoin_network().map(|_| ())
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("api_key", &self.api_key)
            .field("api_secret", &"[REDACTED]")
            .field("network", &self.network)
            .field("testnet", &self.testnet)
            .field("api_version", &self.api_version)
            .field("endpoint", &self.endpoint)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.network, "BTC");
        assert!(!cfg.testnet);
        assert_eq!(cfg.timeout_secs, DEFAULT_TIMEOUT_SECS);
        assert_eq!(cfg.bitcoin_network().unwrap(), Network::Bitcoin);
    }

    #[test]
    fn base_url_prefixes_testnet() {
        let cfg = ClientConfig { testnet: true, endpoint: "https://api.example.com/".into(), ..Default::default() };
        assert_eq!(cfg.base_url(), "https://api.example.com/v1/tbtc");
        assert_eq!(cfg.bitcoin_network().unwrap(), Network::Testnet);
    }

    #[test]
    fn unknown_network_rejected() {
        let cfg = ClientConfig { network: "LTC".into(), ..Default::default() };
        assert!(matches!(cfg.bitcoin_network(), Err(ClientError::UnsupportedNetwork { .. })));
    }

    #[test]
    fn validate_requires_credentials() {
        assert!(ClientConfig::default().validate().is_err());
        let cfg = ClientConfig { api_key: "k".into(), api_secret: "s".into(), ..Default::default() };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keel.toml");
        std::fs::write(&path, "api_key = \"file-key\"\ntestnet = true\ntimeout_secs = 5\n").unwrap();

        let cfg = ClientConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.api_key, "file-key");
        assert!(cfg.testnet);
        assert_eq!(cfg.timeout_secs, 5);
        assert_eq!(cfg.endpoint, DEFAULT_ENDPOINT);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ClientConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(cfg.api_version, DEFAULT_API_VERSION);
    }

    #[test]
    fn debug_redacts_secret() {
        let cfg = ClientConfig { api_secret: "topsecret".into(), ..Default::default() };
        assert!(!format!("{cfg:?}").contains("topsecret"));
    }
}
