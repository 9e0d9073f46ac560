//! Client setup errors. Failures of individual calls are
//! [`RemoteServiceError`](keel_core::error::RemoteServiceError)s.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("configuration: {0}")]
    Config(String),

    #[error("unsupported network {network} (testnet: {testnet})")]
    UnsupportedNetwork { network: String, testnet: bool },

    #[error("HTTP client: {0}")]
    Http(String),

    #[error("cosigner key: {0}")]
    Cosigner(String),
}
