//! Wallet error types.

use keel_core::error::{AmountError, PageError, PathError, RemoteServiceError, ScriptError};
use thiserror::Error;

/// Errors that can occur in wallet operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    /// Spendable funds do not cover outputs plus fee.
    #[error("insufficient funds: have {have}, need {need}")]
    InsufficientFunds {
        /// Spendable value in satoshi.
        have: u64,
        /// Required value in satoshi.
        need: u64,
    },

    /// Nothing to spend (for example a sweep that discovered no funds).
    #[error("no UTXOs available")]
    NoUtxos,

    /// Mnemonic failed word-list or checksum validation.
    #[error("invalid mnemonic: {0}")]
    InvalidMnemonic(String),

    /// OP_RETURN output over the standard size without override.
    #[error("non-standard script: {len} > {max} bytes")]
    NonStandardScript { len: usize, max: usize },

    /// UTXO already locked by another build. Retryable after `expires_at`.
    #[error("UTXO {outpoint} is locked until {expires_at}")]
    LockContention {
        outpoint: String,
        /// Unix seconds.
        expires_at: i64,
    },

    /// Operation needs the primary private key but the wallet is locked.
    #[error("wallet {0} is locked")]
    WalletLocked(String),

    /// Collaborator failure; names the service and operation.
    #[error(transparent)]
    RemoteService(#[from] RemoteServiceError),

    /// Passphrase or primary key does not match the wallet.
    #[error("invalid passphrase")]
    InvalidPassphrase,

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("key derivation: {0}")]
    KeyDerivation(String),

    #[error("signing: {0}")]
    Signing(String),

    /// Builder operation not valid in its current stage.
    #[error("invalid builder stage: {0}")]
    InvalidStage(String),

    #[error("build error: {0}")]
    BuildError(String),

    #[error("encryption: {0}")]
    Encryption(String),

    #[error("decryption: {0}")]
    Decryption(String),

    #[error("serialization: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    IoError(String),

    /// Discovery stopped by its cancel flag.
    #[error("cancelled after scanning {scanned} addresses")]
    Cancelled { scanned: u32 },

    #[error(transparent)]
    Page(#[from] PageError),
}

impl From<ScriptError> for WalletError {
    fn from(err: ScriptError) -> Self {
        match err {
            ScriptError::NonStandard { len, max } => Self::NonStandardScript { len, max },
            ScriptError::InvalidAddress(a) => Self::InvalidAddress(a),
            other => Self::BuildError(other.to_string()),
        }
    }
}

impl From<AmountError> for WalletError {
    fn from(err: AmountError) -> Self {
        Self::InvalidAmount(err.to_string())
    }
}

impl From<PathError> for WalletError {
    fn from(err: PathError) -> Self {
        Self::KeyDerivation(err.to_string())
    }
}

impl WalletError {
    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockContention { .. } | Self::RemoteService(RemoteServiceError::Transport { .. })
        )
    }
}
