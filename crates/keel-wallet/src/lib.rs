//! # keel-wallet — 2-of-3 cosigned multisig wallet.
//!
//! Derives wallet keys from BIP39 mnemonics, tracks and locks UTXOs,
//! selects coins, estimates fees, builds and signs P2SH multisig
//! transactions together with a remote cosigner, and sweeps a wallet
//! using only its backup material.
//!
//! # Modules
//!
//! - [`error`] — `WalletError` enum
//! - [`keys`] — BIP32 key derivation for the three wallet keys
//! - [`mnemonic`] — BIP39 mnemonic generation and parsing
//! - [`encryption`] — AES-256-GCM encryption of the primary mnemonic
//! - [`utxo_store`] — UTXO set with TTL locks
//! - [`coin_selection`] — UTXO selection
//! - [`fee`] — fee strategies, size estimation and change
//! - [`builder`] — staged transaction builder
//! - [`signing`] — local and remote signers, 2-of-3 finalization
//! - [`discovery`] — batch address scanning
//! - [`sweeper`] — recover funds from backup material
//! - [`backup`] — backup sheet export
//! - [`wallet`] — wallet orchestration and the unlock guard

pub mod backup;
pub mod builder;
pub mod coin_selection;
pub mod discovery;
pub mod encryption;
pub mod error;
pub mod fee;
pub mod keys;
pub mod mnemonic;
pub mod signing;
pub mod sweeper;
pub mod utxo_store;
pub mod wallet;

pub use backup::{BackupInfo, CosignKey};
pub use builder::{BuildStage, Output, TransactionBuilder, UnsignedTransaction};
pub use coin_selection::{CoinSelection, CoinSelector, SelectionPolicy};
pub use discovery::{CancelFlag, Discovery};
pub use error::WalletError;
pub use fee::{FeeAndChange, FeeEstimator};
pub use keys::{KeyRole, MasterKey, PrimaryKey, WalletKeys};
pub use signing::{LocalSigner, PartialSignature, RemoteCosigner, SignedTransaction, Signer, SigningEngine, SigningRequest};
pub use sweeper::{SweepResult, SweeperConfig, WalletSweeper};
pub use utxo_store::UtxoStore;
pub use wallet::{Credentials, CreateWalletOptions, PayOptions, Services, UnlockedWallet, Wallet};
