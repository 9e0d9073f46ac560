//! Recover wallet funds using only backup material.
//!
//! With the primary mnemonic (plus its passphrase), the backup mnemonic and
//! the cosigner public keys from the backup sheet, the sweeper rebuilds
//! every wallet address, discovers the unspent outputs and spends all of
//! them to one destination signed 2-of-3 by primary and backup. The remote
//! service is never asked to cosign, and the server-side wallet record is
//! left untouched.

use std::collections::BTreeMap;
use std::fmt;

use bitcoin::bip32::Xpub;
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{Network, Transaction};
use tracing::{info, warn};
use zeroize::Zeroizing;

use keel_core::constants::{DEFAULT_DISCOVERY_INCREMENT, DUST_THRESHOLD};
use keel_core::script::parse_address;
use keel_core::traits::{BlockchainQuery, FeeOracle};
use keel_core::types::{Balance, Utxo};

use crate::builder::TransactionBuilder;
use crate::discovery::{discover, CancelFlag};
use crate::encryption::decrypt_mnemonic;
use crate::error::WalletError;
use crate::fee::{estimate_size, fee_for_size, FeeEstimator};
use crate::keys::{KeyRole, MasterKey, WalletKeys};
use crate::mnemonic::parse_mnemonic;
use crate::signing::{LocalSigner, SigningEngine};

/// Backup material needed to sweep a wallet.
pub struct SweeperConfig {
    /// Hex of the passphrase-encrypted primary mnemonic.
    pub encrypted_primary_mnemonic: String,
    pub passphrase: Zeroizing<String>,
    pub backup_mnemonic: Zeroizing<String>,
    /// Cosigner account xpubs by key index.
    pub cosign_public_keys: BTreeMap<u32, Xpub>,
    pub network: Network,
    /// Addresses per discovery batch when sweeping without prior discovery.
    pub increment: u32,
}

impl SweeperConfig {
    pub fn new(
        encrypted_primary_mnemonic: impl Into<String>,
        passphrase: impl Into<String>,
        backup_mnemonic: impl Into<String>,
        cosign_public_keys: BTreeMap<u32, Xpub>,
        network: Network,
    ) -> Self {
        Self {
            encrypted_primary_mnemonic: encrypted_primary_mnemonic.into(),
            passphrase: Zeroizing::new(passphrase.into()),
            backup_mnemonic: Zeroizing::new(backup_mnemonic.into()),
            cosign_public_keys,
            network,
            increment: DEFAULT_DISCOVERY_INCREMENT,
        }
    }
}

impl fmt::Debug for SweeperConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SweeperConfig")
            .field("encrypted_primary_mnemonic", &"[REDACTED]")
            .field("passphrase", &"[REDACTED]")
            .field("backup_mnemonic", &"[REDACTED]")
            .field("key_indices", &self.cosign_public_keys.keys().collect::<Vec<_>>())
            .field("network", &self.network)
            .field("increment", &self.increment)
            .finish()
    }
}

/// A sweep transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepResult {
    pub transaction: Transaction,
    /// Every input carries two signatures.
    pub complete: bool,
    /// Fewest signatures on any input.
    pub signatures: usize,
    pub fee: u64,
    /// Value sent to the destination.
    pub swept: u64,
    pub inputs: usize,
}

impl SweepResult {
    /// Raw transaction hex, ready for broadcast.
    pub fn raw_hex(&self) -> String {
        serialize_hex(&self.transaction)
    }
}

pub struct WalletSweeper<'a> {
    keys: WalletKeys,
    primary: MasterKey,
    backup: MasterKey,
    query: &'a dyn BlockchainQuery,
    fees: &'a dyn FeeOracle,
    increment: u32,
    discovered: Vec<Utxo>,
}

impl<'a> WalletSweeper<'a> {
    /// Restore the wallet keys from backup material.
    ///
    /// Fails with [`WalletError::InvalidPassphrase`] when the passphrase
    /// does not decrypt the primary mnemonic.
    pub fn new(
        config: SweeperConfig,
        query: &'a dyn BlockchainQuery,
        fees: &'a dyn FeeOracle,
    ) -> Result<Self, WalletError> {
        if config.cosign_public_keys.is_empty() {
            return Err(WalletError::KeyDerivation("no cosigner public keys".into()));
        }
        let phrase = decrypt_mnemonic(&config.encrypted_primary_mnemonic, &config.passphrase)?;
        let primary = MasterKey::from_mnemonic(&parse_mnemonic(&phrase)?, config.network, KeyRole::Primary)?;
        let backup = MasterKey::from_mnemonic(&parse_mnemonic(&config.backup_mnemonic)?, config.network, KeyRole::Backup)?;

        let secp = Secp256k1::new();
        let primary_public_keys = config
            .cosign_public_keys
            .keys()
            .map(|&key_index| Ok((key_index, primary.account_xpub(&secp, key_index)?)))
            .collect::<Result<BTreeMap<_, _>, WalletError>>()?;
        let keys = WalletKeys::new(
            config.network,
            primary_public_keys,
            backup.root_xpub(&secp),
            config.cosign_public_keys,
        );

        Ok(Self { keys, primary, backup, query, fees, increment: config.increment, discovered: Vec::new() })
    }

    pub fn discovered(&self) -> &[Utxo] {
        &self.discovered
    }

    /// Scan for unspent outputs in batches of `increment` addresses,
    /// replacing anything discovered before.
    pub fn discover_wallet_funds(&mut self, increment: u32, cancel: &CancelFlag) -> Result<Balance, WalletError> {
        let found = discover(&mut self.keys, self.query, increment, cancel)?;
        let balance = found.balance();
        info!(utxos = found.utxos.len(), scanned = found.scanned, total = balance.total(), "wallet funds discovered");
        self.discovered = found.utxos;
        Ok(balance)
    }

    /// Spend every discovered UTXO to `destination`, signed by primary and
    /// backup. Runs discovery first if nothing has been discovered yet.
    pub fn sweep_wallet(&mut self, destination: &str) -> Result<SweepResult, WalletError> {
        if self.discovered.is_empty() {
            self.discover_wallet_funds(self.increment, &CancelFlag::new())?;
        }
        if self.discovered.is_empty() {
            return Err(WalletError::NoUtxos);
        }

        let network = self.keys.network();
        let destination_script_len = parse_address(destination, network)?.script_pubkey().len();
        let total = self.discovered.iter().fold(0u64, |acc, u| acc.saturating_add(u.value));

        let mut estimator = FeeEstimator::new(self.fees);
        let rate = estimator.fee_per_kb()?.optimal;
        let fee = fee_for_size(estimate_size(self.discovered.len(), [destination_script_len]), rate);
        let need = fee.saturating_add(DUST_THRESHOLD);
        if total < need {
            return Err(WalletError::InsufficientFunds { have: total, need });
        }
        let swept = total - fee;

        let mut builder = TransactionBuilder::new(network);
        builder.add_recipient(destination, swept)?;
        builder.set_utxos(self.discovered.clone())?.set_fee(fee)?;
        builder.determine_fee_and_change(&mut estimator)?;
        let unsigned = builder.build_unsigned(None)?;

        let primary = LocalSigner::new(&self.primary);
        let backup = LocalSigner::new(&self.backup);
        let signed = SigningEngine::new().with_signer(&primary).with_signer(&backup).sign(&unsigned)?;
        if !signed.complete {
            warn!(signatures = signed.signatures, "sweep transaction is not fully signed");
        }

        info!(inputs = unsigned.inputs.len(), swept, fee, "sweep transaction built");
        Ok(SweepResult {
            transaction: signed.tx,
            complete: signed.complete,
            signatures: signed.signatures,
            fee: unsigned.fee,
            swept,
            inputs: unsigned.inputs.len(),
        })
    }
}

impl fmt::Debug for WalletSweeper<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletSweeper")
            .field("keys", &self.keys)
            .field("increment", &self.increment)
            .field("discovered", &self.discovered.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::tests::address;
    use crate::discovery::tests::{address_at, Funded};
    use crate::encryption::encrypt_mnemonic;
    use crate::keys::tests::{cosigner, BACKUP, PRIMARY};
    use bitcoin::bip32::ChildNumber;
    use keel_core::traits::RemoteResult;
    use keel_core::types::FeeRates;

    struct Rates(FeeRates);

    impl FeeOracle for Rates {
        fn fee_per_kb(&self) -> RemoteResult<FeeRates> {
            Ok(self.0)
        }
    }

    fn config(passphrase: &str) -> SweeperConfig {
        let secp = Secp256k1::new();
        let account = cosigner().derive_priv(&secp, &[ChildNumber::Hardened { index: 0 }]).unwrap();
        let mut config = SweeperConfig::new(
            encrypt_mnemonic(PRIMARY, "sweep-pass").unwrap(),
            passphrase,
            BACKUP,
            BTreeMap::from([(0, Xpub::from_priv(&secp, &account))]),
            Network::Testnet,
        );
        config.increment = 5;
        config
    }

    #[test]
    fn sweeps_everything_to_destination() {
        let mut chain = Funded::default();
        chain.fund(address_at(0, 1), 40_000);
        chain.fund(address_at(1, 3), 25_000);
        let rates = Rates(FeeRates::default());

        let mut sweeper = WalletSweeper::new(config("sweep-pass"), &chain, &rates).unwrap();
        let balance = sweeper.discover_wallet_funds(5, &CancelFlag::new()).unwrap();
        assert_eq!(balance.total(), 65_000);

        let destination = address(99);
        let result = sweeper.sweep_wallet(&destination).unwrap();
        assert!(result.complete);
        assert_eq!(result.signatures, 2);
        assert_eq!(result.inputs, 2);
        // 10 + 2 * 297 + (9 + 23) = 636 bytes at 10 sat/byte
        assert_eq!(result.fee, 6_360);
        assert_eq!(result.swept, 65_000 - 6_360);
        assert_eq!(result.transaction.output.len(), 1);
        assert_eq!(result.transaction.output[0].value.to_sat(), result.swept);
        assert!(result.transaction.input.iter().all(|i| !i.script_sig.is_empty()));
    }

    #[test]
    fn sweep_discovers_on_demand() {
        let mut chain = Funded::default();
        chain.fund(address_at(0, 0), 30_000);
        let rates = Rates(FeeRates::default());
        let mut sweeper = WalletSweeper::new(config("sweep-pass"), &chain, &rates).unwrap();
        let result = sweeper.sweep_wallet(&address(50)).unwrap();
        assert_eq!(result.inputs, 1);
        assert_eq!(sweeper.discovered().len(), 1);
    }

    #[test]
    fn empty_wallet_has_nothing_to_sweep() {
        let chain = Funded::default();
        let rates = Rates(FeeRates::default());
        let mut sweeper = WalletSweeper::new(config("sweep-pass"), &chain, &rates).unwrap();
        assert_eq!(sweeper.sweep_wallet(&address(50)).unwrap_err(), WalletError::NoUtxos);
    }

    #[test]
    fn funds_below_fee_plus_dust_are_insufficient() {
        let mut chain = Funded::default();
        chain.fund(address_at(0, 0), 5_000);
        let rates = Rates(FeeRates::default());
        let mut sweeper = WalletSweeper::new(config("sweep-pass"), &chain, &rates).unwrap();
        let err = sweeper.sweep_wallet(&address(50)).unwrap_err();
        assert!(matches!(err, WalletError::InsufficientFunds { have: 5_000, .. }));
    }

    #[test]
    fn wrong_passphrase_rejected() {
        let chain = Funded::default();
        let rates = Rates(FeeRates::default());
        let err = WalletSweeper::new(config("nope"), &chain, &rates).unwrap_err();
        assert_eq!(err, WalletError::InvalidPassphrase);
    }

    #[test]
    fn debug_hides_secrets() {
        let rendered = format!("{:?}", config("sweep-pass"));
        assert!(!rendered.contains("sweep-pass"));
        assert!(!rendered.contains("legal"));
    }
}
