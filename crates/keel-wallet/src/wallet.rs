//! Wallet orchestration: creation, unlock, addresses, payments.
//!
//! The [`Wallet`] ties together key derivation, the UTXO store, coin
//! selection, fee estimation, the transaction builder and the signing
//! engine. Its collaborators ([`Services`]) are injected at construction;
//! there is no global client.
//!
//! A loaded wallet is locked: it can derive addresses and report balances
//! but cannot sign. [`Wallet::unlock`] returns an [`UnlockedWallet`] guard
//! that holds the primary key and locks the wallet again when dropped.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use bitcoin::bip32::{Xpriv, Xpub};
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{Network, OutPoint, Txid};
use rand::RngCore;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use keel_core::constants::{
    CHANGE_CHAIN, DEFAULT_UTXO_LOCK_TTL_SECS, DUST_THRESHOLD, EXTERNAL_CHAIN, MAX_PAGE_LIMIT,
    P2SH_SCRIPT_PUBKEY_LEN, WALLET_IDENTIFIER_BYTES,
};
use keel_core::path::WalletPath;
use keel_core::traits::{BlockchainQuery, FeeOracle, WalletService};
use keel_core::types::{
    Balance, FeeRates, FeeStrategy, MaxSpendable, NewWallet, Page, Paginated, SendRequest,
    ServiceCoinSelection, SortDir, TransactionInfo, Utxo, WalletAddress, Webhook,
};

use crate::backup::BackupInfo;
use crate::builder::{BuildStage, TransactionBuilder, UnsignedTransaction};
use crate::coin_selection::SelectionPolicy;
use crate::discovery::{discover, CancelFlag};
use crate::encryption::{decrypt_mnemonic, encrypt_mnemonic};
use crate::error::WalletError;
use crate::fee::{estimate_size, FeeAndChange, FeeEstimator};
use crate::keys::{KeyRole, MasterKey, PrimaryKey, WalletKeys};
use crate::mnemonic::{generate_mnemonic, parse_mnemonic};
use crate::signing::{LocalSigner, RemoteCosigner, SigningEngine};
use crate::utxo_store::UtxoStore;

/// Remote collaborators of a wallet.
#[derive(Clone)]
pub struct Services {
    pub wallet: Arc<dyn WalletService>,
    pub chain: Arc<dyn BlockchainQuery>,
    pub fees: Arc<dyn FeeOracle>,
}

impl Services {
    pub fn new(wallet: Arc<dyn WalletService>, chain: Arc<dyn BlockchainQuery>, fees: Arc<dyn FeeOracle>) -> Self {
        Self { wallet, chain, fees }
    }

    /// All three roles served by one client.
    pub fn from_client<S>(client: Arc<S>) -> Self
    where
        S: WalletService + BlockchainQuery + FeeOracle + 'static,
    {
        Self { wallet: client.clone(), chain: client.clone(), fees: client }
    }
}

/// Options for [`Wallet::create`].
pub struct CreateWalletOptions {
    /// Random hex identifier when `None`.
    pub identifier: Option<String>,
    /// Encrypts the primary mnemonic.
    pub passphrase: Zeroizing<String>,
    pub key_index: u32,
    pub network: Network,
}

impl CreateWalletOptions {
    pub fn new(passphrase: impl Into<String>, network: Network) -> Self {
        Self { identifier: None, passphrase: Zeroizing::new(passphrase.into()), key_index: 0, network }
    }

    pub fn identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn key_index(mut self, key_index: u32) -> Self {
        self.key_index = key_index;
        self
    }
}

impl fmt::Debug for CreateWalletOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreateWalletOptions")
            .field("identifier", &self.identifier)
            .field("passphrase", &"[REDACTED]")
            .field("key_index", &self.key_index)
            .field("network", &self.network)
            .finish()
    }
}

/// How to obtain the primary private key.
pub enum Credentials {
    /// Decrypts the stored primary mnemonic.
    Passphrase(Zeroizing<String>),
    PrimaryXpriv(Xpriv),
}

impl Credentials {
    pub fn passphrase(passphrase: impl Into<String>) -> Self {
        Self::Passphrase(Zeroizing::new(passphrase.into()))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passphrase(_) => f.write_str("Passphrase([REDACTED])"),
            Self::PrimaryXpriv(_) => f.write_str("PrimaryXpriv([REDACTED])"),
        }
    }
}

/// Options for [`Wallet::pay`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayOptions {
    /// Derived from the change chain when `None`.
    pub change_address: Option<String>,
    pub allow_zero_conf: bool,
    pub randomize_change: bool,
    pub fee_strategy: FeeStrategy,
    /// Explicit fee; overrides `fee_strategy`.
    pub fee: Option<u64>,
    /// Data for an extra OP_RETURN output.
    pub op_return: Option<Vec<u8>>,
    /// Ask the service to reject the transaction if the fee looks wrong.
    pub check_fee: bool,
}

impl Default for PayOptions {
    fn default() -> Self {
        Self {
            change_address: None,
            allow_zero_conf: false,
            randomize_change: true,
            fee_strategy: FeeStrategy::Optimal,
            fee: None,
            op_return: None,
            check_fee: true,
        }
    }
}

pub struct Wallet {
    identifier: String,
    key_index: u32,
    keys: WalletKeys,
    checksum: String,
    encrypted_primary_mnemonic: String,
    /// Present only while unlocked.
    primary: Option<PrimaryKey>,
    utxos: UtxoStore,
    services: Services,
}

impl Wallet {
    /// Create and register a new wallet.
    ///
    /// Generates primary and backup mnemonics, registers the public keys with
    /// the wallet service and returns the wallet (locked) together with its
    /// backup sheet. The backup mnemonic exists only in the returned sheet.
    pub fn create(services: Services, options: CreateWalletOptions) -> Result<(Self, BackupInfo), WalletError> {
        let identifier = match options.identifier {
            Some(identifier) => identifier,
            None => random_identifier(),
        };
        let network = options.network;
        let key_index = options.key_index;

        let primary_mnemonic = generate_mnemonic()?;
        let backup_mnemonic = generate_mnemonic()?;
        let primary = MasterKey::from_mnemonic(&primary_mnemonic, network, KeyRole::Primary)?;
        let backup = MasterKey::from_mnemonic(&backup_mnemonic, network, KeyRole::Backup)?;

        let secp = Secp256k1::new();
        let primary_public_key = primary.account_xpub(&secp, key_index)?;
        let backup_public_key = backup.root_xpub(&secp);
        let checksum = primary.checksum_address(&secp).to_string();
        let encrypted = encrypt_mnemonic(&Zeroizing::new(primary_mnemonic.to_string()), &options.passphrase)?;

        let cosign_public_keys = services.wallet.create_wallet(&NewWallet {
            identifier: identifier.clone(),
            network,
            key_index,
            primary_public_key,
            backup_public_key,
            checksum: checksum.clone(),
            encrypted_primary_mnemonic: encrypted.clone(),
        })?;
        if !cosign_public_keys.contains_key(&key_index) {
            return Err(WalletError::KeyDerivation(format!("service returned no cosigner key for key index {key_index}")));
        }

        let backup_info = BackupInfo::new(
            &identifier,
            network,
            &encrypted,
            &Zeroizing::new(backup_mnemonic.to_string()),
            &cosign_public_keys,
            &checksum,
        );
        let keys = WalletKeys::new(
            network,
            BTreeMap::from([(key_index, primary_public_key)]),
            backup_public_key,
            cosign_public_keys,
        );
        info!(identifier = %identifier, key_index, %network, "wallet created");

        let wallet = Self {
            identifier,
            key_index,
            keys,
            checksum,
            encrypted_primary_mnemonic: encrypted,
            primary: None,
            utxos: UtxoStore::new(),
            services,
        };
        Ok((wallet, backup_info))
    }

    /// Load a registered wallet. The result is locked.
    pub fn load(services: Services, identifier: &str) -> Result<Self, WalletError> {
        let record = services.wallet.get_wallet(identifier)?;
        debug!(identifier, key_index = record.key_index, "wallet loaded");
        Ok(Self {
            identifier: record.identifier.clone(),
            key_index: record.key_index,
            keys: WalletKeys::from_record(&record),
            checksum: record.checksum,
            encrypted_primary_mnemonic: record.encrypted_primary_mnemonic,
            primary: None,
            utxos: UtxoStore::new(),
            services,
        })
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn key_index(&self) -> u32 {
        self.key_index
    }

    pub fn network(&self) -> Network {
        self.keys.network()
    }

    /// P2PKH address of the primary master key.
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// Hex of the passphrase-encrypted primary mnemonic.
    pub fn primary_mnemonic(&self) -> &str {
        &self.encrypted_primary_mnemonic
    }

    pub fn primary_public_keys(&self) -> &BTreeMap<u32, Xpub> {
        self.keys.primary_public_keys()
    }

    pub fn backup_public_key(&self) -> &Xpub {
        self.keys.backup_public_key()
    }

    pub fn cosign_public_keys(&self) -> &BTreeMap<u32, Xpub> {
        self.keys.cosign_public_keys()
    }

    pub fn utxo_store(&self) -> &UtxoStore {
        &self.utxos
    }

    // -----------------------------------------------------------------------
    // Lock state
    // -----------------------------------------------------------------------

    pub fn is_locked(&self) -> bool {
        self.primary.is_none()
    }

    /// Load the primary key. The returned guard locks the wallet on drop.
    ///
    /// Fails with [`WalletError::InvalidPassphrase`] when the key does not
    /// match the wallet checksum.
    pub fn unlock(&mut self, credentials: Credentials) -> Result<UnlockedWallet<'_>, WalletError> {
        let network = self.network();
        let key = match credentials {
            Credentials::Passphrase(passphrase) => {
                let phrase = decrypt_mnemonic(&self.encrypted_primary_mnemonic, &passphrase)?;
                MasterKey::from_mnemonic(&parse_mnemonic(&phrase)?, network, KeyRole::Primary)?
            }
            Credentials::PrimaryXpriv(xpriv) => MasterKey::from_xpriv(xpriv, KeyRole::Primary),
        };
        if key.checksum_address(self.keys.secp()).to_string() != self.checksum {
            warn!(identifier = %self.identifier, "primary key does not match wallet checksum");
            return Err(WalletError::InvalidPassphrase);
        }
        self.primary = Some(key);
        debug!(identifier = %self.identifier, "wallet unlocked");
        Ok(UnlockedWallet { wallet: self })
    }

    /// Drop the primary key.
    pub fn lock(&mut self) {
        if self.primary.take().is_some() {
            debug!(identifier = %self.identifier, "wallet locked");
        }
    }

    fn primary_key(&self) -> Result<&PrimaryKey, WalletError> {
        self.primary.as_ref().ok_or_else(|| WalletError::WalletLocked(self.identifier.clone()))
    }

    // -----------------------------------------------------------------------
    // Addresses
    // -----------------------------------------------------------------------

    /// Reserve and derive the next receive address.
    pub fn new_address(&mut self) -> Result<String, WalletError> {
        self.new_address_pair().map(|(_, address)| address)
    }

    /// Next receive address with its path.
    pub fn new_address_pair(&mut self) -> Result<(String, String), WalletError> {
        let (path, address) = self.next_derivation(EXTERNAL_CHAIN)?;
        Ok((path.to_string(), address))
    }

    /// Reserve and derive the next change address.
    pub fn new_change_address(&mut self) -> Result<String, WalletError> {
        self.next_derivation(CHANGE_CHAIN).map(|(_, address)| address)
    }

    /// The service assigns the index; the address is derived locally and
    /// must match what the service reports.
    fn next_derivation(&mut self, chain: u32) -> Result<(WalletPath, String), WalletError> {
        let derivation = self.services.wallet.new_derivation(&self.identifier, self.key_index, chain)?;
        let path: WalletPath = derivation.path.parse()?;
        let address = self.keys.derive_address(&path)?.to_string();
        if address != derivation.address {
            return Err(WalletError::KeyDerivation(format!(
                "service address {} does not match derived {address} at {path}",
                derivation.address
            )));
        }
        debug!(identifier = %self.identifier, %path, %address, "address derived");
        Ok((path, address))
    }

    pub fn address_by_path(&mut self, path: &str) -> Result<String, WalletError> {
        let path: WalletPath = path.parse()?;
        Ok(self.keys.derive_address(&path)?.to_string())
    }

    /// Derivation path of a wallet address.
    pub fn path_for_address(&mut self, address: &str) -> Result<String, WalletError> {
        if let Some(path) = self.keys.path_for_address(address) {
            return Ok(path.to_string());
        }
        let path: WalletPath = self.services.wallet.path_for_address(&self.identifier, address)?.parse()?;
        if self.keys.derive_address(&path)?.to_string() != address {
            return Err(WalletError::InvalidAddress(format!("{address} is not derived at {path}")));
        }
        Ok(path.to_string())
    }

    // -----------------------------------------------------------------------
    // Balances and listings
    // -----------------------------------------------------------------------

    pub fn balance(&self) -> Result<Balance, WalletError> {
        Ok(self.services.wallet.balance(&self.identifier)?)
    }

    pub fn optimal_fee_per_kb(&self) -> Result<u64, WalletError> {
        Ok(FeeEstimator::new(self.services.fees.as_ref()).fee_per_kb()?.optimal)
    }

    pub fn low_priority_fee_per_kb(&self) -> Result<u64, WalletError> {
        Ok(FeeEstimator::new(self.services.fees.as_ref()).fee_per_kb()?.low_priority)
    }

    pub fn utxos(&self, page: &Page) -> Result<Paginated<Utxo>, WalletError> {
        Ok(self.services.wallet.utxos(&self.identifier, page)?)
    }

    pub fn transactions(&self, page: &Page) -> Result<Paginated<TransactionInfo>, WalletError> {
        Ok(self.services.wallet.transactions(&self.identifier, page)?)
    }

    pub fn addresses(&self, page: &Page) -> Result<Paginated<WalletAddress>, WalletError> {
        Ok(self.services.wallet.addresses(&self.identifier, page)?)
    }

    /// Reload the local UTXO set from the service. Local locks on UTXOs
    /// that are still unspent survive.
    pub fn refresh_utxos(&mut self) -> Result<usize, WalletError> {
        let mut page = Page::new(1, MAX_PAGE_LIMIT, SortDir::Asc)?;
        let mut all = Vec::new();
        loop {
            let result = self.services.wallet.utxos(&self.identifier, &page)?;
            let done = !result.has_more() || result.data.is_empty();
            all.extend(result.data);
            if done {
                break;
            }
            page = page.next();
        }
        let count = all.len();
        self.utxos.replace(all);
        Ok(count)
    }

    /// Largest amount a single-recipient payment could send now.
    pub fn max_spendable(&mut self, allow_zero_conf: bool, strategy: FeeStrategy) -> Result<MaxSpendable, WalletError> {
        self.refresh_utxos()?;
        let spendable = self.utxos.spendable(allow_zero_conf);
        if spendable.is_empty() {
            return Ok(MaxSpendable::default());
        }
        let total = spendable.iter().fold(0u64, |acc, u| acc.saturating_add(u.value));
        let size = estimate_size(spendable.len(), [P2SH_SCRIPT_PUBKEY_LEN]);
        let fee = FeeEstimator::new(self.services.fees.as_ref()).fee_for(strategy, size)?;
        let max = total.saturating_sub(fee);
        Ok(MaxSpendable { max: if max < DUST_THRESHOLD { 0 } else { max }, fee, inputs: spendable.len() })
    }

    /// Scan the chain for wallet funds and replace the local UTXO set with
    /// what was found.
    pub fn do_discovery(&mut self, gap: u32, cancel: &CancelFlag) -> Result<Balance, WalletError> {
        let chain = Arc::clone(&self.services.chain);
        let found = discover(&mut self.keys, chain.as_ref(), gap, cancel)?;
        let balance = found.balance();
        info!(identifier = %self.identifier, scanned = found.scanned, total = balance.total(), "discovery complete");
        self.utxos.replace(found.utxos);
        Ok(balance)
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Server-side coin selection for `amount`.
    pub fn get_coin_selection(
        &self,
        amount: u64,
        lock: bool,
        allow_zero_conf: bool,
        strategy: FeeStrategy,
    ) -> Result<ServiceCoinSelection, WalletError> {
        Ok(self.services.wallet.coin_selection(&self.identifier, amount, lock, allow_zero_conf, strategy)?)
    }

    /// Determine fee and change of `builder`, with preset rates or the
    /// fee oracle.
    pub fn determine_fee_and_change(
        &self,
        builder: &mut TransactionBuilder,
        rates: Option<FeeRates>,
    ) -> Result<FeeAndChange, WalletError> {
        let mut estimator = match rates {
            Some(rates) => FeeEstimator::with_rates(rates),
            None => FeeEstimator::new(self.services.fees.as_ref()),
        };
        builder.determine_fee_and_change(&mut estimator)
    }

    /// Complete `builder` up to an unsigned transaction: select inputs from
    /// unlocked UTXOs if none are set, determine fee and change, derive a
    /// change address if one is needed.
    pub fn build_tx(&mut self, builder: &mut TransactionBuilder, allow_zero_conf: bool) -> Result<UnsignedTransaction, WalletError> {
        self.fund_builder(builder, allow_zero_conf)?;
        self.finish_builder(builder)
    }

    /// Select inputs (unless already set) and settle fee and change.
    ///
    /// UTXOs locked here or reported locked by the service are skipped.
    fn fund_builder(&mut self, builder: &mut TransactionBuilder, allow_zero_conf: bool) -> Result<(), WalletError> {
        if builder.network() != self.network() {
            return Err(WalletError::BuildError(format!(
                "builder is for {}, wallet is on {}",
                builder.network(),
                self.network()
            )));
        }
        let fees = Arc::clone(&self.services.fees);
        let mut estimator = FeeEstimator::new(fees.as_ref());

        if builder.stage() == BuildStage::RecipientsAdded {
            self.refresh_utxos()?;
            let candidates = self.utxos.spendable(allow_zero_conf);
            let policy = SelectionPolicy { allow_zero_conf, randomize: false };
            builder.select_utxos(&candidates, &mut estimator, &policy)?;
        }
        if builder.stage() == BuildStage::UtxosSelected {
            builder.determine_fee_and_change(&mut estimator)?;
        }
        Ok(())
    }

    /// Derive a change address if the builder needs one, then assemble.
    fn finish_builder(&mut self, builder: &TransactionBuilder) -> Result<UnsignedTransaction, WalletError> {
        let needs_change = builder.change_address().is_none() && builder.fee_and_change().is_some_and(|f| f.change > 0);
        let fallback = if needs_change { Some(self.new_change_address()?) } else { None };
        builder.build_unsigned(fallback.as_deref())
    }

    /// Sign with the primary key and the remote cosigner, then broadcast.
    ///
    /// Nothing is broadcast unless every input carries two signatures.
    pub fn send_tx(&mut self, unsigned: &UnsignedTransaction, check_fee: bool) -> Result<String, WalletError> {
        let signed = {
            let primary = LocalSigner::new(self.primary_key()?);
            let cosigner = RemoteCosigner::new(self.services.wallet.as_ref(), &self.identifier);
            SigningEngine::new().with_signer(&primary).with_signer(&cosigner).sign(unsigned)?
        };
        if !signed.complete {
            return Err(WalletError::Signing(format!(
                "transaction has {} of 2 signatures on some input",
                signed.signatures
            )));
        }

        let request = SendRequest { raw_transaction: serialize_hex(&signed.tx), paths: unsigned.paths(), check_fee };
        let txid = self.services.wallet.send_transaction(&self.identifier, &request)?;
        for input in &unsigned.inputs {
            self.utxos.remove(&input.outpoint);
        }
        info!(identifier = %self.identifier, txid = %txid, fee = unsigned.fee, inputs = unsigned.inputs.len(), "transaction sent");
        Ok(txid)
    }

    /// Pay `outputs` (address, satoshi) and return the txid.
    ///
    /// Selected UTXOs are locked locally and with the service for the
    /// default TTL before the change address is derived, and released again
    /// if signing or sending fails. A UTXO another session holds fails the
    /// payment with [`WalletError::LockContention`].
    pub fn pay<I, A>(&mut self, outputs: I, options: PayOptions) -> Result<String, WalletError>
    where
        I: IntoIterator<Item = (A, u64)>,
        A: AsRef<str>,
    {
        self.primary_key()?;

        let mut builder = TransactionBuilder::new(self.network());
        for (address, value) in outputs {
            builder.add_recipient(address.as_ref(), value)?;
        }
        if let Some(data) = &options.op_return {
            builder.add_op_return(data, false)?;
        }
        builder.set_fee_strategy(options.fee_strategy)?.randomize_change_output(options.randomize_change);
        if let Some(fee) = options.fee {
            builder.set_fee(fee)?;
        }
        if let Some(change) = &options.change_address {
            builder.set_change_address(change)?;
        }

        self.fund_builder(&mut builder, options.allow_zero_conf)?;
        let inputs: Vec<OutPoint> = builder.utxos().iter().map(Utxo::outpoint).collect();
        self.lock_inputs(&inputs)?;

        let sent = self
            .finish_builder(&builder)
            .and_then(|unsigned| self.send_tx(&unsigned, options.check_fee));
        match sent {
            Ok(txid) => {
                builder.mark_signed();
                builder.mark_sent();
                debug!(stage = ?builder.stage(), "builder finished");
                Ok(txid)
            }
            Err(err) => {
                warn!(identifier = %self.identifier, error = %err, "payment failed, releasing inputs");
                self.release(&inputs);
                Err(err)
            }
        }
    }

    /// Unlock, pay and lock again, whatever the outcome.
    pub fn pay_and_lock<I, A>(&mut self, credentials: Credentials, outputs: I, options: PayOptions) -> Result<String, WalletError>
    where
        I: IntoIterator<Item = (A, u64)>,
        A: AsRef<str>,
    {
        let mut unlocked = self.unlock(credentials)?;
        unlocked.pay(outputs, options)
    }

    /// Lock every input locally and with the service, or none of them.
    fn lock_inputs(&mut self, outpoints: &[OutPoint]) -> Result<(), WalletError> {
        for (taken, outpoint) in outpoints.iter().enumerate() {
            if let Err(err) = self.lock_utxo(&outpoint.txid, outpoint.vout, None) {
                self.release(&outpoints[..taken]);
                return Err(err);
            }
        }
        Ok(())
    }

    fn release(&mut self, outpoints: &[OutPoint]) {
        for outpoint in outpoints {
            self.utxos.unlock(outpoint);
            if let Err(err) = self.services.wallet.unlock_utxo(&self.identifier, &outpoint.txid, outpoint.vout) {
                warn!(identifier = %self.identifier, %outpoint, error = %err, "service lock not released");
            }
        }
    }

    // -----------------------------------------------------------------------
    // UTXO locks
    // -----------------------------------------------------------------------

    /// Lock a UTXO locally and with the service. Returns the local expiry.
    pub fn lock_utxo(&mut self, txid: &Txid, vout: u32, ttl_secs: Option<u64>) -> Result<i64, WalletError> {
        let ttl = ttl_secs.unwrap_or(DEFAULT_UTXO_LOCK_TTL_SECS);
        let outpoint = OutPoint::new(*txid, vout);
        let expires_at = self.utxos.lock(&outpoint, ttl)?;
        match self.services.wallet.lock_utxo(&self.identifier, txid, vout, ttl) {
            Ok(true) => Ok(expires_at),
            Ok(false) => {
                self.utxos.unlock(&outpoint);
                Err(WalletError::LockContention { outpoint: outpoint.to_string(), expires_at })
            }
            Err(err) => {
                self.utxos.unlock(&outpoint);
                Err(err.into())
            }
        }
    }

    pub fn unlock_utxo(&mut self, txid: &Txid, vout: u32) -> Result<bool, WalletError> {
        let local = self.utxos.unlock(&OutPoint::new(*txid, vout));
        let remote = self.services.wallet.unlock_utxo(&self.identifier, txid, vout)?;
        Ok(local || remote)
    }

    // -----------------------------------------------------------------------
    // Key index, webhooks, deletion
    // -----------------------------------------------------------------------

    /// Move the wallet to a new cosigning key index. Needs the primary key.
    pub fn upgrade_key_index(&mut self, key_index: u32) -> Result<(), WalletError> {
        let primary_public_key = self.primary_key()?.account_xpub(self.keys.secp(), key_index)?;
        let cosign = self.services.wallet.upgrade_key_index(&self.identifier, key_index, &primary_public_key)?;
        let cosign_key = *cosign
            .get(&key_index)
            .ok_or_else(|| WalletError::KeyDerivation(format!("service returned no cosigner key for key index {key_index}")))?;
        self.keys.set_cosign_public_keys(cosign);
        self.keys.add_key_index(key_index, primary_public_key, cosign_key);
        self.key_index = key_index;
        info!(identifier = %self.identifier, key_index, "key index upgraded");
        Ok(())
    }

    fn default_webhook_identifier(&self) -> String {
        format!("WALLET-{}", self.identifier)
    }

    pub fn setup_webhook(&self, url: &str, webhook_identifier: Option<&str>) -> Result<Webhook, WalletError> {
        let id = webhook_identifier.map(str::to_string).unwrap_or_else(|| self.default_webhook_identifier());
        Ok(self.services.wallet.setup_wallet_webhook(&self.identifier, &id, url)?)
    }

    pub fn delete_webhook(&self, webhook_identifier: Option<&str>) -> Result<bool, WalletError> {
        let id = webhook_identifier.map(str::to_string).unwrap_or_else(|| self.default_webhook_identifier());
        Ok(self.services.wallet.delete_wallet_webhook(&self.identifier, &id)?)
    }

    /// Delete the wallet from the service, proving ownership by signing the
    /// checksum address with the primary key.
    pub fn delete(&mut self, force: bool) -> Result<bool, WalletError> {
        let signature = self.primary_key()?.sign_message(self.keys.secp(), &self.checksum);
        let deleted = self.services.wallet.delete_wallet(&self.identifier, &self.checksum, &signature, force)?;
        if deleted {
            info!(identifier = %self.identifier, "wallet deleted");
            self.lock();
        }
        Ok(deleted)
    }
}

impl fmt::Debug for Wallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wallet")
            .field("identifier", &self.identifier)
            .field("key_index", &self.key_index)
            .field("keys", &self.keys)
            .field("locked", &self.is_locked())
            .field("utxos", &self.utxos.len())
            .finish()
    }
}

/// An unlocked wallet. Locks the wallet again when dropped.
#[derive(Debug)]
pub struct UnlockedWallet<'a> {
    wallet: &'a mut Wallet,
}

impl Deref for UnlockedWallet<'_> {
    type Target = Wallet;

    fn deref(&self) -> &Wallet {
        self.wallet
    }
}

impl DerefMut for UnlockedWallet<'_> {
    fn deref_mut(&mut self) -> &mut Wallet {
        self.wallet
    }
}

impl Drop for UnlockedWallet<'_> {
    fn drop(&mut self) {
        self.wallet.lock();
    }
}

fn random_identifier() -> String {
    let mut bytes = [0u8; WALLET_IDENTIFIER_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
