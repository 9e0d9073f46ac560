//! In-process wallet service with a simulated chain and cosigner.
//!
//! [`MemoryService`] implements [`WalletService`], [`BlockchainQuery`] and
//! [`FeeOracle`] against state held in memory. Funding, mining, clock
//! movement and injected failures are driven explicitly, which makes it the
//! backing service for integration tests and offline demos.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::str::FromStr;

use bitcoin::absolute::LockTime;
use bitcoin::bip32::{Xpriv, Xpub};
use bitcoin::consensus::encode::{deserialize_hex, serialize_hex};
use bitcoin::ecdsa;
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::script::{Builder, Instruction};
use bitcoin::secp256k1::{All, Message, Secp256k1};
use bitcoin::sign_message::{signed_msg_hash, MessageSignature};
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, EcdsaSighashType, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid,
    Witness,
};
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info};

use keel_core::constants::{
    DEFAULT_SUBSCRIBE_CONFIRMATIONS, DEFAULT_UTXO_LOCK_TTL_SECS, DUST_THRESHOLD, OUTPUT_FRAMING_SIZE,
    P2SH_MULTISIG_INPUT_SIZE, P2SH_SCRIPT_PUBKEY_LEN, TX_OVERHEAD_SIZE,
};
use keel_core::error::{RemoteServiceError, Service};
use keel_core::path::{MultisigXpubs, WalletPath};
use keel_core::script::{multisig_redeem_script, p2sh_address};
use keel_core::traits::{BlockchainQuery, FeeOracle, RemoteResult, WalletService};
use keel_core::types::{
    AddressInfo, Balance, BlockInfo, BlockRef, CosignRequest, Derivation, EventType, FeeRates, FeeStrategy,
    MaxSpendable, NewWallet, Page, Paginated, SendRequest, ServiceCoinSelection, Subscription,
    TransactionInfo, UnspentOutput, Utxo, WalletAddress, WalletRecord, WalletSummary, Webhook,
};

use crate::error::ClientError;

/// Chain height before anything is mined.
pub const GENESIS_HEIGHT: u64 = 100;

const DEFAULT_COSIGNER_SEED: [u8; 32] = [7u8; 32];

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct ChainTx {
    tx: Transaction,
    height: Option<u64>,
    input_value: u64,
}

#[derive(Debug, Clone)]
struct ChainOutput {
    value: u64,
    address: String,
    script_pubkey: ScriptBuf,
    height: Option<u64>,
}

#[derive(Debug, Clone, Default)]
struct AddressStats {
    received: u64,
    sent: u64,
    txids: Vec<Txid>,
}

#[derive(Debug, Clone)]
struct WalletEntry {
    record: WalletRecord,
    next_index: HashMap<(u32, u32), u32>,
    /// Issued addresses in issue order.
    issued: Vec<String>,
    addresses: HashMap<String, (WalletPath, ScriptBuf)>,
    /// Outpoint -> lock expiry (unix seconds).
    locks: HashMap<OutPoint, i64>,
}

#[derive(Debug, Clone)]
struct WebhookEntry {
    webhook: Webhook,
    events: Vec<Subscription>,
}

#[derive(Debug)]
struct State {
    wallets: BTreeMap<String, WalletEntry>,
    outputs: BTreeMap<OutPoint, ChainOutput>,
    transactions: HashMap<Txid, ChainTx>,
    blocks: BTreeMap<u64, Vec<Txid>>,
    addresses: HashMap<String, AddressStats>,
    height: u64,
    clock_offset: i64,
    fee_rates: FeeRates,
    webhooks: BTreeMap<String, WebhookEntry>,
    next_webhook: u64,
    failures: HashMap<String, RemoteServiceError>,
    broadcasts: Vec<Transaction>,
    nonce: i64,
}

impl State {
    fn new() -> Self {
        Self {
            wallets: BTreeMap::new(),
            outputs: BTreeMap::new(),
            transactions: HashMap::new(),
            blocks: BTreeMap::new(),
            addresses: HashMap::new(),
            height: GENESIS_HEIGHT,
            clock_offset: 0,
            fee_rates: FeeRates::default(),
            webhooks: BTreeMap::new(),
            next_webhook: 1,
            failures: HashMap::new(),
            broadcasts: Vec::new(),
            nonce: 0,
        }
    }

    /// Fail with the error registered for `operation`, once.
    fn take_failure(&mut self, operation: &str) -> RemoteResult<()> {
        match self.failures.remove(operation) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn confirmations(&self, height: Option<u64>) -> u32 {
        match height {
            Some(h) if h <= self.height => u32::try_from(self.height - h + 1).unwrap_or(u32::MAX),
            _ => 0,
        }
    }

    fn wallet(&self, operation: &str, identifier: &str) -> RemoteResult<&WalletEntry> {
        self.wallets
            .get(identifier)
            .ok_or_else(|| RemoteServiceError::not_found(Service::Wallet, operation, identifier))
    }

    fn wallet_mut(&mut self, operation: &str, identifier: &str) -> RemoteResult<&mut WalletEntry> {
        self.wallets
            .get_mut(identifier)
            .ok_or_else(|| RemoteServiceError::not_found(Service::Wallet, operation, identifier))
    }

    /// Unspent outputs paying to addresses issued by `entry`.
    fn wallet_outputs<'a>(&'a self, entry: &'a WalletEntry) -> impl Iterator<Item = (&'a OutPoint, &'a ChainOutput)> + 'a {
        self.outputs.iter().filter(move |(_, out)| entry.addresses.contains_key(&out.address))
    }

    /// Wallet UTXOs, flagged `locked` while a lock is unexpired at `now`.
    fn wallet_utxos(&self, entry: &WalletEntry, now: i64) -> Vec<Utxo> {
        self.wallet_outputs(entry)
            .filter_map(|(outpoint, out)| {
                let (path, redeem_script) = entry.addresses.get(&out.address)?;
                Some(Utxo {
                    txid: outpoint.txid,
                    vout: outpoint.vout,
                    value: out.value,
                    address: out.address.clone(),
                    path: path.to_string(),
                    redeem_script: redeem_script.clone(),
                    confirmations: self.confirmations(out.height),
                    locked: entry.locks.get(outpoint).is_some_and(|expiry| *expiry > now),
                })
            })
            .collect()
    }

    fn wallet_balance(&self, entry: &WalletEntry) -> Balance {
        self.wallet_outputs(entry).fold(Balance::default(), |mut balance, (_, out)| {
            if out.height.is_some() {
                balance.confirmed = balance.confirmed.saturating_add(out.value);
            } else {
                balance.unconfirmed = balance.unconfirmed.saturating_add(out.value);
            }
            balance
        })
    }

    fn transaction_info(&self, txid: &Txid, entry: &ChainTx) -> TransactionInfo {
        let output_value = entry.tx.output.iter().map(|o| o.value.to_sat()).sum();
        TransactionInfo {
            hash: txid.to_string(),
            block_height: entry.height,
            confirmations: self.confirmations(entry.height),
            total_input_value: entry.input_value,
            total_output_value: output_value,
            raw: Some(serialize_hex(&entry.tx)),
            extra: Default::default(),
        }
    }

    /// Record `tx` on chain: spend its inputs and index its outputs.
    fn apply(&mut self, tx: Transaction, network: Network, height: Option<u64>) -> Txid {
        let txid = tx.compute_txid();
        let mut input_value = 0u64;
        for input in &tx.input {
            if let Some(spent) = self.outputs.remove(&input.previous_output) {
                input_value = input_value.saturating_add(spent.value);
                let stats = self.addresses.entry(spent.address).or_default();
                stats.sent = stats.sent.saturating_add(spent.value);
                stats.txids.push(txid);
            }
            for wallet in self.wallets.values_mut() {
                wallet.locks.remove(&input.previous_output);
            }
        }
        for (vout, output) in tx.output.iter().enumerate() {
            let Ok(address) = Address::from_script(&output.script_pubkey, network) else {
                continue;
            };
            let address = address.to_string();
            let stats = self.addresses.entry(address.clone()).or_default();
            stats.received = stats.received.saturating_add(output.value.to_sat());
            if stats.txids.last() != Some(&txid) {
                stats.txids.push(txid);
            }
            self.outputs.insert(
                OutPoint::new(txid, vout as u32),
                ChainOutput {
                    value: output.value.to_sat(),
                    address,
                    script_pubkey: output.script_pubkey.clone(),
                    height,
                },
            );
        }
        if let Some(h) = height {
            self.blocks.entry(h).or_default().push(txid);
        }
        self.transactions.insert(txid, ChainTx { tx, height, input_value });
        txid
    }
}

fn block_hash(height: u64) -> String {
    sha256d::Hash::hash(&height.to_le_bytes()).to_string()
}

fn rejected(service: Service, operation: &str, message: impl Into<String>) -> RemoteServiceError {
    RemoteServiceError::application(service, operation, 400, message)
}

fn conflict(service: Service, operation: &str, message: impl Into<String>) -> RemoteServiceError {
    RemoteServiceError::application(service, operation, 409, message)
}

fn fee_for(size: usize, fee_per_kb: u64) -> u64 {
    u64::try_from((size as u128 * fee_per_kb as u128).div_ceil(1000)).unwrap_or(u64::MAX)
}

fn multisig_size(inputs: usize, outputs: usize) -> usize {
    TX_OVERHEAD_SIZE + inputs * P2SH_MULTISIG_INPUT_SIZE + outputs * (OUTPUT_FRAMING_SIZE + P2SH_SCRIPT_PUBKEY_LEN)
}

// ---------------------------------------------------------------------------
// MemoryService
// ---------------------------------------------------------------------------

/// Wallet service, block explorer and fee oracle backed by memory.
pub struct MemoryService {
    network: Network,
    cosigner: Xpriv,
    secp: Secp256k1<All>,
    state: Mutex<State>,
}

impl MemoryService {
    /// Service with the default deterministic cosigner key.
    pub fn new(network: Network) -> Result<Self, ClientError> {
        Self::with_cosigner_seed(network, &DEFAULT_COSIGNER_SEED)
    }

    pub fn with_cosigner_seed(network: Network, seed: &[u8]) -> Result<Self, ClientError> {
        let cosigner = Xpriv::new_master(network, seed).map_err(|e| ClientError::Cosigner(e.to_string()))?;
        Ok(Self { network, cosigner, secp: Secp256k1::new(), state: Mutex::new(State::new()) })
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Current service time in unix seconds.
    pub fn now(&self) -> i64 {
        Utc::now().timestamp() + self.state.lock().clock_offset
    }

    pub fn height(&self) -> u64 {
        self.state.lock().height
    }

    /// Pay `value` to `address` from outside any wallet. With `confirmations`
    /// of zero the payment stays in the mempool.
    pub fn fund(&self, address: &str, value: u64, confirmations: u32) -> RemoteResult<Txid> {
        let address = Address::from_str(address)
            .map_err(|e| rejected(Service::Blockchain, "fund", e.to_string()))?
            .require_network(self.network)
            .map_err(|e| rejected(Service::Blockchain, "fund", e.to_string()))?;

        let mut state = self.state.lock();
        state.nonce += 1;
        let tx = Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: Builder::new().push_int(state.nonce).into_script(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut { value: Amount::from_sat(value), script_pubkey: address.script_pubkey() }],
        };
        let height = match confirmations {
            0 => None,
            n => Some((state.height + 1).saturating_sub(u64::from(n))),
        };
        let txid = state.apply(tx, self.network, height);
        debug!(%address, value, confirmations, %txid, "funded");
        Ok(txid)
    }

    /// Mine `blocks` blocks; mempool transactions land in the first one.
    pub fn mine(&self, blocks: u64) {
        if blocks == 0 {
            return;
        }
        let mut state = self.state.lock();
        let height = state.height + 1;
        let mut mined = Vec::new();
        for (txid, entry) in state.transactions.iter_mut() {
            if entry.height.is_none() {
                entry.height = Some(height);
                mined.push(*txid);
            }
        }
        for out in state.outputs.values_mut().filter(|o| o.height.is_none()) {
            out.height = Some(height);
        }
        state.blocks.entry(height).or_default().extend(mined);
        state.height += blocks;
        debug!(height = state.height, "mined");
    }

    /// Move the service clock forward; expires UTXO locks.
    pub fn advance_clock(&self, secs: i64) {
        self.state.lock().clock_offset += secs;
    }

    pub fn set_fee_rates(&self, rates: FeeRates) {
        self.state.lock().fee_rates = rates;
    }

    /// Make the next call of `operation` (a trait method name) fail with `err`.
    pub fn fail_next(&self, operation: &str, err: RemoteServiceError) {
        self.state.lock().failures.insert(operation.to_string(), err);
    }

    /// Every transaction accepted by `send_transaction`, in order.
    pub fn broadcasts(&self) -> Vec<Transaction> {
        self.state.lock().broadcasts.clone()
    }

    fn derive_address(&self, record: &WalletRecord, path: &WalletPath, operation: &str) -> RemoteResult<(String, ScriptBuf)> {
        let missing = || rejected(Service::Wallet, operation, format!("unknown key index {}", path.key_index));
        let xpubs = MultisigXpubs {
            primary_account: record.primary_public_keys.get(&path.key_index).ok_or_else(missing)?,
            backup_root: &record.backup_public_key,
            cosign_account: record.cosign_public_keys.get(&path.key_index).ok_or_else(missing)?,
        };
        let keys = xpubs.derive(&self.secp, path).map_err(|e| rejected(Service::Wallet, operation, e.to_string()))?;
        let redeem_script = multisig_redeem_script(&keys);
        let address = p2sh_address(&redeem_script, record.network)
            .map_err(|e| rejected(Service::Wallet, operation, e.to_string()))?;
        Ok((address.to_string(), redeem_script))
    }

    fn cosign_xpub(&self, key_index: u32) -> RemoteResult<Xpub> {
        let account = self
            .cosigner
            .derive_priv(&self.secp, &WalletPath::account_path(key_index))
            .map_err(|e| rejected(Service::Cosigner, "cosign_key", e.to_string()))?;
        Ok(Xpub::from_priv(&self.secp, &account))
    }

    /// A spend is accepted when every input is a wallet output whose
    /// scriptSig carries two signatures and the matching redeem script.
    fn check_input(entry: &WalletEntry, state: &State, input: &TxIn) -> Result<u64, String> {
        let out = state
            .outputs
            .get(&input.previous_output)
            .ok_or_else(|| format!("unknown or spent input {}", input.previous_output))?;
        let (_, redeem_script) = entry
            .addresses
            .get(&out.address)
            .ok_or_else(|| format!("input {} is not a wallet output", input.previous_output))?;
        let pushes = input
            .script_sig
            .instructions()
            .map(|i| match i {
                Ok(Instruction::PushBytes(bytes)) => Ok(bytes.as_bytes().to_vec()),
                _ => Err(format!("non-push scriptSig on {}", input.previous_output)),
            })
            .collect::<Result<Vec<_>, _>>()?;
        let Some((redeem, rest)) = pushes.split_last() else {
            return Err(format!("unsigned input {}", input.previous_output));
        };
        if redeem.as_slice() != redeem_script.as_bytes() {
            return Err(format!("wrong redeem script on {}", input.previous_output));
        }
        if rest.iter().filter(|push| !push.is_empty()).count() != 2 {
            return Err(format!("input {} needs two signatures", input.previous_output));
        }
        Ok(out.value)
    }
}

// ---------------------------------------------------------------------------
// FeeOracle
// ---------------------------------------------------------------------------

impl FeeOracle for MemoryService {
    fn fee_per_kb(&self) -> RemoteResult<FeeRates> {
        let mut state = self.state.lock();
        state.take_failure("fee_per_kb")?;
        Ok(state.fee_rates)
    }
}

// ---------------------------------------------------------------------------
// BlockchainQuery
// ---------------------------------------------------------------------------

impl BlockchainQuery for MemoryService {
    fn transaction(&self, txid: &str) -> RemoteResult<TransactionInfo> {
        let mut state = self.state.lock();
        state.take_failure("transaction")?;
        let not_found = || RemoteServiceError::not_found(Service::Blockchain, "transaction", txid);
        let parsed = Txid::from_str(txid).map_err(|_| not_found())?;
        let entry = state.transactions.get(&parsed).ok_or_else(not_found)?;
        Ok(state.transaction_info(&parsed, entry))
    }

    fn block(&self, block: &BlockRef) -> RemoteResult<BlockInfo> {
        let mut state = self.state.lock();
        state.take_failure("block")?;
        let height = match block {
            BlockRef::Latest => Some(state.height),
            BlockRef::Height(h) if *h <= state.height => Some(*h),
            BlockRef::Height(_) => None,
            BlockRef::Hash(hash) => (0..=state.height).rev().find(|h| &block_hash(*h) == hash),
        };
        let height = height.ok_or_else(|| RemoteServiceError::not_found(Service::Blockchain, "block", block.to_string()))?;
        Ok(BlockInfo {
            hash: block_hash(height),
            height,
            prev_block: height.checked_sub(1).map(block_hash),
            transactions: state.blocks.get(&height).map_or(0, |txs| txs.len() as u64),
            extra: Default::default(),
        })
    }

    fn all_blocks(&self, page: &Page) -> RemoteResult<Paginated<BlockInfo>> {
        let mut state = self.state.lock();
        state.take_failure("all_blocks")?;
        let blocks: Vec<BlockInfo> = (0..=state.height)
            .map(|height| BlockInfo {
                hash: block_hash(height),
                height,
                prev_block: height.checked_sub(1).map(block_hash),
                transactions: state.blocks.get(&height).map_or(0, |txs| txs.len() as u64),
                extra: Default::default(),
            })
            .collect();
        Ok(Paginated::from_all(&blocks, page))
    }

    fn block_transactions(&self, block: &BlockRef, page: &Page) -> RemoteResult<Paginated<TransactionInfo>> {
        let height = self.block(block)?.height;
        let state = self.state.lock();
        let infos: Vec<TransactionInfo> = state
            .blocks
            .get(&height)
            .into_iter()
            .flatten()
            .filter_map(|txid| state.transactions.get(txid).map(|tx| state.transaction_info(txid, tx)))
            .collect();
        Ok(Paginated::from_all(&infos, page))
    }

    fn address(&self, address: &str) -> RemoteResult<AddressInfo> {
        let mut state = self.state.lock();
        state.take_failure("address")?;
        let balance = state.outputs.values().filter(|o| o.address == address).map(|o| o.value).sum();
        let stats = state.addresses.get(address).cloned().unwrap_or_default();
        Ok(AddressInfo {
            address: address.to_string(),
            balance,
            received: stats.received,
            sent: stats.sent,
            transactions: stats.txids.len() as u64,
            extra: Default::default(),
        })
    }

    fn address_transactions(&self, address: &str, page: &Page) -> RemoteResult<Paginated<TransactionInfo>> {
        let mut state = self.state.lock();
        state.take_failure("address_transactions")?;
        let infos: Vec<TransactionInfo> = state
            .addresses
            .get(address)
            .map(|s| s.txids.as_slice())
            .unwrap_or_default()
            .iter()
            .filter_map(|txid| state.transactions.get(txid).map(|tx| state.transaction_info(txid, tx)))
            .collect();
        Ok(Paginated::from_all(&infos, page))
    }

    fn address_unconfirmed_transactions(&self, address: &str, page: &Page) -> RemoteResult<Paginated<TransactionInfo>> {
        let mut state = self.state.lock();
        state.take_failure("address_unconfirmed_transactions")?;
        let infos: Vec<TransactionInfo> = state
            .addresses
            .get(address)
            .map(|s| s.txids.as_slice())
            .unwrap_or_default()
            .iter()
            .filter_map(|txid| state.transactions.get(txid).map(|tx| (txid, tx)))
            .filter(|(_, tx)| tx.height.is_none())
            .map(|(txid, tx)| state.transaction_info(txid, tx))
            .collect();
        Ok(Paginated::from_all(&infos, page))
    }

    fn address_unspent_outputs(&self, address: &str, page: &Page) -> RemoteResult<Paginated<UnspentOutput>> {
        let mut state = self.state.lock();
        state.take_failure("address_unspent_outputs")?;
        let outputs: Vec<UnspentOutput> = state
            .outputs
            .iter()
            .filter(|(_, out)| out.address == address)
            .map(|(outpoint, out)| UnspentOutput {
                txid: outpoint.txid,
                vout: outpoint.vout,
                value: out.value,
                address: out.address.clone(),
                script_pubkey: out.script_pubkey.clone(),
                confirmations: state.confirmations(out.height),
            })
            .collect();
        Ok(Paginated::from_all(&outputs, page))
    }

    /// `signature` is a hex signed message of the address itself.
    fn verify_address(&self, address: &str, signature: &str) -> RemoteResult<bool> {
        self.state.lock().take_failure("verify_address")?;
        let Ok(parsed) = Address::from_str(address).and_then(|a| a.require_network(self.network)) else {
            return Ok(false);
        };
        let Some(signature) = hex::decode(signature).ok().and_then(|b| MessageSignature::from_slice(&b).ok()) else {
            return Ok(false);
        };
        Ok(signature.is_signed_by_address(&self.secp, &parsed, signed_msg_hash(address)).unwrap_or(false))
    }

    fn price(&self) -> RemoteResult<BTreeMap<String, f64>> {
        self.state.lock().take_failure("price")?;
        Ok(BTreeMap::from([("EUR".to_string(), 55_000.0), ("USD".to_string(), 60_000.0)]))
    }
}

// ---------------------------------------------------------------------------
// WalletService
// ---------------------------------------------------------------------------

impl WalletService for MemoryService {
    fn create_wallet(&self, wallet: &NewWallet) -> RemoteResult<BTreeMap<u32, Xpub>> {
        let op = "create_wallet";
        let mut state = self.state.lock();
        state.take_failure(op)?;
        if state.wallets.contains_key(&wallet.identifier) {
            return Err(conflict(Service::Wallet, op, format!("wallet {} exists", wallet.identifier)));
        }
        if wallet.network != self.network {
            return Err(rejected(Service::Wallet, op, format!("service runs on {}", self.network)));
        }
        let cosign_public_keys = BTreeMap::from([(wallet.key_index, self.cosign_xpub(wallet.key_index)?)]);
        let record = WalletRecord {
            identifier: wallet.identifier.clone(),
            network: wallet.network,
            key_index: wallet.key_index,
            primary_public_keys: BTreeMap::from([(wallet.key_index, wallet.primary_public_key)]),
            backup_public_key: wallet.backup_public_key,
            cosign_public_keys: cosign_public_keys.clone(),
            checksum: wallet.checksum.clone(),
            encrypted_primary_mnemonic: wallet.encrypted_primary_mnemonic.clone(),
        };
        state.wallets.insert(
            wallet.identifier.clone(),
            WalletEntry {
                record,
                next_index: HashMap::new(),
                issued: Vec::new(),
                addresses: HashMap::new(),
                locks: HashMap::new(),
            },
        );
        info!(identifier = %wallet.identifier, key_index = wallet.key_index, "wallet registered");
        Ok(cosign_public_keys)
    }

    fn get_wallet(&self, identifier: &str) -> RemoteResult<WalletRecord> {
        let mut state = self.state.lock();
        state.take_failure("get_wallet")?;
        Ok(state.wallet("get_wallet", identifier)?.record.clone())
    }

    fn delete_wallet(&self, identifier: &str, checksum: &str, signature: &str, force: bool) -> RemoteResult<bool> {
        let op = "delete_wallet";
        let mut state = self.state.lock();
        state.take_failure(op)?;
        let entry = state.wallet(op, identifier)?;
        if entry.record.checksum != checksum {
            return Err(rejected(Service::Wallet, op, "checksum mismatch"));
        }
        let address = Address::from_str(checksum)
            .and_then(|a| a.require_network(self.network))
            .map_err(|e| rejected(Service::Wallet, op, e.to_string()))?;
        let signature = hex::decode(signature)
            .ok()
            .and_then(|bytes| MessageSignature::from_slice(&bytes).ok())
            .ok_or_else(|| rejected(Service::Wallet, op, "malformed signature"))?;
        let valid = signature
            .is_signed_by_address(&self.secp, &address, signed_msg_hash(checksum))
            .unwrap_or(false);
        if !valid {
            return Err(RemoteServiceError::application(Service::Wallet, op, 401, "signature does not match checksum"));
        }
        if state.wallet_balance(entry).total() > 0 && !force {
            return Err(rejected(Service::Wallet, op, "wallet still holds funds"));
        }
        state.wallets.remove(identifier);
        info!(identifier, force, "wallet deleted");
        Ok(true)
    }

    fn upgrade_key_index(&self, identifier: &str, key_index: u32, primary_public_key: &Xpub) -> RemoteResult<BTreeMap<u32, Xpub>> {
        let op = "upgrade_key_index";
        let cosign = self.cosign_xpub(key_index)?;
        let mut state = self.state.lock();
        state.take_failure(op)?;
        let entry = state.wallet_mut(op, identifier)?;
        entry.record.primary_public_keys.insert(key_index, *primary_public_key);
        entry.record.cosign_public_keys.insert(key_index, cosign);
        entry.record.key_index = key_index;
        Ok(entry.record.cosign_public_keys.clone())
    }

    fn balance(&self, identifier: &str) -> RemoteResult<Balance> {
        let mut state = self.state.lock();
        state.take_failure("balance")?;
        let entry = state.wallet("balance", identifier)?;
        Ok(state.wallet_balance(entry))
    }

    fn max_spendable(
        &self,
        identifier: &str,
        allow_zero_conf: bool,
        fee_strategy: FeeStrategy,
        output_count: usize,
    ) -> RemoteResult<MaxSpendable> {
        let op = "max_spendable";
        let now = self.now();
        let mut state = self.state.lock();
        state.take_failure(op)?;
        let entry = state.wallet(op, identifier)?;
        let spendable: Vec<Utxo> = state
            .wallet_utxos(entry, now)
            .into_iter()
            .filter(|u| allow_zero_conf || u.is_confirmed())
            .filter(|u| !u.locked)
            .collect();
        if spendable.is_empty() {
            return Ok(MaxSpendable::default());
        }
        let total: u64 = spendable.iter().map(|u| u.value).sum();
        let size = multisig_size(spendable.len(), output_count.max(1));
        let fee = match fee_strategy {
            FeeStrategy::Fixed(fee) => fee,
            FeeStrategy::Optimal => fee_for(size, state.fee_rates.optimal),
            FeeStrategy::LowPriority => fee_for(size, state.fee_rates.low_priority),
        };
        let max = total.saturating_sub(fee);
        Ok(MaxSpendable { max: if max < DUST_THRESHOLD { 0 } else { max }, fee, inputs: spendable.len() })
    }

    fn utxos(&self, identifier: &str, page: &Page) -> RemoteResult<Paginated<Utxo>> {
        let now = self.now();
        let mut state = self.state.lock();
        state.take_failure("utxos")?;
        let entry = state.wallet("utxos", identifier)?;
        Ok(Paginated::from_all(&state.wallet_utxos(entry, now), page))
    }

    fn transactions(&self, identifier: &str, page: &Page) -> RemoteResult<Paginated<TransactionInfo>> {
        let mut state = self.state.lock();
        state.take_failure("transactions")?;
        let entry = state.wallet("transactions", identifier)?;
        let mut seen = BTreeSet::new();
        let infos: Vec<TransactionInfo> = entry
            .issued
            .iter()
            .filter_map(|address| state.addresses.get(address))
            .flat_map(|stats| stats.txids.iter())
            .filter(|txid| seen.insert(**txid))
            .filter_map(|txid| state.transactions.get(txid).map(|tx| state.transaction_info(txid, tx)))
            .collect();
        Ok(Paginated::from_all(&infos, page))
    }

    fn addresses(&self, identifier: &str, page: &Page) -> RemoteResult<Paginated<WalletAddress>> {
        let mut state = self.state.lock();
        state.take_failure("addresses")?;
        let entry = state.wallet("addresses", identifier)?;
        let addresses: Vec<WalletAddress> = entry
            .issued
            .iter()
            .filter_map(|address| {
                let (path, _) = entry.addresses.get(address)?;
                let balance = state.outputs.values().filter(|o| &o.address == address).map(|o| o.value).sum();
                Some(WalletAddress { address: address.clone(), path: path.to_string(), balance })
            })
            .collect();
        Ok(Paginated::from_all(&addresses, page))
    }

    fn all_wallets(&self, page: &Page) -> RemoteResult<Paginated<WalletSummary>> {
        let mut state = self.state.lock();
        state.take_failure("all_wallets")?;
        let summaries: Vec<WalletSummary> = state
            .wallets
            .values()
            .map(|entry| WalletSummary {
                identifier: entry.record.identifier.clone(),
                key_index: entry.record.key_index,
                balance: state.wallet_balance(entry),
            })
            .collect();
        Ok(Paginated::from_all(&summaries, page))
    }

    fn new_derivation(&self, identifier: &str, key_index: u32, chain: u32) -> RemoteResult<Derivation> {
        let op = "new_derivation";
        let mut state = self.state.lock();
        state.take_failure(op)?;
        let entry = state.wallet_mut(op, identifier)?;
        let index = entry.next_index.get(&(key_index, chain)).copied().unwrap_or(0);
        let path = WalletPath::new(key_index, chain, index).map_err(|e| rejected(Service::Wallet, op, e.to_string()))?;
        let (address, redeem_script) = self.derive_address(&entry.record, &path, op)?;
        entry.next_index.insert((key_index, chain), index + 1);
        entry.issued.push(address.clone());
        entry.addresses.insert(address.clone(), (path, redeem_script));
        Ok(Derivation { path: path.to_string(), address })
    }

    fn path_for_address(&self, identifier: &str, address: &str) -> RemoteResult<String> {
        let op = "path_for_address";
        let mut state = self.state.lock();
        state.take_failure(op)?;
        let entry = state.wallet(op, identifier)?;
        entry
            .addresses
            .get(address)
            .map(|(path, _)| path.to_string())
            .ok_or_else(|| RemoteServiceError::not_found(Service::Wallet, op, address))
    }

    fn coin_selection(
        &self,
        identifier: &str,
        amount: u64,
        lock: bool,
        allow_zero_conf: bool,
        fee_strategy: FeeStrategy,
    ) -> RemoteResult<ServiceCoinSelection> {
        let op = "coin_selection";
        let now = self.now();
        let mut state = self.state.lock();
        state.take_failure(op)?;
        let rates = state.fee_rates;
        let entry = state.wallet(op, identifier)?;
        let mut candidates: Vec<Utxo> = state
            .wallet_utxos(entry, now)
            .into_iter()
            .filter(|u| allow_zero_conf || u.is_confirmed())
            .filter(|u| !u.locked)
            .collect();
        candidates.sort_by(|a, b| b.value.cmp(&a.value));

        let mut selected = Vec::new();
        let mut total = 0u64;
        let mut fee = 0u64;
        for utxo in candidates {
            total = total.saturating_add(utxo.value);
            selected.push(utxo);
            let size = multisig_size(selected.len(), 2);
            fee = match fee_strategy {
                FeeStrategy::Fixed(fee) => fee,
                FeeStrategy::Optimal => fee_for(size, rates.optimal),
                FeeStrategy::LowPriority => fee_for(size, rates.low_priority),
            };
            if total >= amount.saturating_add(fee) {
                break;
            }
        }
        if total < amount.saturating_add(fee) || selected.is_empty() {
            return Err(rejected(Service::Wallet, op, format!("insufficient funds: have {total}, need {}", amount.saturating_add(fee))));
        }
        let mut change = total - amount - fee;
        if change < DUST_THRESHOLD {
            fee += change;
            change = 0;
        }
        if lock {
            let entry = state.wallet_mut(op, identifier)?;
            for utxo in &selected {
                entry.locks.insert(utxo.outpoint(), now + DEFAULT_UTXO_LOCK_TTL_SECS as i64);
            }
        }
        Ok(ServiceCoinSelection { utxos: selected, fee, change })
    }

    fn send_transaction(&self, identifier: &str, request: &SendRequest) -> RemoteResult<String> {
        let op = "send_transaction";
        let tx: Transaction = deserialize_hex(&request.raw_transaction)
            .map_err(|e| rejected(Service::Wallet, op, format!("malformed transaction: {e}")))?;
        let mut state = self.state.lock();
        state.take_failure(op)?;
        let entry = state.wallet(op, identifier)?;

        let mut input_value = 0u64;
        for input in &tx.input {
            let value = Self::check_input(entry, &state, input).map_err(|msg| rejected(Service::Wallet, op, msg))?;
            input_value = input_value.saturating_add(value);
        }
        let output_value: u64 = tx.output.iter().map(|o| o.value.to_sat()).sum();
        let fee = input_value
            .checked_sub(output_value)
            .ok_or_else(|| rejected(Service::Wallet, op, "outputs exceed inputs"))?;
        if request.check_fee {
            let minimum = fee_for(tx.total_size(), state.fee_rates.low_priority);
            if fee < minimum {
                return Err(rejected(Service::Wallet, op, format!("fee {fee} below minimum {minimum}")));
            }
        }

        state.broadcasts.push(tx.clone());
        let txid = state.apply(tx, self.network, None);
        info!(identifier, %txid, fee, "transaction accepted");
        Ok(txid.to_string())
    }

    fn cosign(&self, identifier: &str, request: &CosignRequest) -> RemoteResult<String> {
        let op = "cosign";
        let path = WalletPath::from_str(&request.path).map_err(|e| rejected(Service::Cosigner, op, e.to_string()))?;
        {
            let mut state = self.state.lock();
            state.take_failure(op)?;
            let entry = state.wallet(op, identifier)?;
            if !entry.record.cosign_public_keys.contains_key(&path.key_index) {
                return Err(rejected(Service::Cosigner, op, format!("unknown key index {}", path.key_index)));
            }
        }
        let digest: [u8; 32] = hex::decode(&request.sighash)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| rejected(Service::Cosigner, op, "sighash must be 32 bytes of hex"))?;
        let key = self
            .cosigner
            .derive_priv(&self.secp, &path.primary_path())
            .map_err(|e| rejected(Service::Cosigner, op, e.to_string()))?;
        let signature = self.secp.sign_ecdsa(&Message::from_digest(digest), &key.private_key);
        let signature = ecdsa::Signature { signature, sighash_type: EcdsaSighashType::All };
        debug!(identifier, %path, "cosigned");
        Ok(hex::encode(signature.to_vec()))
    }

    fn lock_utxo(&self, identifier: &str, txid: &Txid, vout: u32, ttl_secs: u64) -> RemoteResult<bool> {
        let op = "lock_utxo";
        let now = self.now();
        let mut state = self.state.lock();
        state.take_failure(op)?;
        let outpoint = OutPoint::new(*txid, vout);
        if !state.outputs.contains_key(&outpoint) {
            return Err(RemoteServiceError::not_found(Service::Wallet, op, outpoint.to_string()));
        }
        let entry = state.wallet_mut(op, identifier)?;
        if entry.locks.get(&outpoint).is_some_and(|expiry| *expiry > now) {
            return Ok(false);
        }
        entry.locks.insert(outpoint, now + ttl_secs as i64);
        Ok(true)
    }

    fn unlock_utxo(&self, identifier: &str, txid: &Txid, vout: u32) -> RemoteResult<bool> {
        let mut state = self.state.lock();
        state.take_failure("unlock_utxo")?;
        let entry = state.wallet_mut("unlock_utxo", identifier)?;
        Ok(entry.locks.remove(&OutPoint::new(*txid, vout)).is_some())
    }

    fn setup_wallet_webhook(&self, identifier: &str, webhook_identifier: &str, url: &str) -> RemoteResult<Webhook> {
        let op = "setup_wallet_webhook";
        let mut state = self.state.lock();
        state.take_failure(op)?;
        let events: Vec<Subscription> = state
            .wallet(op, identifier)?
            .issued
            .iter()
            .map(|address| Subscription::address(address.clone(), DEFAULT_SUBSCRIBE_CONFIRMATIONS))
            .collect();
        let webhook = Webhook { identifier: webhook_identifier.to_string(), url: url.to_string() };
        state.webhooks.insert(webhook_identifier.to_string(), WebhookEntry { webhook: webhook.clone(), events });
        Ok(webhook)
    }

    fn delete_wallet_webhook(&self, identifier: &str, webhook_identifier: &str) -> RemoteResult<bool> {
        let op = "delete_wallet_webhook";
        let mut state = self.state.lock();
        state.take_failure(op)?;
        state.wallet(op, identifier)?;
        Ok(state.webhooks.remove(webhook_identifier).is_some())
    }

    fn setup_webhook(&self, url: &str, identifier: Option<&str>) -> RemoteResult<Webhook> {
        let op = "setup_webhook";
        let mut state = self.state.lock();
        state.take_failure(op)?;
        let identifier = match identifier {
            Some(id) => id.to_string(),
            None => {
                state.next_webhook += 1;
                format!("WEBHOOK-{}", state.next_webhook - 1)
            }
        };
        if state.webhooks.contains_key(&identifier) {
            return Err(conflict(Service::Webhook, op, format!("webhook {identifier} exists")));
        }
        let webhook = Webhook { identifier: identifier.clone(), url: url.to_string() };
        state.webhooks.insert(identifier, WebhookEntry { webhook: webhook.clone(), events: Vec::new() });
        Ok(webhook)
    }

    fn all_webhooks(&self, page: &Page) -> RemoteResult<Paginated<Webhook>> {
        let mut state = self.state.lock();
        state.take_failure("all_webhooks")?;
        let hooks: Vec<Webhook> = state.webhooks.values().map(|w| w.webhook.clone()).collect();
        Ok(Paginated::from_all(&hooks, page))
    }

    fn get_webhook(&self, identifier: &str) -> RemoteResult<Webhook> {
        let mut state = self.state.lock();
        state.take_failure("get_webhook")?;
        state
            .webhooks
            .get(identifier)
            .map(|w| w.webhook.clone())
            .ok_or_else(|| RemoteServiceError::not_found(Service::Webhook, "get_webhook", identifier))
    }

    fn update_webhook(&self, identifier: &str, new_url: Option<&str>, new_identifier: Option<&str>) -> RemoteResult<Webhook> {
        let op = "update_webhook";
        let mut state = self.state.lock();
        state.take_failure(op)?;
        if let Some(new_id) = new_identifier {
            if new_id != identifier && state.webhooks.contains_key(new_id) {
                return Err(conflict(Service::Webhook, op, format!("webhook {new_id} exists")));
            }
        }
        let mut entry = state
            .webhooks
            .remove(identifier)
            .ok_or_else(|| RemoteServiceError::not_found(Service::Webhook, op, identifier))?;
        if let Some(url) = new_url {
            entry.webhook.url = url.to_string();
        }
        if let Some(new_id) = new_identifier {
            entry.webhook.identifier = new_id.to_string();
        }
        let webhook = entry.webhook.clone();
        state.webhooks.insert(webhook.identifier.clone(), entry);
        Ok(webhook)
    }

    fn delete_webhook(&self, identifier: &str) -> RemoteResult<bool> {
        let mut state = self.state.lock();
        state.take_failure("delete_webhook")?;
        Ok(state.webhooks.remove(identifier).is_some())
    }

    fn webhook_events(&self, identifier: &str, page: &Page) -> RemoteResult<Paginated<Subscription>> {
        let mut state = self.state.lock();
        state.take_failure("webhook_events")?;
        let entry = state
            .webhooks
            .get(identifier)
            .ok_or_else(|| RemoteServiceError::not_found(Service::Webhook, "webhook_events", identifier))?;
        Ok(Paginated::from_all(&entry.events, page))
    }

    fn subscribe_transaction(&self, identifier: &str, txid: &str, confirmations: u32) -> RemoteResult<bool> {
        self.subscribe("subscribe_transaction", identifier, vec![Subscription::transaction(txid, confirmations)])
    }

    fn subscribe_address_transactions(&self, identifier: &str, address: &str, confirmations: u32) -> RemoteResult<bool> {
        self.subscribe("subscribe_address_transactions", identifier, vec![Subscription::address(address, confirmations)])
    }

    fn batch_subscribe_address_transactions(&self, identifier: &str, subscriptions: &[Subscription]) -> RemoteResult<bool> {
        self.subscribe("batch_subscribe_address_transactions", identifier, subscriptions.to_vec())
    }

    fn subscribe_new_blocks(&self, identifier: &str) -> RemoteResult<bool> {
        self.subscribe("subscribe_new_blocks", identifier, vec![Subscription::new_blocks()])
    }

    fn unsubscribe_transaction(&self, identifier: &str, txid: &str) -> RemoteResult<bool> {
        self.unsubscribe("unsubscribe_transaction", identifier, |s| s.transaction.as_deref() == Some(txid))
    }

    fn unsubscribe_address_transactions(&self, identifier: &str, address: &str) -> RemoteResult<bool> {
        self.unsubscribe("unsubscribe_address_transactions", identifier, |s| s.address.as_deref() == Some(address))
    }

    fn unsubscribe_new_blocks(&self, identifier: &str) -> RemoteResult<bool> {
        self.unsubscribe("unsubscribe_new_blocks", identifier, |s| s.event_type == EventType::Block)
    }
}

impl MemoryService {
    /// Add subscriptions; `false` when all of them were already present.
    fn subscribe(&self, op: &str, identifier: &str, subscriptions: Vec<Subscription>) -> RemoteResult<bool> {
        let mut state = self.state.lock();
        state.take_failure(op)?;
        let entry = state
            .webhooks
            .get_mut(identifier)
            .ok_or_else(|| RemoteServiceError::not_found(Service::Webhook, op, identifier))?;
        let mut added = false;
        for subscription in subscriptions {
            if !entry.events.contains(&subscription) {
                entry.events.push(subscription);
                added = true;
            }
        }
        Ok(added)
    }

    fn unsubscribe(&self, op: &str, identifier: &str, matches: impl Fn(&Subscription) -> bool) -> RemoteResult<bool> {
        let mut state = self.state.lock();
        state.take_failure(op)?;
        let entry = state
            .webhooks
            .get_mut(identifier)
            .ok_or_else(|| RemoteServiceError::not_found(Service::Webhook, op, identifier))?;
        let before = entry.events.len();
        entry.events.retain(|s| !matches(s));
        Ok(entry.events.len() != before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::PublicKey;

    /// A registered wallet whose primary and backup keys come from fixed seeds.
    fn registered(service: &MemoryService) -> (Xpriv, String) {
        let secp = Secp256k1::new();
        let primary = Xpriv::new_master(Network::Regtest, &[1u8; 32]).unwrap();
        let backup = Xpriv::new_master(Network::Regtest, &[2u8; 32]).unwrap();
        let account = primary.derive_priv(&secp, &WalletPath::account_path(0)).unwrap();
        let checksum = Address::p2pkh(PublicKey::new(Xpub::from_priv(&secp, &primary).public_key).pubkey_hash(), Network::Regtest);
        service
            .create_wallet(&NewWallet {
                identifier: "w1".into(),
                network: Network::Regtest,
                key_index: 0,
                primary_public_key: Xpub::from_priv(&secp, &account),
                backup_public_key: Xpub::from_priv(&secp, &backup),
                checksum: checksum.to_string(),
                encrypted_primary_mnemonic: "00".into(),
            })
            .unwrap();
        (primary, checksum.to_string())
    }

    fn service() -> MemoryService {
        MemoryService::new(Network::Regtest).unwrap()
    }

    #[test]
    fn create_returns_cosigner_key_and_rejects_duplicates() {
        let service = service();
        registered(&service);
        let record = service.get_wallet("w1").unwrap();
        assert!(record.cosign_public_keys.contains_key(&0));

        let err = service
            .create_wallet(&NewWallet {
                identifier: "w1".into(),
                network: Network::Regtest,
                key_index: 0,
                primary_public_key: record.primary_public_keys[&0],
                backup_public_key: record.backup_public_key,
                checksum: record.checksum.clone(),
                encrypted_primary_mnemonic: String::new(),
            })
            .unwrap_err();
        assert!(matches!(err, RemoteServiceError::Application { status: 409, .. }));
    }

    #[test]
    fn derivations_advance_per_chain() {
        let service = service();
        registered(&service);
        let a = service.new_derivation("w1", 0, 0).unwrap();
        let b = service.new_derivation("w1", 0, 0).unwrap();
        let c = service.new_derivation("w1", 0, 1).unwrap();
        assert_eq!(a.path, "m/0'/0/0");
        assert_eq!(b.path, "m/0'/0/1");
        assert_eq!(c.path, "m/0'/1/0");
        assert_ne!(a.address, b.address);
        assert_eq!(service.path_for_address("w1", &b.address).unwrap(), "m/0'/0/1");
    }

    #[test]
    fn funding_and_mining_update_confirmations() {
        let service = service();
        registered(&service);
        let address = service.new_derivation("w1", 0, 0).unwrap().address;

        service.fund(&address, 50_000, 0).unwrap();
        service.fund(&address, 20_000, 3).unwrap();
        let balance = service.balance("w1").unwrap();
        assert_eq!(balance, Balance { confirmed: 20_000, unconfirmed: 50_000 });

        service.mine(1);
        let utxos = service.utxos("w1", &Page::default()).unwrap().data;
        let mut confirmations: Vec<u32> = utxos.iter().map(|u| u.confirmations).collect();
        confirmations.sort();
        assert_eq!(confirmations, vec![1, 4]);
        assert_eq!(service.balance("w1").unwrap().confirmed, 70_000);
    }

    #[test]
    fn lock_is_exclusive_until_expiry() {
        let service = service();
        registered(&service);
        let address = service.new_derivation("w1", 0, 0).unwrap().address;
        let txid = service.fund(&address, 10_000, 1).unwrap();

        assert!(service.lock_utxo("w1", &txid, 0, 60).unwrap());
        assert!(!service.lock_utxo("w1", &txid, 0, 60).unwrap());
        service.advance_clock(61);
        assert!(service.lock_utxo("w1", &txid, 0, 60).unwrap());
        assert!(service.unlock_utxo("w1", &txid, 0).unwrap());
        assert!(!service.unlock_utxo("w1", &txid, 0).unwrap());
    }

    #[test]
    fn listed_utxos_carry_the_lock_flag() {
        let service = service();
        registered(&service);
        let address = service.new_derivation("w1", 0, 0).unwrap().address;
        let txid = service.fund(&address, 10_000, 1).unwrap();

        service.lock_utxo("w1", &txid, 0, 60).unwrap();
        let listed = service.utxos("w1", &Page::default()).unwrap().data;
        assert!(listed[0].locked);

        service.advance_clock(61);
        let listed = service.utxos("w1", &Page::default()).unwrap().data;
        assert!(!listed[0].locked);
    }

    #[test]
    fn coin_selection_prefers_large_outputs() {
        let service = service();
        registered(&service);
        let address = service.new_derivation("w1", 0, 0).unwrap().address;
        service.fund(&address, 10_000, 1).unwrap();
        service.fund(&address, 90_000, 1).unwrap();

        let selection = service.coin_selection("w1", 50_000, true, false, FeeStrategy::Optimal).unwrap();
        assert_eq!(selection.utxos.len(), 1);
        assert_eq!(selection.utxos[0].value, 90_000);
        // 10 + 297 + 2 * 32 = 371 bytes at 10000 sat/kB
        assert_eq!(selection.fee, 3_710);
        assert_eq!(selection.change, 90_000 - 50_000 - 3_710);

        let again = service.coin_selection("w1", 50_000, false, false, FeeStrategy::Optimal);
        assert!(again.is_err());
    }

    #[test]
    fn cosign_signs_with_the_derived_key() {
        let service = service();
        registered(&service);
        let path = WalletPath::new(0, 0, 3).unwrap();
        let digest = [9u8; 32];
        let hex_sig = service
            .cosign("w1", &CosignRequest { path: path.to_string(), sighash: hex::encode(digest) })
            .unwrap();

        let signature = ecdsa::Signature::from_slice(&hex::decode(hex_sig).unwrap()).unwrap();
        let record = service.get_wallet("w1").unwrap();
        let key = record.cosign_public_keys[&0].derive_pub(&service.secp, &path.relative_path()).unwrap();
        service
            .secp
            .verify_ecdsa(&Message::from_digest(digest), &signature.signature, &key.public_key)
            .unwrap();
    }

    #[test]
    fn unsigned_spend_is_rejected() {
        let service = service();
        registered(&service);
        let address = service.new_derivation("w1", 0, 0).unwrap().address;
        let txid = service.fund(&address, 10_000, 1).unwrap();
        let tx = Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(txid, 0),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![],
        };
        let request = SendRequest { raw_transaction: serialize_hex(&tx), paths: vec![], check_fee: false };
        let err = service.send_transaction("w1", &request).unwrap_err();
        assert!(err.to_string().contains("unsigned input"));
        assert!(service.broadcasts().is_empty());
    }

    #[test]
    fn delete_requires_checksum_signature() {
        let service = service();
        let (primary, checksum) = registered(&service);
        let secp = Secp256k1::new();
        let digest = signed_msg_hash(&checksum);
        let sig = secp.sign_ecdsa_recoverable(&Message::from_digest(digest.to_byte_array()), &primary.private_key);
        let good = hex::encode(MessageSignature::new(sig, true).serialize());

        let err = service.delete_wallet("w1", &checksum, &"00".repeat(65), false).unwrap_err();
        assert!(matches!(err, RemoteServiceError::Application { .. }));
        assert!(service.delete_wallet("w1", &checksum, &good, false).unwrap());
        assert!(matches!(service.get_wallet("w1"), Err(RemoteServiceError::NotFound { .. })));
    }

    #[test]
    fn injected_failure_fires_once() {
        let service = service();
        service.fail_next("fee_per_kb", RemoteServiceError::application(Service::FeeOracle, "fee_per_kb", 503, "down"));
        assert!(service.fee_per_kb().is_err());
        assert_eq!(service.fee_per_kb().unwrap(), FeeRates::default());
    }

    #[test]
    fn webhooks_subscribe_and_unsubscribe() {
        let service = service();
        let hook = service.setup_webhook("https://example.com/hook", None).unwrap();
        assert!(service.subscribe_new_blocks(&hook.identifier).unwrap());
        assert!(!service.subscribe_new_blocks(&hook.identifier).unwrap());
        assert!(service.subscribe_transaction(&hook.identifier, "ab", 2).unwrap());
        assert_eq!(service.webhook_events(&hook.identifier, &Page::default()).unwrap().total, 2);
        assert!(service.unsubscribe_new_blocks(&hook.identifier).unwrap());

        let renamed = service.update_webhook(&hook.identifier, None, Some("mine")).unwrap();
        assert_eq!(renamed.url, "https://example.com/hook");
        assert!(service.get_webhook(&hook.identifier).is_err());
        assert!(service.delete_webhook("mine").unwrap());
    }

    #[test]
    fn blocks_are_addressable_by_hash_and_height() {
        let service = service();
        service.mine(2);
        let tip = service.block_latest().unwrap();
        assert_eq!(tip.height, GENESIS_HEIGHT + 2);
        let by_hash = service.block(&BlockRef::Hash(tip.hash.clone())).unwrap();
        assert_eq!(by_hash.height, tip.height);
        assert!(service.block(&BlockRef::Height(tip.height + 1)).is_err());
    }
}
