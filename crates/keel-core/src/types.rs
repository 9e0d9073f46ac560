//! Core data types: UTXOs, pagination, balances, fee rates, wallet records
//! and webhook payloads.
use std::collections::BTreeMap;
use std::fmt;

use bitcoin::bip32::Xpub;
use bitcoin::{Network, OutPoint, ScriptBuf, Txid};
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_PAGE, DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT};
use crate::error::{PageError, PayloadError};

/// An unspent output owned by the wallet, with what is needed to spend it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Utxo {
    pub txid: Txid,
    pub vout: u32,
    /// Value in satoshi.
    pub value: u64,
    pub address: String,
    /// Derivation path of the address, `m/<key_index>'/<chain>/<index>`.
    pub path: String,
    pub redeem_script: ScriptBuf,
    pub confirmations: u32,
    /// Held by an unexpired service-side lock when listed.
    #[serde(default)]
    pub locked: bool,
}

impl Utxo {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.vout)
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmations > 0
    }
}

/// An unspent output as reported by a blockchain query (no wallet metadata).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspentOutput {
    pub txid: Txid,
    pub vout: u32,
    pub value: u64,
    pub address: String,
    pub script_pubkey: ScriptBuf,
    pub confirmations: u32,
}

impl UnspentOutput {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.vout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDir {
    #[default]
    Asc,
    Desc,
}

impl fmt::Display for SortDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        })
    }
}

/// Pagination request: `page >= 1`, `limit` in `1..=500`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawPage")]
pub struct Page {
    page: u32,
    limit: u32,
    sort_dir: SortDir,
}

/// Wire form of [`Page`], checked through [`Page::new`] on the way in.
#[derive(Deserialize)]
struct RawPage {
    page: u32,
    limit: u32,
    #[serde(default)]
    sort_dir: SortDir,
}

impl TryFrom<RawPage> for Page {
    type Error = PageError;

    fn try_from(raw: RawPage) -> Result<Self, Self::Error> {
        Page::new(raw.page, raw.limit, raw.sort_dir)
    }
}

impl Page {
    pub fn new(page: u32, limit: u32, sort_dir: SortDir) -> Result<Self, PageError> {
        if page == 0 {
            return Err(PageError::InvalidPage);
        }
        if limit == 0 || limit > MAX_PAGE_LIMIT {
            return Err(PageError::InvalidLimit { limit, max: MAX_PAGE_LIMIT });
        }
        Ok(Self { page, limit, sort_dir })
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn sort_dir(&self) -> SortDir {
        self.sort_dir
    }

    /// The following page with the same limit and direction.
    pub fn next(&self) -> Self {
        Self { page: self.page.saturating_add(1), ..*self }
    }

    /// Zero-based offset of the first item on this page.
    pub fn offset(&self) -> usize {
        (self.page as usize).saturating_sub(1) * self.limit as usize
    }

    /// Slice `items` according to this page.
    pub fn slice<T: Clone>(&self, items: &[T]) -> Vec<T> {
        items.iter().skip(self.offset()).take(self.limit as usize).cloned().collect()
    }
}

impl Default for Page {
    fn default() -> Self {
        Self { page: DEFAULT_PAGE, limit: DEFAULT_PAGE_LIMIT, sort_dir: SortDir::Asc }
    }
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Paginated<T> {
    pub data: Vec<T>,
    pub current_page: u32,
    pub per_page: u32,
    pub total: u64,
}

impl<T> Paginated<T> {
    /// Whether further pages may follow.
    pub fn has_more(&self) -> bool {
        (self.current_page as u64) * (self.per_page as u64) < self.total
    }
}

impl<T: Clone> Paginated<T> {
    pub fn from_all(items: &[T], page: &Page) -> Self {
        Self {
            data: page.slice(items),
            current_page: page.page(),
            per_page: page.limit(),
            total: items.len() as u64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Balance {
    pub confirmed: u64,
    pub unconfirmed: u64,
}

impl Balance {
    pub fn total(&self) -> u64 {
        self.confirmed.saturating_add(self.unconfirmed)
    }
}

/// Fee rates in satoshi per 1000 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeRates {
    pub optimal: u64,
    pub low_priority: u64,
}

impl Default for FeeRates {
    fn default() -> Self {
        Self {
            optimal: crate::constants::DEFAULT_OPTIMAL_FEE_PER_KB,
            low_priority: crate::constants::DEFAULT_LOW_PRIORITY_FEE_PER_KB,
        }
    }
}

/// How the fee of a transaction is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeStrategy {
    #[default]
    Optimal,
    LowPriority,
    /// Absolute fee in satoshi, independent of size.
    Fixed(u64),
}

impl fmt::Display for FeeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Optimal => f.write_str("optimal"),
            Self::LowPriority => f.write_str("low_priority"),
            Self::Fixed(fee) => write!(f, "fixed:{fee}"),
        }
    }
}

impl std::str::FromStr for FeeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "optimal" => Ok(Self::Optimal),
            "low_priority" | "low-priority" => Ok(Self::LowPriority),
            other => other
                .strip_prefix("fixed:")
                .and_then(|fee| fee.parse().ok())
                .map(Self::Fixed)
                .ok_or_else(|| format!("unknown fee strategy: {other}")),
        }
    }
}

/// An address the wallet has handed out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletAddress {
    pub address: String,
    pub path: String,
    #[serde(default)]
    pub balance: u64,
}

/// Largest single payment the wallet can make and what it would cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MaxSpendable {
    pub max: u64,
    pub fee: u64,
    pub inputs: usize,
}

/// A block addressed by height, hash or the chain tip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockRef {
    Height(u64),
    Hash(String),
    Latest,
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Height(h) => write!(f, "{h}"),
            Self::Hash(hash) => f.write_str(hash),
            Self::Latest => f.write_str("latest"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub hash: String,
    #[serde(default)]
    pub block_height: Option<u64>,
    #[serde(default)]
    pub confirmations: u32,
    #[serde(default)]
    pub total_input_value: u64,
    #[serde(default)]
    pub total_output_value: u64,
    #[serde(default)]
    pub raw: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BlockInfo {
    pub hash: String,
    pub height: u64,
    #[serde(default)]
    pub prev_block: Option<String>,
    #[serde(default)]
    pub transactions: u64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AddressInfo {
    pub address: String,
    #[serde(default)]
    pub balance: u64,
    #[serde(default)]
    pub received: u64,
    #[serde(default)]
    pub sent: u64,
    #[serde(default)]
    pub transactions: u64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Wallet service records
// ---------------------------------------------------------------------------

/// Server-side persisted state of a wallet. Holds no private material
/// beyond the passphrase-encrypted primary mnemonic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletRecord {
    pub identifier: String,
    pub network: Network,
    pub key_index: u32,
    /// Primary account xpubs (`m/<key_index>'`) by key index.
    pub primary_public_keys: BTreeMap<u32, Xpub>,
    /// Backup root xpub.
    pub backup_public_key: Xpub,
    /// Cosigner account xpubs by key index.
    pub cosign_public_keys: BTreeMap<u32, Xpub>,
    /// P2PKH address of the primary master key; proves key ownership.
    pub checksum: String,
    /// Hex of the passphrase-encrypted primary mnemonic.
    pub encrypted_primary_mnemonic: String,
}

/// Registration payload for a new wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewWallet {
    pub identifier: String,
    pub network: Network,
    pub key_index: u32,
    pub primary_public_key: Xpub,
    pub backup_public_key: Xpub,
    pub checksum: String,
    pub encrypted_primary_mnemonic: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletSummary {
    pub identifier: String,
    pub key_index: u32,
    pub balance: Balance,
}

/// A derived wallet address and its path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Derivation {
    pub path: String,
    pub address: String,
}

/// Request for the cosigner to sign one input digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CosignRequest {
    /// Wallet derivation path of the input being signed.
    pub path: String,
    /// Hex legacy sighash (SIGHASH_ALL) of the input.
    pub sighash: String,
}

/// A fully signed transaction handed to the service for broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    pub raw_transaction: String,
    pub paths: Vec<String>,
    pub check_fee: bool,
}

/// Server-side coin selection result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCoinSelection {
    pub utxos: Vec<Utxo>,
    pub fee: u64,
    pub change: u64,
}

// ---------------------------------------------------------------------------
// Webhooks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Webhook {
    pub identifier: String,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    AddressTransactions,
    Transaction,
    Block,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmations: Option<u32>,
}

impl Subscription {
    pub fn address(address: impl Into<String>, confirmations: u32) -> Self {
        Self {
            event_type: EventType::AddressTransactions,
            address: Some(address.into()),
            transaction: None,
            confirmations: Some(confirmations),
        }
    }

    pub fn transaction(txid: impl Into<String>, confirmations: u32) -> Self {
        Self {
            event_type: EventType::Transaction,
            address: None,
            transaction: Some(txid.into()),
            confirmations: Some(confirmations),
        }
    }

    pub fn new_blocks() -> Self {
        Self { event_type: EventType::Block, address: None, transaction: None, confirmations: None }
    }
}

/// Decoded webhook delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub event_type: EventType,
    #[serde(default)]
    pub network: Option<String>,
    /// Net value change per affected address, satoshi.
    #[serde(default)]
    pub addresses: BTreeMap<String, i64>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl WebhookEvent {
    /// Decode a raw webhook request body.
    pub fn from_json(payload: &str) -> Result<Self, PayloadError> {
        let value: serde_json::Value =
            serde_json::from_str(payload).map_err(|e| PayloadError::Malformed(e.to_string()))?;
        let kind = value
            .get("event_type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| PayloadError::Malformed("missing event_type".into()))?;
        if serde_json::from_value::<EventType>(serde_json::Value::String(kind.to_string())).is_err() {
            return Err(PayloadError::UnknownEvent(kind.to_string()));
        }
        serde_json::from_value(value).map_err(|e| PayloadError::Malformed(e.to_string()))
    }
}
