//! BIP-32 key derivation for the three wallet keys.
//!
//! The primary and backup master keys come from BIP-39 mnemonics. The
//! cosigner key never leaves the remote service; only its account xpubs are
//! known locally. See [`keel_core::path`] for the path layout.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use bip39::Mnemonic;
use bitcoin::bip32::{Xpriv, Xpub};
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{All, Message, Secp256k1, SecretKey};
use bitcoin::sign_message::{signed_msg_hash, MessageSignature};
use bitcoin::{Address, Network, PublicKey, ScriptBuf};

use keel_core::path::{MultisigXpubs, WalletPath};
use keel_core::script::{multisig_redeem_script, p2sh_address};
use keel_core::types::WalletRecord;

use crate::error::WalletError;
use crate::mnemonic::mnemonic_to_seed;

/// Which wallet key a master key is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRole {
    Primary,
    Backup,
}

/// A BIP-32 master private key. The secret scalar is erased on drop.
pub struct MasterKey {
    xpriv: Xpriv,
    role: KeyRole,
}

/// The primary master key, held only while the wallet is unlocked.
pub type PrimaryKey = MasterKey;

impl MasterKey {
    pub fn from_mnemonic(mnemonic: &Mnemonic, network: Network, role: KeyRole) -> Result<Self, WalletError> {
        let seed = mnemonic_to_seed(mnemonic);
        let xpriv = Xpriv::new_master(network, &seed[..])
            .map_err(|e| WalletError::KeyDerivation(e.to_string()))?;
        Ok(Self { xpriv, role })
    }

    pub fn from_xpriv(xpriv: Xpriv, role: KeyRole) -> Self {
        Self { xpriv, role }
    }

    pub fn role(&self) -> KeyRole {
        self.role
    }

    pub fn xpriv(&self) -> &Xpriv {
        &self.xpriv
    }

    /// Root xpub (`M`). Used as the backup public key.
    pub fn root_xpub(&self, secp: &Secp256k1<All>) -> Xpub {
        Xpub::from_priv(secp, &self.xpriv)
    }

    /// Hardened account xpub `M/<key_index>'`. Used as the primary public key.
    pub fn account_xpub(&self, secp: &Secp256k1<All>, key_index: u32) -> Result<Xpub, WalletError> {
        let account = self
            .xpriv
            .derive_priv(secp, &WalletPath::account_path(key_index))
            .map_err(|e| WalletError::KeyDerivation(e.to_string()))?;
        Ok(Xpub::from_priv(secp, &account))
    }

    /// Private key for one wallet address, following this key's role.
    pub fn signing_key(&self, secp: &Secp256k1<All>, path: &WalletPath) -> Result<SecretKey, WalletError> {
        let derivation = match self.role {
            KeyRole::Primary => path.primary_path(),
            KeyRole::Backup => path.backup_path(),
        };
        self.xpriv
            .derive_priv(secp, &derivation)
            .map(|child| child.private_key)
            .map_err(|e| WalletError::KeyDerivation(format!("{path}: {e}")))
    }

    /// P2PKH address of the master public key, proving possession of this key.
    pub fn checksum_address(&self, secp: &Secp256k1<All>) -> Address {
        let public = PublicKey::new(self.root_xpub(secp).public_key);
        Address::p2pkh(public.pubkey_hash(), self.xpriv.network)
    }

    /// Sign `message` (Bitcoin signed-message format) with the master key.
    /// Returns the 65-byte recoverable signature as hex.
    pub fn sign_message(&self, secp: &Secp256k1<All>, message: &str) -> String {
        let digest = signed_msg_hash(message);
        let msg = Message::from_digest(digest.to_byte_array());
        let signature = secp.sign_ecdsa_recoverable(&msg, &self.xpriv.private_key);
        hex::encode(MessageSignature::new(signature, true).serialize())
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.xpriv.private_key.non_secure_erase();
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey")
            .field("role", &self.role)
            .field("xpriv", &"[REDACTED]")
            .finish()
    }
}

/// Public key material of a wallet: everything needed to derive addresses
/// and redeem scripts without any private key.
#[derive(Clone)]
pub struct WalletKeys {
    network: Network,
    primary_public_keys: BTreeMap<u32, Xpub>,
    backup_public_key: Xpub,
    cosign_public_keys: BTreeMap<u32, Xpub>,
    /// Reverse lookup: address -> path.
    address_to_path: HashMap<String, WalletPath>,
    secp: Secp256k1<All>,
}

impl WalletKeys {
    pub fn new(
        network: Network,
        primary_public_keys: BTreeMap<u32, Xpub>,
        backup_public_key: Xpub,
        cosign_public_keys: BTreeMap<u32, Xpub>,
    ) -> Self {
        Self {
            network,
            primary_public_keys,
            backup_public_key,
            cosign_public_keys,
            address_to_path: HashMap::new(),
            secp: Secp256k1::new(),
        }
    }

    pub fn from_record(record: &WalletRecord) -> Self {
        Self::new(
            record.network,
            record.primary_public_keys.clone(),
            record.backup_public_key,
            record.cosign_public_keys.clone(),
        )
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn secp(&self) -> &Secp256k1<All> {
        &self.secp
    }

    pub fn primary_public_keys(&self) -> &BTreeMap<u32, Xpub> {
        &self.primary_public_keys
    }

    pub fn backup_public_key(&self) -> &Xpub {
        &self.backup_public_key
    }

    pub fn cosign_public_keys(&self) -> &BTreeMap<u32, Xpub> {
        &self.cosign_public_keys
    }

    /// Key indices for which both the primary and the cosigner xpub are known.
    pub fn key_indices(&self) -> Vec<u32> {
        self.cosign_public_keys
            .keys()
            .filter(|ki| self.primary_public_keys.contains_key(ki))
            .copied()
            .collect()
    }

    /// Register the keys of a new key index.
    pub fn add_key_index(&mut self, key_index: u32, primary: Xpub, cosign: Xpub) {
        self.primary_public_keys.insert(key_index, primary);
        self.cosign_public_keys.insert(key_index, cosign);
    }

    /// Replace the cosigner xpubs (after a key index upgrade).
    pub fn set_cosign_public_keys(&mut self, cosign_public_keys: BTreeMap<u32, Xpub>) {
        self.cosign_public_keys = cosign_public_keys;
    }

    /// `[primary, backup, cosigner]` public keys at `path`.
    pub fn public_keys(&self, path: &WalletPath) -> Result<[PublicKey; 3], WalletError> {
        let missing = |what: &str| WalletError::KeyDerivation(format!("no {what} key for key index {}", path.key_index));
        let xpubs = MultisigXpubs {
            primary_account: self.primary_public_keys.get(&path.key_index).ok_or_else(|| missing("primary"))?,
            backup_root: &self.backup_public_key,
            cosign_account: self.cosign_public_keys.get(&path.key_index).ok_or_else(|| missing("cosigner"))?,
        };
        Ok(xpubs.derive(&self.secp, path)?)
    }

    pub fn redeem_script(&self, path: &WalletPath) -> Result<ScriptBuf, WalletError> {
        Ok(multisig_redeem_script(&self.public_keys(path)?))
    }

    /// Derive the P2SH address at `path` and remember it for reverse lookup.
    pub fn derive_address(&mut self, path: &WalletPath) -> Result<Address, WalletError> {
        let address = p2sh_address(&self.redeem_script(path)?, self.network)?;
        self.address_to_path.insert(address.to_string(), *path);
        Ok(address)
    }

    /// Path of an address previously produced by [`derive_address`](Self::derive_address).
    pub fn path_for_address(&self, address: &str) -> Option<WalletPath> {
        self.address_to_path.get(address).copied()
    }
}

impl fmt::Debug for WalletKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletKeys")
            .field("network", &self.network)
            .field("key_indices", &self.key_indices())
            .field("known_addresses", &self.address_to_path.len())
            .finish()
    }
}
