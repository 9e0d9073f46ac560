//! Wallet derivation paths.
//!
//! Every wallet address lives at `m/<key_index>'/<chain>/<index>`. The three
//! keys of the redeem script are derived from it as follows:
//!
//! - primary: `m/<key_index>'` account xpub, then `<chain>/<index>`
//! - backup: root xpub, then `<key_index>/<chain>/<index>` (all unhardened,
//!   so the backup private key is never needed to derive addresses)
//! - cosigner: the service's xpub for `<key_index>`, then `<chain>/<index>`
use std::fmt;
use std::str::FromStr;

use bitcoin::bip32::{ChildNumber, DerivationPath, Xpub};
use bitcoin::secp256k1::{Secp256k1, Verification};
use bitcoin::PublicKey;
use serde::{Deserialize, Serialize};

use crate::error::PathError;

const HARDENED_LIMIT: u32 = 1 << 31;

/// Position of one wallet address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WalletPath {
    pub key_index: u32,
    pub chain: u32,
    pub index: u32,
}

impl WalletPath {
    pub fn new(key_index: u32, chain: u32, index: u32) -> Result<Self, PathError> {
        for value in [key_index, chain, index] {
            if value >= HARDENED_LIMIT {
                return Err(PathError::IndexOutOfRange(value));
            }
        }
        Ok(Self { key_index, chain, index })
    }

    /// Hardened account path `m/<key_index>'` for the primary key.
    pub fn account_path(key_index: u32) -> DerivationPath {
        DerivationPath::from(vec![ChildNumber::Hardened { index: key_index }])
    }

    /// Full private derivation path for the primary key.
    pub fn primary_path(&self) -> DerivationPath {
        DerivationPath::from(vec![
            ChildNumber::Hardened { index: self.key_index },
            ChildNumber::Normal { index: self.chain },
            ChildNumber::Normal { index: self.index },
        ])
    }

    /// Path below the root for the backup key.
    pub fn backup_path(&self) -> DerivationPath {
        DerivationPath::from(vec![
            ChildNumber::Normal { index: self.key_index },
            ChildNumber::Normal { index: self.chain },
            ChildNumber::Normal { index: self.index },
        ])
    }

    /// Path below an account xpub (primary or cosigner).
    pub fn relative_path(&self) -> DerivationPath {
        DerivationPath::from(vec![
            ChildNumber::Normal { index: self.chain },
            ChildNumber::Normal { index: self.index },
        ])
    }
}

impl fmt::Display for WalletPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m/{}'/{}/{}", self.key_index, self.chain, self.index)
    }
}

impl FromStr for WalletPath {
    type Err = PathError;

    /// Accepts `m/0'/0/5`; the `M/` prefix and `h` hardening marker are tolerated.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || PathError::Malformed(s.to_string());
        let mut parts = s.trim().split('/');
        match parts.next() {
            Some("m") | Some("M") => {}
            _ => return Err(malformed()),
        }
        let account = parts.next().ok_or_else(malformed)?;
        let key_index = account
            .strip_suffix('\'')
            .or_else(|| account.strip_suffix('h'))
            .ok_or_else(malformed)?;
        let key_index: u32 = key_index.parse().map_err(|_| malformed())?;
        let chain: u32 = parts.next().ok_or_else(malformed)?.parse().map_err(|_| malformed())?;
        let index: u32 = parts.next().ok_or_else(malformed)?.parse().map_err(|_| malformed())?;
        if parts.next().is_some() {
            return Err(malformed());
        }
        Self::new(key_index, chain, index)
    }
}

/// The public half of a wallet: one xpub per role.
pub struct MultisigXpubs<'a> {
    pub primary_account: &'a Xpub,
    pub backup_root: &'a Xpub,
    pub cosign_account: &'a Xpub,
}

impl MultisigXpubs<'_> {
    /// Derive `[primary, backup, cosigner]` public keys for `path`.
    pub fn derive<C: Verification>(
        &self,
        secp: &Secp256k1<C>,
        path: &WalletPath,
    ) -> Result<[PublicKey; 3], PathError> {
        let fail = |e: bitcoin::bip32::Error| PathError::Malformed(format!("{path}: {e}"));
        let primary = self.primary_account.derive_pub(secp, &path.relative_path()).map_err(fail)?;
        let backup = self.backup_root.derive_pub(secp, &path.backup_path()).map_err(fail)?;
        let cosign = self.cosign_account.derive_pub(secp, &path.relative_path()).map_err(fail)?;
        Ok([
            PublicKey::new(primary.public_key),
            PublicKey::new(backup.public_key),
            PublicKey::new(cosign.public_key),
        ])
    }
}
