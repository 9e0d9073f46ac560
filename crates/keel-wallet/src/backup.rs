//! Backup sheet produced once at wallet creation.
//!
//! The sheet holds everything needed to recover funds without the remote
//! service: the encrypted primary mnemonic, the backup mnemonic in the clear,
//! and the cosigner public keys. It is exported as JSON or as a printable
//! text sheet.

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::path::Path;

use bitcoin::bip32::Xpub;
use bitcoin::Network;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::WalletError;
use crate::sweeper::SweeperConfig;

/// One cosigner public key and the path it was derived at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CosignKey {
    pub key_index: u32,
    pub xpub: Xpub,
    /// `M/<key_index>'`
    pub path: String,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct BackupInfo {
    #[zeroize(skip)]
    pub identifier: String,
    #[zeroize(skip)]
    pub network: Network,
    #[zeroize(skip)]
    pub encrypted_primary_mnemonic: String,
    pub backup_mnemonic: String,
    #[zeroize(skip)]
    pub cosign_public_keys: Vec<CosignKey>,
    #[zeroize(skip)]
    pub checksum: String,
}

impl BackupInfo {
    pub fn new(
        identifier: &str,
        network: Network,
        encrypted_primary_mnemonic: &str,
        backup_mnemonic: &str,
        cosign_public_keys: &BTreeMap<u32, Xpub>,
        checksum: &str,
    ) -> Self {
        Self {
            identifier: identifier.to_string(),
            network,
            encrypted_primary_mnemonic: encrypted_primary_mnemonic.to_string(),
            backup_mnemonic: backup_mnemonic.to_string(),
            cosign_public_keys: cosign_public_keys
                .iter()
                .map(|(&key_index, &xpub)| CosignKey { key_index, xpub, path: format!("M/{key_index}'") })
                .collect(),
            checksum: checksum.to_string(),
        }
    }

    pub fn cosign_key_map(&self) -> BTreeMap<u32, Xpub> {
        self.cosign_public_keys.iter().map(|k| (k.key_index, k.xpub)).collect()
    }

    pub fn to_json(&self) -> Result<String, WalletError> {
        serde_json::to_string_pretty(self).map_err(|e| WalletError::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, WalletError> {
        serde_json::from_str(json).map_err(|e| WalletError::Serialization(e.to_string()))
    }

    /// Printable recovery sheet.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "WALLET BACKUP");
        let _ = writeln!(out, "=============");
        let _ = writeln!(out, "Identifier: {}", self.identifier);
        let _ = writeln!(out, "Network:    {}", self.network);
        let _ = writeln!(out, "Checksum:   {}", self.checksum);
        let _ = writeln!(out);
        let _ = writeln!(out, "Encrypted primary mnemonic (needs the wallet passphrase):");
        let _ = writeln!(out, "{}", self.encrypted_primary_mnemonic);
        let _ = writeln!(out);
        let _ = writeln!(out, "Backup mnemonic (keep offline):");
        for (i, word) in self.backup_mnemonic.split_whitespace().enumerate() {
            let _ = writeln!(out, "{:>3}. {word}", i + 1);
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "Cosigner public keys:");
        for key in &self.cosign_public_keys {
            let _ = writeln!(out, "{}  {}", key.path, key.xpub);
        }
        out
    }

    /// Write the text sheet to `path`.
    pub fn write_text(&self, path: &Path) -> Result<(), WalletError> {
        std::fs::write(path, self.to_text()).map_err(|e| WalletError::IoError(format!("{}: {e}", path.display())))
    }

    /// Sweeper configuration from this sheet plus the wallet passphrase.
    pub fn sweeper_config(&self, passphrase: &str) -> SweeperConfig {
        SweeperConfig::new(
            self.encrypted_primary_mnemonic.clone(),
            passphrase,
            self.backup_mnemonic.clone(),
            self.cosign_key_map(),
            self.network,
        )
    }
}

impl fmt::Debug for BackupInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupInfo")
            .field("identifier", &self.identifier)
            .field("network", &self.network)
            .field("checksum", &self.checksum)
            .field("backup_mnemonic", &"[REDACTED]")
            .field("cosign_public_keys", &self.cosign_public_keys.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::tests::{test_keys, BACKUP};

    fn backup() -> BackupInfo {
        let keys = test_keys();
        BackupInfo::new("wallet-1", Network::Testnet, "deadbeef", BACKUP, keys.cosign_public_keys(), "mchecksum")
    }

    #[test]
    fn json_roundtrip() {
        let info = backup();
        assert_eq!(BackupInfo::from_json(&info.to_json().unwrap()).unwrap(), info);
    }

    #[test]
    fn cosign_keys_carry_paths() {
        let info = backup();
        assert_eq!(info.cosign_public_keys[0].path, "M/0'");
        assert_eq!(info.cosign_key_map(), *test_keys().cosign_public_keys());
    }

    #[test]
    fn text_sheet_numbers_backup_words() {
        let text = backup().to_text();
        assert!(text.contains("Identifier: wallet-1"));
        assert!(text.contains("  1. legal"));
        assert!(text.contains(" 12. yellow"));
        assert!(text.contains("M/0'  tpub"));
    }

    #[test]
    fn write_text_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.txt");
        backup().write_text(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), backup().to_text());
    }

    #[test]
    fn debug_redacts_mnemonic() {
        assert!(!format!("{:?}", backup()).contains("legal"));
    }

    #[test]
    fn sweeper_config_uses_sheet_material() {
        let config = backup().sweeper_config("pass");
        assert_eq!(config.encrypted_primary_mnemonic, "deadbeef");
        assert_eq!(config.backup_mnemonic.as_str(), BACKUP);
        assert_eq!(config.cosign_public_keys.len(), 1);
    }
}
