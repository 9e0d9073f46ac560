//! BIP-39 mnemonic generation, validation and seed derivation.

use bip39::{Language, Mnemonic};
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::WalletError;

/// Entropy for a 24-word phrase.
const ENTROPY_LEN: usize = 32;

/// Generate a fresh 24-word English mnemonic from OS randomness.
pub fn generate_mnemonic() -> Result<Mnemonic, WalletError> {
    let mut entropy = Zeroizing::new([0u8; ENTROPY_LEN]);
    rand::rngs::OsRng.fill_bytes(entropy.as_mut_slice());
    Mnemonic::from_entropy_in(Language::English, entropy.as_slice())
        .map_err(|e| WalletError::InvalidMnemonic(e.to_string()))
}

/// Parse a phrase, normalizing whitespace and case first.
pub fn parse_mnemonic(phrase: &str) -> Result<Mnemonic, WalletError> {
    let normalized = Zeroizing::new(
        phrase
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase(),
    );
    Mnemonic::parse_in(Language::English, normalized.as_str())
        .map_err(|e| WalletError::InvalidMnemonic(e.to_string()))
}

/// Check word list membership, word count and checksum.
pub fn validate_mnemonic(phrase: &str) -> Result<(), WalletError> {
    parse_mnemonic(phrase).map(|_| ())
}

/// 64-byte BIP-39 seed with an empty BIP-39 passphrase.
///
/// The wallet passphrase protects the encrypted mnemonic, not the seed.
pub fn mnemonic_to_seed(mnemonic: &Mnemonic) -> Zeroizing<[u8; 64]> {
    Zeroizing::new(mnemonic.to_seed(""))
}
