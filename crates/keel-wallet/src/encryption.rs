//! AES-256-GCM encryption of the primary mnemonic.
//!
//! The key is derived from the wallet passphrase with Argon2id.
//!
//! # Wire format
//! ```text
//! salt (16 bytes) || nonce (12 bytes) || ciphertext + auth_tag
//! ```

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::Argon2;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::WalletError;

const SALT_LEN: usize = 16;

const NONCE_LEN: usize = 12;

/// Minimum encrypted payload size (salt + nonce + auth tag).
const MIN_ENCRYPTED_LEN: usize = SALT_LEN + NONCE_LEN + 16;

/// Derive a 256-bit key from a passphrase and salt with Argon2id.
pub fn derive_key(passphrase: &[u8], salt: &[u8]) -> Result<Zeroizing<[u8; 32]>, WalletError> {
    let mut key = Zeroizing::new([0u8; 32]);
    Argon2::default()
        .hash_password_into(passphrase, salt, &mut key[..])
        .map_err(|e| WalletError::Encryption(e.to_string()))?;
    Ok(key)
}

/// Encrypt `plaintext` under `passphrase`. Returns `salt || nonce || ciphertext+tag`.
pub fn encrypt(plaintext: &[u8], passphrase: &[u8]) -> Result<Vec<u8>, WalletError> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

    let key = derive_key(passphrase, &salt)?;
    let cipher = Aes256Gcm::new_from_slice(&key[..])
        .map_err(|e| WalletError::Encryption(e.to_string()))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| WalletError::Encryption(e.to_string()))?;

    let mut result = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
    result.extend_from_slice(&salt);
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Decrypt data produced by [`encrypt`].
///
/// An authentication failure means the passphrase is wrong (or the data was
/// tampered with) and maps to [`WalletError::InvalidPassphrase`].
pub fn decrypt(encrypted: &[u8], passphrase: &[u8]) -> Result<Zeroizing<Vec<u8>>, WalletError> {
    if encrypted.len() < MIN_ENCRYPTED_LEN {
        return Err(WalletError::Decryption(format!(
            "encrypted data too short: {} < {MIN_ENCRYPTED_LEN}",
            encrypted.len()
        )));
    }

    let (salt, rest) = encrypted.split_at(SALT_LEN);
    let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);

    let key = derive_key(passphrase, salt)?;
    let cipher = Aes256Gcm::new_from_slice(&key[..])
        .map_err(|e| WalletError::Decryption(e.to_string()))?;

    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| WalletError::InvalidPassphrase)
}

/// Encrypt a mnemonic phrase and hex-encode the result for storage.
pub fn encrypt_mnemonic(phrase: &str, passphrase: &str) -> Result<String, WalletError> {
    encrypt(phrase.as_bytes(), passphrase.as_bytes()).map(hex::encode)
}

/// Reverse [`encrypt_mnemonic`].
pub fn decrypt_mnemonic(encrypted_hex: &str, passphrase: &str) -> Result<Zeroizing<String>, WalletError> {
    let encrypted = hex::decode(encrypted_hex.trim())
        .map_err(|e| WalletError::Decryption(format!("not hex: {e}")))?;
    let plain = decrypt(&encrypted, passphrase.as_bytes())?;
    let phrase = std::str::from_utf8(&plain)
        .map_err(|_| WalletError::Decryption("mnemonic is not UTF-8".into()))?;
    Ok(Zeroizing::new(phrase.to_string()))
}
