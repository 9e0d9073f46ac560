//! Shared test helpers for E2E and property tests.

use std::sync::Arc;

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::{Address, Network, PublicKey, ScriptBuf, Txid};

use keel_client::MemoryService;
use keel_core::types::Utxo;
use keel_wallet::{BackupInfo, CreateWalletOptions, Services, Wallet};

pub const NETWORK: Network = Network::Regtest;
pub const PASSPHRASE: &str = "correct horse battery staple";

/// Fresh in-memory service on regtest.
pub fn service() -> Arc<MemoryService> {
    Arc::new(MemoryService::new(NETWORK).unwrap())
}

pub fn services(service: &Arc<MemoryService>) -> Services {
    Services::from_client(Arc::clone(service))
}

/// Create and register a wallet named `identifier`.
pub fn create_wallet(service: &Arc<MemoryService>, identifier: &str) -> (Wallet, BackupInfo) {
    let options = CreateWalletOptions::new(PASSPHRASE, NETWORK).identifier(identifier);
    Wallet::create(services(service), options).unwrap()
}

/// Pay each value to a fresh receive address of `wallet`, confirmed six times.
pub fn fund_wallet(service: &MemoryService, wallet: &mut Wallet, values: &[u64]) -> Vec<Txid> {
    values
        .iter()
        .map(|&value| {
            let address = wallet.new_address().unwrap();
            service.fund(&address, value, 6).unwrap()
        })
        .collect()
}

/// P2PKH address outside any wallet, from a seed byte.
pub fn external_address(seed: u8) -> String {
    let secp = Secp256k1::new();
    let secret = SecretKey::from_slice(&[seed.max(1); 32]).unwrap();
    let public = PublicKey::new(secret.public_key(&secp));
    Address::p2pkh(public.pubkey_hash(), NETWORK).to_string()
}

/// Standalone UTXO with a unique txid per `seed`.
pub fn utxo(seed: u32, value: u64, confirmations: u32) -> Utxo {
    let mut txid = [0u8; 32];
    txid[..4].copy_from_slice(&seed.to_le_bytes());
    Utxo {
        txid: Txid::from_byte_array(txid),
        vout: 0,
        value,
        address: String::new(),
        path: format!("m/0'/0/{seed}"),
        redeem_script: ScriptBuf::new(),
        confirmations,
        locked: false,
    }
}
