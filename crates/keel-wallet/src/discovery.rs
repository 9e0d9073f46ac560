//! Batch address scanning.
//!
//! Addresses are derived `increment` at a time on each chain of each key
//! index and queried for unspent outputs. A batch with at least one funded
//! address means the scan continues on that chain; a fully empty batch ends
//! it. The [`CancelFlag`] is checked before every batch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use keel_core::constants::{CHANGE_CHAIN, EXTERNAL_CHAIN, MAX_PAGE_LIMIT};
use keel_core::path::WalletPath;
use keel_core::traits::BlockchainQuery;
use keel_core::types::{Balance, Page, SortDir, Utxo};

use crate::error::WalletError;
use crate::keys::WalletKeys;

/// Cooperative cancellation for long scans. Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Outcome of a completed scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Discovery {
    pub utxos: Vec<Utxo>,
    /// Number of addresses queried.
    pub scanned: u32,
}

impl Discovery {
    pub fn balance(&self) -> Balance {
        self.utxos.iter().fold(Balance::default(), |mut acc, u| {
            if u.is_confirmed() {
                acc.confirmed = acc.confirmed.saturating_add(u.value);
            } else {
                acc.unconfirmed = acc.unconfirmed.saturating_add(u.value);
            }
            acc
        })
    }
}

/// Scan every key index of `keys` on the external and change chains.
pub fn discover(
    keys: &mut WalletKeys,
    query: &dyn BlockchainQuery,
    increment: u32,
    cancel: &CancelFlag,
) -> Result<Discovery, WalletError> {
    if increment == 0 {
        return Err(WalletError::InvalidAmount("discovery increment must be positive".into()));
    }

    let mut found = Discovery::default();
    for key_index in keys.key_indices() {
        for chain in [EXTERNAL_CHAIN, CHANGE_CHAIN] {
            let mut start: u32 = 0;
            loop {
                if cancel.is_cancelled() {
                    info!(scanned = found.scanned, "discovery cancelled");
                    return Err(WalletError::Cancelled { scanned: found.scanned });
                }
                let funded = scan_batch(keys, query, key_index, chain, start, increment, &mut found)?;
                debug!(key_index, chain, start, funded, "batch scanned");
                if funded == 0 {
                    break;
                }
                start = start.saturating_add(increment);
            }
        }
    }

    info!(scanned = found.scanned, utxos = found.utxos.len(), "discovery finished");
    Ok(found)
}

/// Query one batch; returns how many of its addresses hold unspent outputs.
fn scan_batch(
    keys: &mut WalletKeys,
    query: &dyn BlockchainQuery,
    key_index: u32,
    chain: u32,
    start: u32,
    increment: u32,
    found: &mut Discovery,
) -> Result<u32, WalletError> {
    let mut funded = 0;
    for index in start..start.saturating_add(increment) {
        let path = WalletPath::new(key_index, chain, index)?;
        let address = keys.derive_address(&path)?.to_string();
        let redeem_script = keys.redeem_script(&path)?;
        found.scanned += 1;

        let mut page = Page::new(1, MAX_PAGE_LIMIT, SortDir::Asc)?;
        let mut any = false;
        loop {
            let result = query.address_unspent_outputs(&address, &page)?;
            for output in &result.data {
                any = true;
                found.utxos.push(Utxo {
                    txid: output.txid,
                    vout: output.vout,
                    value: output.value,
                    address: address.clone(),
                    path: path.to_string(),
                    redeem_script: redeem_script.clone(),
                    confirmations: output.confirmations,
                    locked: false,
                });
            }
            if !result.has_more() || result.data.is_empty() {
                break;
            }
            page = page.next();
        }
        if any {
            funded += 1;
        }
    }
    Ok(funded)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::keys::tests::test_keys;
    use bitcoin::hashes::Hash;
    use bitcoin::{ScriptBuf, Txid};
    use keel_core::error::{RemoteServiceError, Service};
    use keel_core::traits::RemoteResult;
    use keel_core::types::{AddressInfo, BlockInfo, BlockRef, Paginated, TransactionInfo, UnspentOutput};
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;

    /// Chain stub holding unspent outputs by address and counting queries.
    #[derive(Default)]
    pub(crate) struct Funded {
        outputs: HashMap<String, Vec<UnspentOutput>>,
        queries: Mutex<u32>,
        cancel_after: Option<(u32, CancelFlag)>,
    }

    impl Funded {
        pub(crate) fn fund(&mut self, address: String, value: u64) {
            let seed = self.outputs.len() as u8 + 1;
            self.outputs.entry(address.clone()).or_default().push(UnspentOutput {
                txid: Txid::from_byte_array([seed; 32]),
                vout: 0,
                value,
                address,
                script_pubkey: ScriptBuf::new(),
                confirmations: 1,
            });
        }
    }

    impl BlockchainQuery for Funded {
        fn transaction(&self, txid: &str) -> RemoteResult<TransactionInfo> {
            Err(RemoteServiceError::not_found(Service::Blockchain, "transaction", txid))
        }
        fn block(&self, block: &BlockRef) -> RemoteResult<BlockInfo> {
            Err(RemoteServiceError::not_found(Service::Blockchain, "block", block.to_string()))
        }
        fn all_blocks(&self, page: &Page) -> RemoteResult<Paginated<BlockInfo>> {
            Ok(Paginated::from_all(&[], page))
        }
        fn block_transactions(&self, _: &BlockRef, page: &Page) -> RemoteResult<Paginated<TransactionInfo>> {
            Ok(Paginated::from_all(&[], page))
        }
        fn address(&self, address: &str) -> RemoteResult<AddressInfo> {
            Ok(AddressInfo { address: address.into(), ..Default::default() })
        }
        fn address_transactions(&self, _: &str, page: &Page) -> RemoteResult<Paginated<TransactionInfo>> {
            Ok(Paginated::from_all(&[], page))
        }
        fn address_unconfirmed_transactions(&self, _: &str, page: &Page) -> RemoteResult<Paginated<TransactionInfo>> {
            Ok(Paginated::from_all(&[], page))
        }
        fn address_unspent_outputs(&self, address: &str, page: &Page) -> RemoteResult<Paginated<UnspentOutput>> {
            let mut queries = self.queries.lock().unwrap();
            *queries += 1;
            if let Some((after, flag)) = &self.cancel_after {
                if *queries >= *after {
                    flag.cancel();
                }
            }
            let outputs = self.outputs.get(address).cloned().unwrap_or_default();
            Ok(Paginated::from_all(&outputs, page))
        }
        fn verify_address(&self, _: &str, _: &str) -> RemoteResult<bool> {
            Ok(false)
        }
        fn price(&self) -> RemoteResult<BTreeMap<String, f64>> {
            Ok(BTreeMap::new())
        }
    }

    pub(crate) fn address_at(chain: u32, index: u32) -> String {
        test_keys().derive_address(&WalletPath::new(0, chain, index).unwrap()).unwrap().to_string()
    }

    #[test]
    fn empty_wallet_scans_one_batch_per_chain() {
        let chain = Funded::default();
        let found = discover(&mut test_keys(), &chain, 5, &CancelFlag::new()).unwrap();
        assert!(found.utxos.is_empty());
        assert_eq!(found.scanned, 10);
    }

    #[test]
    fn funded_batch_continues_scan() {
        let mut chain = Funded::default();
        chain.fund(address_at(0, 2), 10_000);
        chain.fund(address_at(0, 7), 20_000);
        chain.fund(address_at(1, 0), 5_000);

        let found = discover(&mut test_keys(), &chain, 5, &CancelFlag::new()).unwrap();
        assert_eq!(found.balance(), Balance { confirmed: 35_000, unconfirmed: 0 });
        // external: 3 batches (0..5, 5..10 funded, 10..15 empty); change: 2
        assert_eq!(found.scanned, 25);

        let utxo = found.utxos.iter().find(|u| u.value == 20_000).unwrap();
        assert_eq!(utxo.path, "m/0'/0/7");
        assert_eq!(utxo.address, address_at(0, 7));
        assert!(!utxo.redeem_script.is_empty());
    }

    #[test]
    fn address_beyond_empty_batch_is_missed() {
        let mut chain = Funded::default();
        chain.fund(address_at(0, 12), 10_000);
        let found = discover(&mut test_keys(), &chain, 5, &CancelFlag::new()).unwrap();
        assert!(found.utxos.is_empty());
    }

    #[test]
    fn cancellation_stops_between_batches() {
        let flag = CancelFlag::new();
        let mut chain = Funded { cancel_after: Some((3, flag.clone())), ..Default::default() };
        chain.fund(address_at(0, 0), 10_000);
        let err = discover(&mut test_keys(), &chain, 5, &flag).unwrap_err();
        // The batch in progress completes before the flag is seen.
        assert_eq!(err, WalletError::Cancelled { scanned: 5 });
    }

    #[test]
    fn zero_increment_rejected() {
        let err = discover(&mut test_keys(), &Funded::default(), 0, &CancelFlag::new()).unwrap_err();
        assert!(matches!(err, WalletError::InvalidAmount(_)));
    }
}
