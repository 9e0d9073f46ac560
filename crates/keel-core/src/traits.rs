//! Collaborator interfaces.
//!
//! - [`BlockchainQuery`]: read-only chain data (blocks, transactions, addresses)
//! - [`WalletService`]: server-side wallet records, cosigning, broadcast, webhooks
//! - [`FeeOracle`]: current fee rates
//!
//! All calls are blocking and fallible; failures carry the service and
//! operation in [`RemoteServiceError`].
use std::collections::BTreeMap;

use bitcoin::bip32::Xpub;
use bitcoin::Txid;

use crate::error::RemoteServiceError;
use crate::types::{
    AddressInfo, Balance, BlockInfo, BlockRef, CosignRequest, Derivation, FeeRates, FeeStrategy,
    MaxSpendable, NewWallet, Page, Paginated, SendRequest, ServiceCoinSelection, Subscription,
    TransactionInfo, UnspentOutput, Utxo, WalletAddress, WalletRecord, WalletSummary, Webhook,
};

pub type RemoteResult<T> = Result<T, RemoteServiceError>;

/// Read-only blockchain data.
pub trait BlockchainQuery: Send + Sync {
    fn transaction(&self, txid: &str) -> RemoteResult<TransactionInfo>;

    fn block(&self, block: &BlockRef) -> RemoteResult<BlockInfo>;

    /// The current chain tip.
    fn block_latest(&self) -> RemoteResult<BlockInfo> {
        self.block(&BlockRef::Latest)
    }

    fn all_blocks(&self, page: &Page) -> RemoteResult<Paginated<BlockInfo>>;

    fn block_transactions(&self, block: &BlockRef, page: &Page) -> RemoteResult<Paginated<TransactionInfo>>;

    fn address(&self, address: &str) -> RemoteResult<AddressInfo>;

    fn address_transactions(&self, address: &str, page: &Page) -> RemoteResult<Paginated<TransactionInfo>>;

    fn address_unconfirmed_transactions(&self, address: &str, page: &Page) -> RemoteResult<Paginated<TransactionInfo>>;

    fn address_unspent_outputs(&self, address: &str, page: &Page) -> RemoteResult<Paginated<UnspentOutput>>;

    /// Check a signed message proving control of `address`.
    fn verify_address(&self, address: &str, signature: &str) -> RemoteResult<bool>;

    /// Exchange rates keyed by currency code.
    fn price(&self) -> RemoteResult<BTreeMap<String, f64>>;
}

/// Current network fee rates.
pub trait FeeOracle: Send + Sync {
    fn fee_per_kb(&self) -> RemoteResult<FeeRates>;
}

/// Server-side wallet management and the remote cosigner.
pub trait WalletService: Send + Sync {
    /// Register a wallet; returns the cosigner xpubs by key index.
    fn create_wallet(&self, wallet: &NewWallet) -> RemoteResult<BTreeMap<u32, Xpub>>;

    fn get_wallet(&self, identifier: &str) -> RemoteResult<WalletRecord>;

    /// Delete a wallet. `signature` signs `checksum` with the primary master key.
    fn delete_wallet(&self, identifier: &str, checksum: &str, signature: &str, force: bool) -> RemoteResult<bool>;

    /// Move the wallet to `key_index`; returns the updated cosigner xpubs.
    fn upgrade_key_index(&self, identifier: &str, key_index: u32, primary_public_key: &Xpub) -> RemoteResult<BTreeMap<u32, Xpub>>;

    fn balance(&self, identifier: &str) -> RemoteResult<Balance>;

    fn max_spendable(
        &self,
        identifier: &str,
        allow_zero_conf: bool,
        fee_strategy: FeeStrategy,
        output_count: usize,
    ) -> RemoteResult<MaxSpendable>;

    fn utxos(&self, identifier: &str, page: &Page) -> RemoteResult<Paginated<Utxo>>;

    fn transactions(&self, identifier: &str, page: &Page) -> RemoteResult<Paginated<TransactionInfo>>;

    fn addresses(&self, identifier: &str, page: &Page) -> RemoteResult<Paginated<WalletAddress>>;

    fn all_wallets(&self, page: &Page) -> RemoteResult<Paginated<WalletSummary>>;

    /// Reserve the next address index on `chain` for `key_index`.
    fn new_derivation(&self, identifier: &str, key_index: u32, chain: u32) -> RemoteResult<Derivation>;

    fn path_for_address(&self, identifier: &str, address: &str) -> RemoteResult<String>;

    fn coin_selection(
        &self,
        identifier: &str,
        amount: u64,
        lock: bool,
        allow_zero_conf: bool,
        fee_strategy: FeeStrategy,
    ) -> RemoteResult<ServiceCoinSelection>;

    /// Broadcast a fully signed transaction; returns its txid.
    fn send_transaction(&self, identifier: &str, request: &SendRequest) -> RemoteResult<String>;

    /// Cosigner signature (hex DER + sighash byte) over one input digest.
    fn cosign(&self, identifier: &str, request: &CosignRequest) -> RemoteResult<String>;

    /// Advisory lock; `false` when another session holds it.
    fn lock_utxo(&self, identifier: &str, txid: &Txid, vout: u32, ttl_secs: u64) -> RemoteResult<bool>;

    fn unlock_utxo(&self, identifier: &str, txid: &Txid, vout: u32) -> RemoteResult<bool>;

    fn setup_wallet_webhook(&self, identifier: &str, webhook_identifier: &str, url: &str) -> RemoteResult<Webhook>;

    fn delete_wallet_webhook(&self, identifier: &str, webhook_identifier: &str) -> RemoteResult<bool>;

    // Webhooks not tied to a wallet.

    fn setup_webhook(&self, url: &str, identifier: Option<&str>) -> RemoteResult<Webhook>;

    fn all_webhooks(&self, page: &Page) -> RemoteResult<Paginated<Webhook>>;

    fn get_webhook(&self, identifier: &str) -> RemoteResult<Webhook>;

    fn update_webhook(&self, identifier: &str, new_url: Option<&str>, new_identifier: Option<&str>) -> RemoteResult<Webhook>;

    fn delete_webhook(&self, identifier: &str) -> RemoteResult<bool>;

    fn webhook_events(&self, identifier: &str, page: &Page) -> RemoteResult<Paginated<Subscription>>;

    fn subscribe_transaction(&self, identifier: &str, txid: &str, confirmations: u32) -> RemoteResult<bool>;

    fn subscribe_address_transactions(&self, identifier: &str, address: &str, confirmations: u32) -> RemoteResult<bool>;

    fn batch_subscribe_address_transactions(&self, identifier: &str, subscriptions: &[Subscription]) -> RemoteResult<bool>;

    fn subscribe_new_blocks(&self, identifier: &str) -> RemoteResult<bool>;

    fn unsubscribe_transaction(&self, identifier: &str, txid: &str) -> RemoteResult<bool>;

    fn unsubscribe_address_transactions(&self, identifier: &str, address: &str) -> RemoteResult<bool>;

    fn unsubscribe_new_blocks(&self, identifier: &str) -> RemoteResult<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Service;

    struct Tip;

    impl BlockchainQuery for Tip {
        fn transaction(&self, txid: &str) -> RemoteResult<TransactionInfo> {
            Err(RemoteServiceError::not_found(Service::Blockchain, "transaction", txid))
        }
        fn block(&self, block: &BlockRef) -> RemoteResult<BlockInfo> {
            match block {
                BlockRef::Latest => Ok(BlockInfo { hash: "tip".into(), height: 100, ..Default::default() }),
                other => Err(RemoteServiceError::not_found(Service::Blockchain, "block", other.to_string())),
            }
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
        fn address_unspent_outputs(&self, _: &str, page: &Page) -> RemoteResult<Paginated<UnspentOutput>> {
            Ok(Paginated::from_all(&[], page))
        }
        fn verify_address(&self, _: &str, _: &str) -> RemoteResult<bool> {
            Ok(false)
        }
        fn price(&self) -> RemoteResult<BTreeMap<String, f64>> {
            Ok(BTreeMap::new())
        }
    }

    #[test]
    fn block_latest_defaults_to_latest_ref() {
        assert_eq!(Tip.block_latest().unwrap().height, 100);
        assert!(Tip.block(&BlockRef::Height(1)).is_err());
    }

    #[test]
    fn traits_are_object_safe() {
        let query: &dyn BlockchainQuery = &Tip;
        assert!(query.all_blocks(&Page::default()).unwrap().data.is_empty());
    }
}
