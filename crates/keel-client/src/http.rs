//! Blocking JSON-over-HTTP client for the wallet, blockchain and fee APIs.
//!
//! Every request carries the API key as a query parameter and an
//! `Authorization` header with an HMAC-SHA256 over
//! `METHOD\npath\ndate\nsha256(body)` keyed by the API secret.

use std::collections::BTreeMap;
use std::time::Duration;

use bitcoin::bip32::Xpub;
use bitcoin::Txid;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::blocking::Client;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use keel_core::error::{RemoteServiceError, Service};
use keel_core::traits::{BlockchainQuery, FeeOracle, RemoteResult, WalletService};
use keel_core::types::{
    AddressInfo, Balance, BlockInfo, BlockRef, CosignRequest, Derivation, FeeRates, FeeStrategy,
    MaxSpendable, NewWallet, Page, Paginated, SendRequest, ServiceCoinSelection, Subscription,
    TransactionInfo, UnspentOutput, Utxo, WalletAddress, WalletRecord, WalletSummary, Webhook,
};

use crate::config::ClientConfig;
use crate::error::ClientError;

type HmacSha256 = Hmac<Sha256>;

/// Request signature: hex HMAC-SHA256 of the canonical request.
pub fn sign_request(secret: &[u8], method: &str, path: &str, date: &str, body: &[u8]) -> Result<String, ClientError> {
    let content_hash = hex::encode(Sha256::digest(body));
    let canonical = format!("{method}\n{path}\n{date}\n{content_hash}");
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|e| ClientError::Http(e.to_string()))?;
    mac.update(canonical.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Map a non-success HTTP status to a service error.
pub fn status_error(service: Service, operation: &str, status: u16, resource: &str, body: &str) -> RemoteServiceError {
    if status == StatusCode::NOT_FOUND.as_u16() {
        RemoteServiceError::not_found(service, operation, resource)
    } else {
        let message = serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|v| v.get("msg").or_else(|| v.get("message")).and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| body.chars().take(200).collect());
        RemoteServiceError::application(service, operation, status, message)
    }
}

fn page_query(page: &Page) -> Vec<(&'static str, String)> {
    vec![
        ("page", page.page().to_string()),
        ("limit", page.limit().to_string()),
        ("sort_dir", page.sort_dir().to_string()),
    ]
}

#[derive(Deserialize)]
struct Flag {
    result: bool,
}

#[derive(Deserialize)]
struct CosignKeys {
    cosign_public_keys: BTreeMap<u32, Xpub>,
}

#[derive(Deserialize)]
struct PathResponse {
    path: String,
}

#[derive(Deserialize)]
struct TxidResponse {
    txid: String,
}

#[derive(Deserialize)]
struct SignatureResponse {
    signature: String,
}

/// HTTP implementation of [`WalletService`], [`BlockchainQuery`] and [`FeeOracle`].
pub struct HttpClient {
    config: ClientConfig,
    base_url: String,
    client: Client,
}

impl HttpClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ClientError::Http(e.to_string()))?;
        let base_url = config.base_url();
        Ok(Self { config, base_url, client })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn call<T: DeserializeOwned>(
        &self,
        service: Service,
        operation: &str,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> RemoteResult<T> {
        let transport = |message: String| RemoteServiceError::Transport {
            service,
            operation: operation.to_string(),
            message,
        };

        let body = match body {
            Some(value) => serde_json::to_vec(&value).map_err(|e| transport(e.to_string()))?,
            None => Vec::new(),
        };
        let date = Utc::now().to_rfc2822();
        let signature = sign_request(self.config.api_secret.as_bytes(), method.as_str(), path, &date, &body)
            .map_err(|e| transport(e.to_string()))?;

        let mut request = self
            .client
            .request(method.clone(), format!("{}{path}", self.base_url))
            .query(&[("api_key", self.config.api_key.as_str())])
            .query(query)
            .header("Date", date)
            .header("Authorization", format!("HMAC-SHA256 key={},signature={signature}", self.config.api_key));
        if !body.is_empty() {
            request = request.header("Content-Type", "application/json").body(body);
        }

        debug!(%service, operation, %method, path, "request");
        let response = request.send().map_err(|e| transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(status_error(service, operation, status.as_u16(), path, &text));
        }
        response.json::<T>().map_err(|e| RemoteServiceError::Decode {
            service,
            operation: operation.to_string(),
            message: e.to_string(),
        })
    }

    fn get<T: DeserializeOwned>(&self, service: Service, operation: &str, path: &str, query: &[(&str, String)]) -> RemoteResult<T> {
        self.call(service, operation, Method::GET, path, query, None)
    }

    fn post<T: DeserializeOwned>(&self, service: Service, operation: &str, path: &str, body: Value) -> RemoteResult<T> {
        self.call(service, operation, Method::POST, path, &[], Some(body))
    }

    fn delete<T: DeserializeOwned>(&self, service: Service, operation: &str, path: &str, query: &[(&str, String)], body: Option<Value>) -> RemoteResult<T> {
        self.call(service, operation, Method::DELETE, path, query, body)
    }

    fn flag(&self, service: Service, operation: &str, method: Method, path: &str, body: Option<Value>) -> RemoteResult<bool> {
        self.call::<Flag>(service, operation, method, path, &[], body).map(|f| f.result)
    }
}

impl BlockchainQuery for HttpClient {
    fn transaction(&self, txid: &str) -> RemoteResult<TransactionInfo> {
        self.get(Service::Blockchain, "transaction", &format!("/transaction/{txid}"), &[])
    }

    fn block(&self, block: &BlockRef) -> RemoteResult<BlockInfo> {
        self.get(Service::Blockchain, "block", &format!("/block/{}", block), &[])
    }

    fn all_blocks(&self, page: &Page) -> RemoteResult<Paginated<BlockInfo>> {
        self.get(Service::Blockchain, "all_blocks", "/all-blocks", &page_query(page))
    }

    fn block_transactions(&self, block: &BlockRef, page: &Page) -> RemoteResult<Paginated<TransactionInfo>> {
        let path = format!("/block/{}/transactions", block);
        self.get(Service::Blockchain, "block_transactions", &path, &page_query(page))
    }

    fn address(&self, address: &str) -> RemoteResult<AddressInfo> {
        self.get(Service::Blockchain, "address", &format!("/address/{address}"), &[])
    }

    fn address_transactions(&self, address: &str, page: &Page) -> RemoteResult<Paginated<TransactionInfo>> {
        let path = format!("/address/{address}/transactions");
        self.get(Service::Blockchain, "address_transactions", &path, &page_query(page))
    }

    fn address_unconfirmed_transactions(&self, address: &str, page: &Page) -> RemoteResult<Paginated<TransactionInfo>> {
        let path = format!("/address/{address}/unconfirmed-transactions");
        self.get(Service::Blockchain, "address_unconfirmed_transactions", &path, &page_query(page))
    }

    fn address_unspent_outputs(&self, address: &str, page: &Page) -> RemoteResult<Paginated<UnspentOutput>> {
        let path = format!("/address/{address}/unspent-outputs");
        self.get(Service::Blockchain, "address_unspent_outputs", &path, &page_query(page))
    }

    fn verify_address(&self, address: &str, signature: &str) -> RemoteResult<bool> {
        let path = format!("/address/{address}/verify");
        self.flag(Service::Blockchain, "verify_address", Method::POST, &path, Some(json!({ "signature": signature })))
    }

    fn price(&self) -> RemoteResult<BTreeMap<String, f64>> {
        self.get(Service::Blockchain, "price", "/price", &[])
    }
}

impl FeeOracle for HttpClient {
    fn fee_per_kb(&self) -> RemoteResult<FeeRates> {
        self.get(Service::FeeOracle, "fee_per_kb", "/fee-per-kb", &[])
    }
}

impl WalletService for HttpClient {
    fn create_wallet(&self, wallet: &NewWallet) -> RemoteResult<BTreeMap<u32, Xpub>> {
        let body = serde_json::to_value(wallet).unwrap_or(Value::Null);
        self.post::<CosignKeys>(Service::Wallet, "create_wallet", "/wallet", body)
            .map(|r| r.cosign_public_keys)
    }

    fn get_wallet(&self, identifier: &str) -> RemoteResult<WalletRecord> {
        self.get(Service::Wallet, "get_wallet", &format!("/wallet/{identifier}"), &[])
    }

    fn delete_wallet(&self, identifier: &str, checksum: &str, signature: &str, force: bool) -> RemoteResult<bool> {
        let body = json!({ "checksum": checksum, "signature": signature });
        self.delete::<Flag>(
            Service::Wallet,
            "delete_wallet",
            &format!("/wallet/{identifier}"),
            &[("force", force.to_string())],
            Some(body),
        )
        .map(|f| f.result)
    }

    fn upgrade_key_index(&self, identifier: &str, key_index: u32, primary_public_key: &Xpub) -> RemoteResult<BTreeMap<u32, Xpub>> {
        let body = json!({ "key_index": key_index, "primary_public_key": primary_public_key.to_string() });
        self.post::<CosignKeys>(Service::Wallet, "upgrade_key_index", &format!("/wallet/{identifier}/upgrade"), body)
            .map(|r| r.cosign_public_keys)
    }

    fn balance(&self, identifier: &str) -> RemoteResult<Balance> {
        self.get(Service::Wallet, "balance", &format!("/wallet/{identifier}/balance"), &[])
    }

    fn max_spendable(
        &self,
        identifier: &str,
        allow_zero_conf: bool,
        fee_strategy: FeeStrategy,
        output_count: usize,
    ) -> RemoteResult<MaxSpendable> {
        let query = [
            ("zeroconf", allow_zero_conf.to_string()),
            ("fee_strategy", fee_strategy.to_string()),
            ("outputs", output_count.to_string()),
        ];
        self.get(Service::Wallet, "max_spendable", &format!("/wallet/{identifier}/max-spendable"), &query)
    }

    fn utxos(&self, identifier: &str, page: &Page) -> RemoteResult<Paginated<Utxo>> {
        self.get(Service::Wallet, "utxos", &format!("/wallet/{identifier}/utxos"), &page_query(page))
    }

    fn transactions(&self, identifier: &str, page: &Page) -> RemoteResult<Paginated<TransactionInfo>> {
        self.get(Service::Wallet, "transactions", &format!("/wallet/{identifier}/transactions"), &page_query(page))
    }

    fn addresses(&self, identifier: &str, page: &Page) -> RemoteResult<Paginated<WalletAddress>> {
        self.get(Service::Wallet, "addresses", &format!("/wallet/{identifier}/addresses"), &page_query(page))
    }

    fn all_wallets(&self, page: &Page) -> RemoteResult<Paginated<WalletSummary>> {
        self.get(Service::Wallet, "all_wallets", "/wallets", &page_query(page))
    }

    fn new_derivation(&self, identifier: &str, key_index: u32, chain: u32) -> RemoteResult<Derivation> {
        let body = json!({ "key_index": key_index, "chain": chain });
        self.post(Service::Wallet, "new_derivation", &format!("/wallet/{identifier}/path"), body)
    }

    fn path_for_address(&self, identifier: &str, address: &str) -> RemoteResult<String> {
        let body = json!({ "address": address });
        self.post::<PathResponse>(Service::Wallet, "path_for_address", &format!("/wallet/{identifier}/address/path"), body)
            .map(|r| r.path)
    }

    fn coin_selection(
        &self,
        identifier: &str,
        amount: u64,
        lock: bool,
        allow_zero_conf: bool,
        fee_strategy: FeeStrategy,
    ) -> RemoteResult<ServiceCoinSelection> {
        let query = [
            ("amount", amount.to_string()),
            ("lock", lock.to_string()),
            ("zeroconf", allow_zero_conf.to_string()),
            ("fee_strategy", fee_strategy.to_string()),
        ];
        self.get(Service::Wallet, "coin_selection", &format!("/wallet/{identifier}/coin-selection"), &query)
    }

    fn send_transaction(&self, identifier: &str, request: &SendRequest) -> RemoteResult<String> {
        let body = serde_json::to_value(request).unwrap_or(Value::Null);
        self.post::<TxidResponse>(Service::Wallet, "send_transaction", &format!("/wallet/{identifier}/send"), body)
            .map(|r| r.txid)
    }

    fn cosign(&self, identifier: &str, request: &CosignRequest) -> RemoteResult<String> {
        let body = serde_json::to_value(request).unwrap_or(Value::Null);
        self.post::<SignatureResponse>(Service::Cosigner, "cosign", &format!("/wallet/{identifier}/cosign"), body)
            .map(|r| r.signature)
    }

    fn lock_utxo(&self, identifier: &str, txid: &Txid, vout: u32, ttl_secs: u64) -> RemoteResult<bool> {
        let body = json!({ "txid": txid.to_string(), "vout": vout, "ttl": ttl_secs });
        self.flag(Service::Wallet, "lock_utxo", Method::POST, &format!("/wallet/{identifier}/lock-utxo"), Some(body))
    }

    fn unlock_utxo(&self, identifier: &str, txid: &Txid, vout: u32) -> RemoteResult<bool> {
        let body = json!({ "txid": txid.to_string(), "vout": vout });
        self.flag(Service::Wallet, "unlock_utxo", Method::POST, &format!("/wallet/{identifier}/unlock-utxo"), Some(body))
    }

    fn setup_wallet_webhook(&self, identifier: &str, webhook_identifier: &str, url: &str) -> RemoteResult<Webhook> {
        let body = json!({ "webhook_identifier": webhook_identifier, "url": url });
        self.post(Service::Webhook, "setup_wallet_webhook", &format!("/wallet/{identifier}/webhook"), body)
    }

    fn delete_wallet_webhook(&self, identifier: &str, webhook_identifier: &str) -> RemoteResult<bool> {
        let path = format!("/wallet/{identifier}/webhook/{webhook_identifier}");
        self.flag(Service::Webhook, "delete_wallet_webhook", Method::DELETE, &path, None)
    }

    fn setup_webhook(&self, url: &str, identifier: Option<&str>) -> RemoteResult<Webhook> {
        self.post(Service::Webhook, "setup_webhook", "/webhook", json!({ "url": url, "identifier": identifier }))
    }

    fn all_webhooks(&self, page: &Page) -> RemoteResult<Paginated<Webhook>> {
        self.get(Service::Webhook, "all_webhooks", "/webhooks", &page_query(page))
    }

    fn get_webhook(&self, identifier: &str) -> RemoteResult<Webhook> {
        self.get(Service::Webhook, "get_webhook", &format!("/webhook/{identifier}"), &[])
    }

    fn update_webhook(&self, identifier: &str, new_url: Option<&str>, new_identifier: Option<&str>) -> RemoteResult<Webhook> {
        let body = json!({ "url": new_url, "identifier": new_identifier });
        self.call(Service::Webhook, "update_webhook", Method::PUT, &format!("/webhook/{identifier}"), &[], Some(body))
    }

    fn delete_webhook(&self, identifier: &str) -> RemoteResult<bool> {
        self.flag(Service::Webhook, "delete_webhook", Method::DELETE, &format!("/webhook/{identifier}"), None)
    }

    fn webhook_events(&self, identifier: &str, page: &Page) -> RemoteResult<Paginated<Subscription>> {
        self.get(Service::Webhook, "webhook_events", &format!("/webhook/{identifier}/events"), &page_query(page))
    }

    fn subscribe_transaction(&self, identifier: &str, txid: &str, confirmations: u32) -> RemoteResult<bool> {
        let body = serde_json::to_value(Subscription::transaction(txid, confirmations)).unwrap_or(Value::Null);
        self.flag(Service::Webhook, "subscribe_transaction", Method::POST, &format!("/webhook/{identifier}/events"), Some(body))
    }

    fn subscribe_address_transactions(&self, identifier: &str, address: &str, confirmations: u32) -> RemoteResult<bool> {
        let body = serde_json::to_value(Subscription::address(address, confirmations)).unwrap_or(Value::Null);
        let path = format!("/webhook/{identifier}/events");
        self.flag(Service::Webhook, "subscribe_address_transactions", Method::POST, &path, Some(body))
    }

    fn batch_subscribe_address_transactions(&self, identifier: &str, subscriptions: &[Subscription]) -> RemoteResult<bool> {
        let body = serde_json::to_value(subscriptions).unwrap_or(Value::Null);
        let path = format!("/webhook/{identifier}/events/batch");
        self.flag(Service::Webhook, "batch_subscribe_address_transactions", Method::POST, &path, Some(body))
    }

    fn subscribe_new_blocks(&self, identifier: &str) -> RemoteResult<bool> {
        let body = serde_json::to_value(Subscription::new_blocks()).unwrap_or(Value::Null);
        self.flag(Service::Webhook, "subscribe_new_blocks", Method::POST, &format!("/webhook/{identifier}/events"), Some(body))
    }

    fn unsubscribe_transaction(&self, identifier: &str, txid: &str) -> RemoteResult<bool> {
        let path = format!("/webhook/{identifier}/transaction/{txid}");
        self.flag(Service::Webhook, "unsubscribe_transaction", Method::DELETE, &path, None)
    }

    fn unsubscribe_address_transactions(&self, identifier: &str, address: &str) -> RemoteResult<bool> {
        let path = format!("/webhook/{identifier}/address-transactions/{address}");
        self.flag(Service::Webhook, "unsubscribe_address_transactions", Method::DELETE, &path, None)
    }

    fn unsubscribe_new_blocks(&self, identifier: &str) -> RemoteResult<bool> {
        self.flag(Service::Webhook, "unsubscribe_new_blocks", Method::DELETE, &format!("/webhook/{identifier}/block"), None)
    }
}
