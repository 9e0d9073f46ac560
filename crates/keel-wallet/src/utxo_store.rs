//! Wallet UTXO set with time-limited advisory locks.
//!
//! A locked UTXO is never offered for selection until its lock expires or
//! is released. Lock expiry is tracked in unix seconds; every time-dependent
//! call has an `_at` variant taking an explicit `now` for deterministic use.

use std::collections::{BTreeMap, HashMap};

use bitcoin::OutPoint;
use chrono::Utc;
use tracing::debug;

use keel_core::types::{Balance, Utxo};

use crate::error::WalletError;

/// UTXOs owned by one wallet, keyed by outpoint.
#[derive(Debug, Clone, Default)]
pub struct UtxoStore {
    utxos: BTreeMap<OutPoint, Utxo>,
    /// Outpoint -> lock expiry (unix seconds).
    locks: HashMap<OutPoint, i64>,
}

impl UtxoStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the UTXO set. Locks on outpoints that are still present survive.
    pub fn replace(&mut self, utxos: impl IntoIterator<Item = Utxo>) {
        self.utxos = utxos.into_iter().map(|u| (u.outpoint(), u)).collect();
        let utxos = &self.utxos;
        self.locks.retain(|outpoint, _| utxos.contains_key(outpoint));
        debug!(utxos = self.utxos.len(), locks = self.locks.len(), "UTXO set replaced");
    }

    pub fn insert(&mut self, utxo: Utxo) {
        self.utxos.insert(utxo.outpoint(), utxo);
    }

    /// Drop a spent UTXO and any lock on it.
    pub fn remove(&mut self, outpoint: &OutPoint) -> Option<Utxo> {
        self.locks.remove(outpoint);
        self.utxos.remove(outpoint)
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<&Utxo> {
        self.utxos.get(outpoint)
    }

    pub fn len(&self) -> usize {
        self.utxos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utxos.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Utxo> {
        self.utxos.values()
    }

    pub fn balance(&self) -> Balance {
        self.utxos.values().fold(Balance::default(), |mut acc, u| {
            if u.is_confirmed() {
                acc.confirmed = acc.confirmed.saturating_add(u.value);
            } else {
                acc.unconfirmed = acc.unconfirmed.saturating_add(u.value);
            }
            acc
        })
    }

    /// Lock `outpoint` for `ttl_secs` seconds from now.
    pub fn lock(&mut self, outpoint: &OutPoint, ttl_secs: u64) -> Result<i64, WalletError> {
        self.lock_at(outpoint, ttl_secs, Utc::now().timestamp())
    }

    /// Lock `outpoint` until `now + ttl_secs`. Returns the expiry.
    ///
    /// Fails with [`WalletError::LockContention`] while an unexpired lock is held.
    pub fn lock_at(&mut self, outpoint: &OutPoint, ttl_secs: u64, now: i64) -> Result<i64, WalletError> {
        if let Some(&expires_at) = self.locks.get(outpoint) {
            if expires_at > now {
                return Err(WalletError::LockContention { outpoint: outpoint.to_string(), expires_at });
            }
        }
        let ttl = i64::try_from(ttl_secs).unwrap_or(i64::MAX);
        let expires_at = now.saturating_add(ttl);
        self.locks.insert(*outpoint, expires_at);
        debug!(%outpoint, expires_at, "UTXO locked");
        Ok(expires_at)
    }

    /// Release a lock. Returns whether an unexpired lock was held.
    pub fn unlock(&mut self, outpoint: &OutPoint) -> bool {
        self.unlock_at(outpoint, Utc::now().timestamp())
    }

    pub fn unlock_at(&mut self, outpoint: &OutPoint, now: i64) -> bool {
        matches!(self.locks.remove(outpoint), Some(expires_at) if expires_at > now)
    }

    pub fn is_locked(&self, outpoint: &OutPoint) -> bool {
        self.is_locked_at(outpoint, Utc::now().timestamp())
    }

    pub fn is_locked_at(&self, outpoint: &OutPoint, now: i64) -> bool {
        self.locks.get(outpoint).is_some_and(|&expires_at| expires_at > now)
    }

    /// Forget expired locks.
    pub fn purge_expired_at(&mut self, now: i64) {
        self.locks.retain(|_, expires_at| *expires_at > now);
    }

    /// UTXOs available for selection: not locked here or by the service,
    /// and confirmed unless `allow_zero_conf`.
    pub fn spendable(&self, allow_zero_conf: bool) -> Vec<Utxo> {
        self.spendable_at(allow_zero_conf, Utc::now().timestamp())
    }

    pub fn spendable_at(&self, allow_zero_conf: bool, now: i64) -> Vec<Utxo> {
        self.utxos
            .values()
            .filter(|u| allow_zero_conf || u.is_confirmed())
            .filter(|u| !u.locked && !self.is_locked_at(&u.outpoint(), now))
            .cloned()
            .collect()
    }
}
