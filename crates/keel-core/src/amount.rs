//! Conversion between decimal BTC strings and satoshi.
use bitcoin::{Amount, Denomination};

use crate::constants::COIN;
use crate::error::AmountError;

/// Parse a decimal BTC amount (`"0.001"`) into satoshi.
///
/// Rejects negative values and more than eight decimal places.
pub fn to_satoshi(btc: &str) -> Result<u64, AmountError> {
    let trimmed = btc.trim();
    if trimmed.is_empty() {
        return Err(AmountError::Invalid("empty amount".into()));
    }
    Amount::from_str_in(trimmed, Denomination::Bitcoin)
        .map(Amount::to_sat)
        .map_err(|e| AmountError::Invalid(format!("{trimmed}: {e}")))
}

/// Format satoshi as a decimal BTC string with eight decimal places.
pub fn to_btc(sat: u64) -> String {
    format!("{}.{:08}", sat / COIN, sat % COIN)
}

/// Sum a list of amounts, failing on overflow.
pub fn checked_sum<I: IntoIterator<Item = u64>>(values: I) -> Result<u64, AmountError> {
    values
        .into_iter()
        .try_fold(0u64, |acc, v| acc.checked_add(v))
        .ok_or(AmountError::Overflow)
}
