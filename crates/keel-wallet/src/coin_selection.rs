//! UTXO selection.
//!
//! Largest-first greedy selection by default: fewer, larger inputs keep the
//! transaction (and its fee) small. With `randomize` the candidates are
//! shuffled first so selections do not reveal wallet structure.

use rand::seq::SliceRandom;

use keel_core::types::Utxo;

use crate::error::WalletError;
use crate::utxo_store::UtxoStore;

/// Filtering and ordering options for a selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelectionPolicy {
    /// Accept UTXOs with zero confirmations.
    pub allow_zero_conf: bool,
    /// Shuffle candidates instead of taking the largest first.
    pub randomize: bool,
}

/// Result of coin selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinSelection {
    pub selected: Vec<Utxo>,
    /// Sum of the selected values.
    pub total: u64,
    /// Fee covered by the selection (zero for fee-less selection).
    pub fee: u64,
    /// `total - target - fee`, before any dust folding.
    pub change: u64,
}

/// Greedy coin selector.
pub struct CoinSelector;

impl CoinSelector {
    /// Select from `candidates` until the sum reaches `target`.
    ///
    /// `candidates` must already exclude locked UTXOs (see
    /// [`select_from_store`](Self::select_from_store)); unconfirmed ones are
    /// dropped here unless the policy allows them.
    pub fn select(candidates: &[Utxo], target: u64, policy: &SelectionPolicy) -> Result<CoinSelection, WalletError> {
        Self::select_with_fee(candidates, target, |_| 0, policy)
    }

    /// Select from the unlocked UTXOs of `store` at `now`.
    pub fn select_from_store(
        store: &UtxoStore,
        target: u64,
        policy: &SelectionPolicy,
        now: i64,
    ) -> Result<CoinSelection, WalletError> {
        Self::select(&store.spendable_at(policy.allow_zero_conf, now), target, policy)
    }

    /// Fee-aware selection: after each added input the fee is recomputed
    /// with `fee_for_inputs(selected_count)` and the target grows by it.
    ///
    /// A randomized pass that runs out of candidates is retried
    /// largest-first, so shuffling never turns a fundable payment into
    /// `InsufficientFunds`.
    pub fn select_with_fee<F>(
        candidates: &[Utxo],
        target: u64,
        fee_for_inputs: F,
        policy: &SelectionPolicy,
    ) -> Result<CoinSelection, WalletError>
    where
        F: Fn(usize) -> u64,
    {
        if target == 0 {
            return Err(WalletError::InvalidAmount("target must be non-zero".into()));
        }

        let mut eligible: Vec<&Utxo> = candidates
            .iter()
            .filter(|u| policy.allow_zero_conf || u.is_confirmed())
            .collect();

        if policy.randomize {
            eligible.shuffle(&mut rand::thread_rng());
            if let Some(selection) = accumulate(&eligible, target, &fee_for_inputs) {
                return Ok(selection);
            }
            // Shuffled order can front-load inputs worth less than their fee.
        }
        // Stable: equal values keep their original order.
        eligible.sort_by(|a, b| b.value.cmp(&a.value));

        accumulate(&eligible, target, &fee_for_inputs).ok_or_else(|| WalletError::InsufficientFunds {
            have: eligible.iter().map(|u| u.value).fold(0u64, u64::saturating_add),
            need: target.saturating_add(fee_for_inputs(eligible.len().max(1))),
        })
    }
}

/// Add inputs in order until they cover `target` plus the fee for the
/// inputs taken so far.
fn accumulate<F>(ordered: &[&Utxo], target: u64, fee_for_inputs: &F) -> Option<CoinSelection>
where
    F: Fn(usize) -> u64,
{
    let mut selected = Vec::new();
    let mut total: u64 = 0;
    for utxo in ordered {
        selected.push((*utxo).clone());
        total = total.saturating_add(utxo.value);
        let fee = fee_for_inputs(selected.len());
        let needed = target.saturating_add(fee);
        if total >= needed {
            return Some(CoinSelection { selected, total, fee, change: total - needed });
        }
    }
    None
}

/// Drop inputs that are not needed to cover `required`.
///
/// Repeatedly removes the removable input of smallest value (earliest
/// position on ties) while the remaining sum stays `>= required`. The result
/// keeps the original order, is a subset of `utxos`, and no further input
/// can be removed. Returns the input unchanged if it does not cover
/// `required` to begin with.
pub fn minimize_inputs(utxos: &[Utxo], required: u64) -> Vec<Utxo> {
    let mut kept: Vec<Utxo> = utxos.to_vec();
    let mut sum: u64 = kept.iter().fold(0u64, |acc, u| acc.saturating_add(u.value));
    if sum < required {
        return kept;
    }

    loop {
        let removable = kept
            .iter()
            .enumerate()
            .filter(|(_, u)| sum - u.value >= required)
            .min_by(|(ia, a), (ib, b)| a.value.cmp(&b.value).then(ia.cmp(ib)))
            .map(|(i, _)| i);
        match removable {
            Some(index) => {
                sum -= kept.remove(index).value;
            }
            None => return kept,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utxo_store::tests::utxo;

    fn values(utxos: &[Utxo]) -> Vec<u64> {
        utxos.iter().map(|u| u.value).collect()
    }

    #[test]
    fn picks_largest_first() {
        let candidates = vec![utxo(1, 0, 1_000, 1), utxo(2, 0, 9_000, 1), utxo(3, 0, 4_000, 1)];
        let selection = CoinSelector::select(&candidates, 10_000, &SelectionPolicy::default()).unwrap();
        assert_eq!(values(&selection.selected), vec![9_000, 4_000]);
        assert_eq!(selection.total, 13_000);
        assert_eq!(selection.change, 3_000);
    }

    #[test]
    fn insufficient_funds_reports_spendable_total() {
        let candidates = vec![utxo(1, 0, 1_000, 1), utxo(2, 0, 2_000, 1)];
        let err = CoinSelector::select(&candidates, 5_000, &SelectionPolicy::default()).unwrap_err();
        assert_eq!(err, WalletError::InsufficientFunds { have: 3_000, need: 5_000 });
    }

    #[test]
    fn empty_candidates_are_insufficient() {
        let err = CoinSelector::select(&[], 1, &SelectionPolicy::default()).unwrap_err();
        assert_eq!(err, WalletError::InsufficientFunds { have: 0, need: 1 });
    }

    #[test]
    fn zero_target_rejected() {
        let err = CoinSelector::select(&[utxo(1, 0, 1, 1)], 0, &SelectionPolicy::default()).unwrap_err();
        assert!(matches!(err, WalletError::InvalidAmount(_)));
    }

    #[test]
    fn unconfirmed_excluded_unless_allowed() {
        let candidates = vec![utxo(1, 0, 5_000, 0), utxo(2, 0, 1_000, 2)];
        let strict = CoinSelector::select(&candidates, 3_000, &SelectionPolicy::default());
        assert!(matches!(strict, Err(WalletError::InsufficientFunds { have: 1_000, .. })));

        let policy = SelectionPolicy { allow_zero_conf: true, ..Default::default() };
        let relaxed = CoinSelector::select(&candidates, 3_000, &policy).unwrap();
        assert_eq!(values(&relaxed.selected), vec![5_000]);
    }

    #[test]
    fn locked_utxos_are_skipped_from_store() {
        let mut store = UtxoStore::new();
        let big = utxo(1, 0, 50_000, 1);
        let small = utxo(2, 0, 20_000, 1);
        store.replace([big.clone(), small.clone()]);
        store.lock_at(&big.outpoint(), 10, 0).unwrap();

        let selection = CoinSelector::select_from_store(&store, 10_000, &SelectionPolicy::default(), 5).unwrap();
        assert_eq!(selection.selected, vec![small]);

        let after_expiry = CoinSelector::select_from_store(&store, 10_000, &SelectionPolicy::default(), 10).unwrap();
        assert_eq!(after_expiry.selected, vec![big]);
    }

    #[test]
    fn fee_grows_with_inputs() {
        let candidates = vec![utxo(1, 0, 6_000, 1), utxo(2, 0, 3_000, 1)];
        // 6000 covers 5000 + 500 with one input; a 1500 per-input fee needs both.
        let cheap = CoinSelector::select_with_fee(&candidates, 5_000, |n| 500 * n as u64, &SelectionPolicy::default()).unwrap();
        assert_eq!(cheap.selected.len(), 1);
        let dear = CoinSelector::select_with_fee(&candidates, 5_000, |n| 1_500 * n as u64, &SelectionPolicy::default()).unwrap();
        assert_eq!(dear.selected.len(), 2);
        assert_eq!(dear.fee, 3_000);
        assert_eq!(dear.change, 1_000);
    }

    #[test]
    fn randomized_selection_still_covers_target() {
        let candidates: Vec<Utxo> = (1..=20).map(|i| utxo(i, 0, 1_000 * i as u64, 1)).collect();
        let policy = SelectionPolicy { randomize: true, ..Default::default() };
        for _ in 0..20 {
            let selection = CoinSelector::select(&candidates, 30_000, &policy).unwrap();
            assert!(selection.total >= 30_000);
        }
    }

    #[test]
    fn randomized_fee_aware_selection_falls_back_to_largest_first() {
        // Each 1_000 output is worth less than the 3_000 fee it adds.
        let mut candidates: Vec<Utxo> = (1..=40).map(|i| utxo(i, 0, 1_000, 1)).collect();
        candidates.push(utxo(41, 0, 100_000, 1));
        let policy = SelectionPolicy { randomize: true, ..Default::default() };
        for _ in 0..200 {
            let selection = CoinSelector::select_with_fee(&candidates, 50_000, |n| 3_000 * n as u64, &policy).unwrap();
            assert!(selection.total >= 50_000 + selection.fee);
            assert_eq!(selection.fee, 3_000 * selection.selected.len() as u64);
        }
    }

    #[test]
    fn minimize_drops_smallest_removable() {
        let inputs = vec![utxo(1, 0, 5_000, 1), utxo(2, 0, 3_000, 1), utxo(3, 0, 2_000, 1)];
        assert_eq!(values(&minimize_inputs(&inputs, 6_500)), vec![5_000, 3_000]);
    }

    #[test]
    fn minimize_keeps_order_and_handles_ties() {
        let inputs = vec![utxo(1, 0, 1_000, 1), utxo(2, 0, 4_000, 1), utxo(3, 0, 1_000, 1)];
        let kept = minimize_inputs(&inputs, 5_000);
        assert_eq!(values(&kept), vec![4_000, 1_000]);
        assert_eq!(kept[1].txid, inputs[2].txid);
    }

    #[test]
    fn minimize_leaves_short_set_alone() {
        let inputs = vec![utxo(1, 0, 1_000, 1)];
        assert_eq!(minimize_inputs(&inputs, 5_000), inputs);
    }
}
