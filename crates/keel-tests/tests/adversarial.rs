//! Property-based suite for the money-handling invariants of keel.
//!
//! Each property runs 256 randomized cases; proptest shrinks failures to a
//! minimal example.
//!
//! Covered:
//! - Coin selection never under-funds a target and never invents inputs
//! - Insufficient funds report exactly what was eligible
//! - Shuffled fee-aware selection funds whatever largest-first funds
//! - Input minimization keeps a minimal, ordered subset
//! - Change splitting conserves value and never creates dust change
//! - Fee rounding is a ceiling and monotone in size
//! - UTXO locks expire exactly at their TTL
//! - Derivation paths survive Display/FromStr and reject hardened indices

use std::collections::HashSet;
use std::str::FromStr;

use bitcoin::OutPoint;
use proptest::prelude::*;

use keel_core::constants::DUST_THRESHOLD;
use keel_core::path::WalletPath;
use keel_core::types::Utxo;
use keel_tests::helpers::utxo;
use keel_wallet::coin_selection::minimize_inputs;
use keel_wallet::fee::{estimate_size, fee_for_size, split_change};
use keel_wallet::{CoinSelector, SelectionPolicy, UtxoStore, WalletError};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn candidates(values: &[u64], confirmations: &[u32]) -> Vec<Utxo> {
    values
        .iter()
        .zip(confirmations.iter().cycle())
        .enumerate()
        .map(|(i, (&value, &conf))| utxo(i as u32, value, conf))
        .collect()
}

fn sum(utxos: &[Utxo]) -> u64 {
    utxos.iter().map(|u| u.value).sum()
}

fn arb_values() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(1u64..10_000_000, 1..24)
}

// ---------------------------------------------------------------------------
// Coin selection
//
// A selection that succeeds must cover the target with inputs drawn from the
// candidates, never picking an unconfirmed one unless zero-conf is allowed.
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn selection_covers_target_from_candidates(
        values in arb_values(),
        confirmations in prop::collection::vec(0u32..3, 1..4),
        target in 1u64..50_000_000,
        allow_zero_conf in any::<bool>(),
        randomize in any::<bool>(),
    ) {
        let utxos = candidates(&values, &confirmations);
        let policy = SelectionPolicy { allow_zero_conf, randomize };
        let eligible: u64 = utxos
            .iter()
            .filter(|u| allow_zero_conf || u.is_confirmed())
            .map(|u| u.value)
            .sum();

        match CoinSelector::select(&utxos, target, &policy) {
            Ok(selection) => {
                prop_assert!(selection.total >= target);
                prop_assert_eq!(selection.total, sum(&selection.selected));
                prop_assert_eq!(selection.change, selection.total - target);

                let known: HashSet<OutPoint> = utxos.iter().map(Utxo::outpoint).collect();
                let mut seen = HashSet::new();
                for input in &selection.selected {
                    prop_assert!(known.contains(&input.outpoint()), "selected unknown input");
                    prop_assert!(seen.insert(input.outpoint()), "input selected twice");
                    prop_assert!(allow_zero_conf || input.is_confirmed());
                }
            }
            Err(WalletError::InsufficientFunds { have, need }) => {
                prop_assert_eq!(have, eligible);
                prop_assert!(have < need);
                prop_assert!(eligible < target);
            }
            Err(other) => prop_assert!(false, "unexpected error {other:?}"),
        }
    }

    #[test]
    fn largest_first_stops_at_first_sufficient_prefix(
        values in arb_values(),
        target in 1u64..20_000_000,
    ) {
        let utxos = candidates(&values, &[6]);
        let policy = SelectionPolicy::default();
        if let Ok(selection) = CoinSelector::select(&utxos, target, &policy) {
            let chosen: Vec<u64> = selection.selected.iter().map(|u| u.value).collect();
            prop_assert!(chosen.windows(2).all(|w| w[0] >= w[1]), "not largest-first: {chosen:?}");
            // Dropping the last input must leave the target uncovered.
            let without_last: u64 = chosen[..chosen.len() - 1].iter().sum();
            prop_assert!(without_last < target);
        }
    }

    #[test]
    fn fee_aware_selection_covers_target_and_fee(
        values in arb_values(),
        target in 1u64..20_000_000,
        fee_per_kb in 1_000u64..100_000,
    ) {
        let utxos = candidates(&values, &[6]);
        let fee_for = |inputs: usize| fee_for_size(estimate_size(inputs, [25usize, 23]), fee_per_kb);
        let result = CoinSelector::select_with_fee(&utxos, target, fee_for, &SelectionPolicy::default());
        if let Ok(selection) = result {
            prop_assert_eq!(selection.fee, fee_for(selection.selected.len()));
            prop_assert_eq!(selection.total, target + selection.fee + selection.change);
        }
    }

    #[test]
    fn randomized_fee_aware_selection_funds_whatever_largest_first_funds(
        small in prop::collection::vec(1u64..5_000, 0..40),
        large in prop::collection::vec(5_000u64..200_000, 1..4),
        target in 1u64..300_000,
        per_input_fee in 0u64..6_000,
    ) {
        let values: Vec<u64> = small.iter().chain(large.iter()).copied().collect();
        let utxos = candidates(&values, &[6]);
        let fee_for = |inputs: usize| per_input_fee * inputs as u64;
        let ordered = CoinSelector::select_with_fee(&utxos, target, fee_for, &SelectionPolicy::default());
        let shuffled = CoinSelector::select_with_fee(
            &utxos,
            target,
            fee_for,
            &SelectionPolicy { randomize: true, ..Default::default() },
        );

        prop_assert_eq!(ordered.is_ok(), shuffled.is_ok());
        if let Ok(selection) = shuffled {
            prop_assert_eq!(selection.fee, fee_for(selection.selected.len()));
            prop_assert_eq!(selection.total, sum(&selection.selected));
            prop_assert_eq!(selection.total, target + selection.fee + selection.change);
        }
    }
}

// ---------------------------------------------------------------------------
// Input minimization
//
// The minimized set keeps the original order, still covers the requirement,
// and no single remaining input can be dropped.
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn minimized_inputs_are_minimal_ordered_subset(
        values in arb_values(),
        required_fraction in 0.0f64..1.0,
    ) {
        let utxos = candidates(&values, &[6]);
        let total = sum(&utxos);
        let required = (total as f64 * required_fraction) as u64;

        let kept = minimize_inputs(&utxos, required);
        let kept_sum = sum(&kept);
        prop_assert!(kept_sum >= required);

        // Subsequence of the original, in order.
        let mut cursor = utxos.iter();
        for input in &kept {
            prop_assert!(cursor.any(|u| u.outpoint() == input.outpoint()), "order broken");
        }

        for input in &kept {
            prop_assert!(kept_sum - input.value < required, "input {} is removable", input.value);
        }
    }

    #[test]
    fn minimize_leaves_underfunded_sets_alone(values in arb_values(), extra in 1u64..1_000) {
        let utxos = candidates(&values, &[6]);
        let required = sum(&utxos) + extra;
        prop_assert_eq!(minimize_inputs(&utxos, required), utxos);
    }
}

// ---------------------------------------------------------------------------
// Fees and change
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn split_change_conserves_value(
        input_sum in 0u64..100_000_000,
        output_sum in 0u64..100_000_000,
        fee in 0u64..1_000_000,
    ) {
        match split_change(input_sum, output_sum, fee) {
            Ok(split) => {
                prop_assert_eq!(split.fee + split.change + output_sum, input_sum);
                prop_assert!(split.change == 0 || split.change >= DUST_THRESHOLD);
                prop_assert!(split.fee >= fee);
                prop_assert!(split.fee - fee < DUST_THRESHOLD);
            }
            Err(WalletError::InsufficientFunds { have, need }) => {
                prop_assert_eq!(have, input_sum);
                prop_assert_eq!(need, output_sum + fee);
                prop_assert!(have < need);
            }
            Err(other) => prop_assert!(false, "unexpected error {other:?}"),
        }
    }

    #[test]
    fn fee_for_size_is_ceiling(size in 0usize..1_000_000, fee_per_kb in 0u64..1_000_000) {
        let fee = fee_for_size(size, fee_per_kb);
        let exact = size as u128 * fee_per_kb as u128;
        prop_assert!(fee as u128 * 1000 >= exact);
        prop_assert!((fee as u128 * 1000) < exact + 1000);
    }

    #[test]
    fn fee_grows_with_size(size in 0usize..100_000, grow in 0usize..10_000, fee_per_kb in 0u64..1_000_000) {
        prop_assert!(fee_for_size(size + grow, fee_per_kb) >= fee_for_size(size, fee_per_kb));
    }

    #[test]
    fn every_input_adds_the_multisig_input_size(inputs in 0usize..200, outputs in prop::collection::vec(0usize..80, 0..8)) {
        let base = estimate_size(inputs, outputs.iter().copied());
        let plus_one = estimate_size(inputs + 1, outputs.iter().copied());
        prop_assert_eq!(plus_one - base, 297);
    }
}

// ---------------------------------------------------------------------------
// UTXO locks
//
// A lock blocks re-locking and selection until `now + ttl`, and not a second
// longer.
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn lock_expires_exactly_at_ttl(now in 0i64..2_000_000_000, ttl in 1u64..3_600, elapsed in 0u64..7_200) {
        let mut store = UtxoStore::new();
        let coin = utxo(1, 50_000, 6);
        let outpoint = coin.outpoint();
        store.insert(coin);

        let expires_at = store.lock_at(&outpoint, ttl, now).unwrap();
        prop_assert_eq!(expires_at, now + ttl as i64);

        let at = now + elapsed as i64;
        let held = at < expires_at;
        prop_assert_eq!(store.is_locked_at(&outpoint, at), held);
        prop_assert_eq!(store.spendable_at(false, at).is_empty(), held);
        let relock = store.lock_at(&outpoint, ttl, at);
        prop_assert_eq!(relock.is_err(), held);
        if held {
            let is_contention = matches!(relock, Err(WalletError::LockContention { .. }));
            prop_assert!(is_contention);
        }
    }
}

// ---------------------------------------------------------------------------
// Derivation paths
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn wallet_path_text_form_is_stable(key_index in 0u32..(1 << 31), chain in 0u32..2, index in 0u32..(1 << 31)) {
        let path = WalletPath::new(key_index, chain, index).unwrap();
        let text = path.to_string();
        prop_assert_eq!(&text, &format!("m/{key_index}'/{chain}/{index}"));
        prop_assert_eq!(WalletPath::from_str(&text).unwrap(), path);
    }

    #[test]
    fn hardened_components_are_rejected(value in (1u32 << 31)..=u32::MAX, slot in 0usize..3) {
        let mut parts = [0u32; 3];
        parts[slot] = value;
        prop_assert!(WalletPath::new(parts[0], parts[1], parts[2]).is_err());
    }

    #[test]
    fn accepted_paths_reparse_identically(text in "[mM]/[0-9]{1,3}['h]?/[0-9]{1,3}/[0-9]{1,4}") {
        match WalletPath::from_str(&text) {
            Ok(path) => prop_assert_eq!(WalletPath::from_str(&path.to_string()).unwrap(), path),
            Err(_) => prop_assert!(!text.contains('\'') && !text.contains('h'), "rejected {text}"),
        }
    }
}
