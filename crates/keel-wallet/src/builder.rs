//! Staged transaction builder.
//!
//! A builder moves through the stages
//! `Empty → RecipientsAdded → UtxosSelected → FeeDetermined → Signed → Sent`:
//! 1. Add recipients and OP_RETURN outputs
//! 2. Select UTXOs (or set them explicitly)
//! 3. Determine fee and change
//! 4. Build the unsigned transaction, sign, send
//!
//! Changing outputs after selection drops the builder back to
//! `RecipientsAdded`. Builder state serializes with serde so a half-built
//! payment can be stored and resumed.

use bitcoin::absolute::LockTime;
use bitcoin::transaction::Version;
use bitcoin::{Amount, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use rand::Rng;
use serde::{Deserialize, Serialize};

use keel_core::constants::{DUST_THRESHOLD, P2SH_SCRIPT_PUBKEY_LEN};
use keel_core::script::{op_return_script, parse_address};
use keel_core::types::{FeeStrategy, Utxo};

use crate::coin_selection::{minimize_inputs, CoinSelection, CoinSelector, SelectionPolicy};
use crate::error::WalletError;
use crate::fee::{estimate_size, fee_for_size, split_change, FeeAndChange, FeeEstimator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStage {
    Empty,
    RecipientsAdded,
    UtxosSelected,
    FeeDetermined,
    Signed,
    Sent,
}

/// A transaction output: a recipient or an OP_RETURN data carrier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub script_pubkey: ScriptBuf,
    pub value: u64,
    /// Destination address; `None` for OP_RETURN.
    pub address: Option<String>,
}

impl Output {
    pub fn is_op_return(&self) -> bool {
        self.script_pubkey.is_op_return()
    }
}

/// What the signer needs to know about each input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputMeta {
    pub outpoint: OutPoint,
    pub path: String,
    pub redeem_script: ScriptBuf,
    pub value: u64,
}

/// A transaction with empty script_sigs plus its signing metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedTransaction {
    pub tx: Transaction,
    /// One entry per `tx.input`, same order.
    pub inputs: Vec<InputMeta>,
    pub fee: u64,
    pub change: u64,
    /// Position of the change output, if any.
    pub change_index: Option<usize>,
}

impl UnsignedTransaction {
    pub fn paths(&self) -> Vec<String> {
        self.inputs.iter().map(|i| i.path.clone()).collect()
    }
}

/// Builder for wallet transactions.
///
/// # Example
/// ```ignore
/// let mut builder = TransactionBuilder::new(Network::Testnet);
/// builder.add_recipient("2N...", 50_000)?.set_fee_strategy(FeeStrategy::LowPriority)?;
/// builder.select_utxos(&candidates, &mut estimator, &SelectionPolicy::default())?;
/// builder.determine_fee_and_change(&mut estimator)?;
/// let unsigned = builder.build_unsigned(Some(&change_address))?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionBuilder {
    network: Network,
    outputs: Vec<Output>,
    utxos: Vec<Utxo>,
    /// Explicit fee; overrides the strategy.
    fee: Option<u64>,
    fee_strategy: FeeStrategy,
    change_address: Option<String>,
    randomize_change: bool,
    stage: BuildStage,
    determined: Option<FeeAndChange>,
}

impl TransactionBuilder {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            outputs: Vec::new(),
            utxos: Vec::new(),
            fee: None,
            fee_strategy: FeeStrategy::default(),
            change_address: None,
            randomize_change: true,
            stage: BuildStage::Empty,
            determined: None,
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn stage(&self) -> BuildStage {
        self.stage
    }

    pub fn outputs(&self) -> &[Output] {
        &self.outputs
    }

    pub fn utxos(&self) -> &[Utxo] {
        &self.utxos
    }

    pub fn output_total(&self) -> u64 {
        self.outputs.iter().fold(0u64, |acc, o| acc.saturating_add(o.value))
    }

    pub fn input_total(&self) -> u64 {
        self.utxos.iter().fold(0u64, |acc, u| acc.saturating_add(u.value))
    }

    /// Fee and change from the last [`determine_fee_and_change`](Self::determine_fee_and_change).
    pub fn fee_and_change(&self) -> Option<FeeAndChange> {
        self.determined
    }

    fn ensure_mutable(&self) -> Result<(), WalletError> {
        if self.stage >= BuildStage::Signed {
            return Err(WalletError::InvalidStage(format!("{:?} transaction cannot be modified", self.stage)));
        }
        Ok(())
    }

    /// Outputs changed: any selection and fee determination is stale.
    fn outputs_changed(&mut self) {
        if self.stage >= BuildStage::UtxosSelected {
            self.utxos.clear();
        }
        self.determined = None;
        self.stage = BuildStage::RecipientsAdded;
    }

    /// Fee inputs changed: selection stands, fee must be redetermined.
    fn fee_changed(&mut self) {
        self.determined = None;
        if self.stage == BuildStage::FeeDetermined {
            self.stage = BuildStage::UtxosSelected;
        }
    }

    // -----------------------------------------------------------------------
    // Outputs
    // -----------------------------------------------------------------------

    /// Pay `value` satoshi to `address`.
    pub fn add_recipient(&mut self, address: &str, value: u64) -> Result<&mut Self, WalletError> {
        self.ensure_mutable()?;
        let parsed = parse_address(address, self.network)?;
        check_recipient_value(value)?;
        self.outputs.push(Output {
            script_pubkey: parsed.script_pubkey(),
            value,
            address: Some(parsed.to_string()),
        });
        self.outputs_changed();
        Ok(self)
    }

    /// Add a zero-value OP_RETURN output carrying `data`.
    pub fn add_op_return(&mut self, data: &[u8], allow_non_standard: bool) -> Result<&mut Self, WalletError> {
        self.ensure_mutable()?;
        let script_pubkey = op_return_script(data, allow_non_standard)?;
        self.outputs.push(Output { script_pubkey, value: 0, address: None });
        self.outputs_changed();
        Ok(self)
    }

    /// Change the value of output `index`.
    pub fn update_output_value(&mut self, index: usize, value: u64) -> Result<&mut Self, WalletError> {
        self.ensure_mutable()?;
        let output = self
            .outputs
            .get_mut(index)
            .ok_or_else(|| WalletError::BuildError(format!("no output at index {index}")))?;
        if !output.is_op_return() {
            check_recipient_value(value)?;
        }
        output.value = value;
        self.fee_changed();
        Ok(self)
    }

    // -----------------------------------------------------------------------
    // Fee and change settings
    // -----------------------------------------------------------------------

    /// Use an explicit fee instead of the strategy.
    pub fn set_fee(&mut self, fee: u64) -> Result<&mut Self, WalletError> {
        self.ensure_mutable()?;
        self.fee = Some(fee);
        self.fee_changed();
        Ok(self)
    }

    /// The explicit fee, or the determined one.
    pub fn fee(&self) -> Option<u64> {
        self.fee.or(self.determined.map(|d| d.fee))
    }

    pub fn set_fee_strategy(&mut self, strategy: FeeStrategy) -> Result<&mut Self, WalletError> {
        self.ensure_mutable()?;
        self.fee_strategy = strategy;
        self.fee_changed();
        Ok(self)
    }

    pub fn fee_strategy(&self) -> FeeStrategy {
        self.fee_strategy
    }

    pub fn set_change_address(&mut self, address: &str) -> Result<&mut Self, WalletError> {
        self.ensure_mutable()?;
        let parsed = parse_address(address, self.network)?;
        self.change_address = Some(parsed.to_string());
        Ok(self)
    }

    pub fn change_address(&self) -> Option<&str> {
        self.change_address.as_deref()
    }

    /// Place the change output at a random position (default) or last.
    pub fn randomize_change_output(&mut self, randomize: bool) -> &mut Self {
        self.randomize_change = randomize;
        self
    }

    // -----------------------------------------------------------------------
    // Inputs
    // -----------------------------------------------------------------------

    /// Replace the working set of inputs.
    pub fn set_utxos(&mut self, utxos: Vec<Utxo>) -> Result<&mut Self, WalletError> {
        self.ensure_mutable()?;
        if self.stage == BuildStage::Empty {
            return Err(WalletError::InvalidStage("add recipients before inputs".into()));
        }
        self.utxos = utxos;
        self.determined = None;
        self.stage = BuildStage::UtxosSelected;
        Ok(self)
    }

    /// Select inputs from `candidates` to cover the outputs and the fee.
    pub fn select_utxos(
        &mut self,
        candidates: &[Utxo],
        estimator: &mut FeeEstimator<'_>,
        policy: &SelectionPolicy,
    ) -> Result<CoinSelection, WalletError> {
        self.ensure_mutable()?;
        if self.stage == BuildStage::Empty {
            return Err(WalletError::InvalidStage("no outputs to fund".into()));
        }

        let script_lens = self.script_lens_with_change();
        let selection = match (self.fee, self.fee_strategy) {
            (Some(fee), _) | (None, FeeStrategy::Fixed(fee)) => {
                CoinSelector::select_with_fee(candidates, self.output_total(), |_| fee, policy)?
            }
            (None, strategy) => {
                let rates = estimator.fee_per_kb()?;
                let rate = if strategy == FeeStrategy::LowPriority { rates.low_priority } else { rates.optimal };
                CoinSelector::select_with_fee(
                    candidates,
                    self.output_total(),
                    |inputs| fee_for_size(estimate_size(inputs, script_lens.iter().copied()), rate),
                    policy,
                )?
            }
        };

        self.utxos = selection.selected.clone();
        self.determined = None;
        self.stage = BuildStage::UtxosSelected;
        Ok(selection)
    }

    /// Drop inputs not needed to cover outputs plus `fee`.
    pub fn minimize_tx_fee(&mut self, fee: u64) -> Result<&mut Self, WalletError> {
        self.ensure_mutable()?;
        let required = self.output_total().saturating_add(fee);
        self.utxos = minimize_inputs(&self.utxos, required);
        self.fee_changed();
        Ok(self)
    }

    fn script_lens_with_change(&self) -> Vec<usize> {
        self.outputs
            .iter()
            .map(|o| o.script_pubkey.len())
            .chain(std::iter::once(P2SH_SCRIPT_PUBKEY_LEN))
            .collect()
    }

    /// Estimated size including a change output.
    pub fn estimated_size(&self) -> usize {
        estimate_size(self.utxos.len(), self.script_lens_with_change())
    }

    /// Compute fee and change for the selected inputs.
    pub fn determine_fee_and_change(&mut self, estimator: &mut FeeEstimator<'_>) -> Result<FeeAndChange, WalletError> {
        self.ensure_mutable()?;
        if self.stage < BuildStage::UtxosSelected {
            return Err(WalletError::InvalidStage(format!("{:?}: select inputs first", self.stage)));
        }
        if self.utxos.is_empty() {
            return Err(WalletError::NoUtxos);
        }
        let fee = match self.fee {
            Some(fee) => fee,
            None => estimator.fee_for(self.fee_strategy, self.estimated_size())?,
        };
        let split = split_change(self.input_total(), self.output_total(), fee)?;
        self.determined = Some(split);
        self.stage = BuildStage::FeeDetermined;
        Ok(split)
    }

    // -----------------------------------------------------------------------
    // Assembly
    // -----------------------------------------------------------------------

    /// Assemble the unsigned transaction. `fallback_change_address` is used
    /// when no change address was set and there is change to return.
    pub fn build_unsigned(&self, fallback_change_address: Option<&str>) -> Result<UnsignedTransaction, WalletError> {
        if self.stage != BuildStage::FeeDetermined {
            return Err(WalletError::InvalidStage(format!("{:?}: determine the fee first", self.stage)));
        }
        let split = self
            .determined
            .ok_or_else(|| WalletError::InvalidStage("fee not determined".into()))?;
        if self.outputs.is_empty() {
            return Err(WalletError::BuildError("no outputs".into()));
        }

        let mut outputs: Vec<TxOut> = self
            .outputs
            .iter()
            .map(|o| TxOut { value: Amount::from_sat(o.value), script_pubkey: o.script_pubkey.clone() })
            .collect();

        let mut change_index = None;
        if split.change > 0 {
            let address = self
                .change_address
                .as_deref()
                .or(fallback_change_address)
                .ok_or_else(|| WalletError::BuildError("change address required".into()))?;
            let change = TxOut {
                value: Amount::from_sat(split.change),
                script_pubkey: parse_address(address, self.network)?.script_pubkey(),
            };
            let index = if self.randomize_change {
                rand::thread_rng().gen_range(0..=outputs.len())
            } else {
                outputs.len()
            };
            outputs.insert(index, change);
            change_index = Some(index);
        }

        let input = self
            .utxos
            .iter()
            .map(|u| TxIn {
                previous_output: u.outpoint(),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect();
        let inputs = self
            .utxos
            .iter()
            .map(|u| InputMeta {
                outpoint: u.outpoint(),
                path: u.path.clone(),
                redeem_script: u.redeem_script.clone(),
                value: u.value,
            })
            .collect();

        Ok(UnsignedTransaction {
            tx: Transaction { version: Version::ONE, lock_time: LockTime::ZERO, input, output: outputs },
            inputs,
            fee: split.fee,
            change: split.change,
            change_index,
        })
    }

    pub(crate) fn mark_signed(&mut self) {
        self.stage = BuildStage::Signed;
    }

    pub(crate) fn mark_sent(&mut self) {
        self.stage = BuildStage::Sent;
    }
}

fn check_recipient_value(value: u64) -> Result<(), WalletError> {
    if value < DUST_THRESHOLD {
        return Err(WalletError::InvalidAmount(format!(
            "{value} is below the dust threshold of {DUST_THRESHOLD}"
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::keys::tests::test_keys;
    use bitcoin::hashes::Hash;
    use bitcoin::Txid;
    use keel_core::path::WalletPath;
    use keel_core::types::FeeRates;

    /// A testnet P2SH wallet address.
    pub(crate) fn address(index: u32) -> String {
        test_keys().derive_address(&WalletPath::new(0, 0, index).unwrap()).unwrap().to_string()
    }

    pub(crate) fn wallet_utxo(seed: u8, value: u64) -> Utxo {
        let mut keys = test_keys();
        let path = WalletPath::new(0, 0, seed as u32).unwrap();
        Utxo {
            txid: Txid::from_byte_array([seed; 32]),
            vout: 0,
            value,
            address: keys.derive_address(&path).unwrap().to_string(),
            path: path.to_string(),
            redeem_script: keys.redeem_script(&path).unwrap(),
            confirmations: 3,
            locked: false,
        }
    }

    fn rates() -> FeeEstimator<'static> {
        FeeEstimator::with_rates(FeeRates { optimal: 10_000, low_priority: 5_000 })
    }

    #[test]
    fn new_builder_is_empty() {
        let builder = TransactionBuilder::new(Network::Testnet);
        assert_eq!(builder.stage(), BuildStage::Empty);
        assert!(builder.outputs().is_empty());
        assert_eq!(builder.fee(), None);
        assert_eq!(builder.fee_strategy(), FeeStrategy::Optimal);
    }

    #[test]
    fn recipient_validation() {
        let mut builder = TransactionBuilder::new(Network::Testnet);
        assert!(matches!(builder.add_recipient("nonsense", 10_000), Err(WalletError::InvalidAddress(_))));
        assert!(matches!(builder.add_recipient(&address(0), 100), Err(WalletError::InvalidAmount(_))));
        builder.add_recipient(&address(0), 10_000).unwrap();
        assert_eq!(builder.stage(), BuildStage::RecipientsAdded);
        assert_eq!(builder.output_total(), 10_000);
    }

    #[test]
    fn mainnet_address_rejected_on_testnet() {
        let mut builder = TransactionBuilder::new(Network::Testnet);
        let err = builder.add_recipient("3J98t1WpEZ73CNmQviecrnyiWrnqRhWNLy", 10_000).unwrap_err();
        assert!(matches!(err, WalletError::InvalidAddress(_)));
    }

    #[test]
    fn adding_recipient_after_selection_invalidates_it() {
        let mut builder = TransactionBuilder::new(Network::Testnet);
        builder.add_recipient(&address(0), 10_000).unwrap();
        builder
            .select_utxos(&[wallet_utxo(1, 50_000)], &mut rates(), &SelectionPolicy::default())
            .unwrap();
        assert_eq!(builder.stage(), BuildStage::UtxosSelected);

        builder.add_recipient(&address(1), 10_000).unwrap();
        assert_eq!(builder.stage(), BuildStage::RecipientsAdded);
        assert!(builder.utxos().is_empty());
    }

    #[test]
    fn fee_determination_requires_selection() {
        let mut builder = TransactionBuilder::new(Network::Testnet);
        builder.add_recipient(&address(0), 10_000).unwrap();
        let err = builder.determine_fee_and_change(&mut rates()).unwrap_err();
        assert!(matches!(err, WalletError::InvalidStage(_)));
    }

    #[test]
    fn set_utxos_requires_recipients() {
        let mut builder = TransactionBuilder::new(Network::Testnet);
        assert!(matches!(builder.set_utxos(vec![wallet_utxo(1, 5_000)]), Err(WalletError::InvalidStage(_))));
    }

    #[test]
    fn op_return_size_limit() {
        let mut builder = TransactionBuilder::new(Network::Testnet);
        builder.add_op_return(b"short memo", false).unwrap();
        let err = builder.add_op_return(&[0u8; 60], false).unwrap_err();
        assert!(matches!(err, WalletError::NonStandardScript { .. }));
        builder.add_op_return(&[0u8; 60], true).unwrap();
        assert_eq!(builder.outputs().len(), 2);
        assert!(builder.outputs().iter().all(|o| o.is_op_return() && o.value == 0));
    }

    #[test]
    fn full_flow_produces_change() {
        let mut builder = TransactionBuilder::new(Network::Testnet);
        builder.add_recipient(&address(0), 20_000).unwrap();
        builder.randomize_change_output(false);
        let mut estimator = rates();
        builder
            .select_utxos(&[wallet_utxo(1, 100_000), wallet_utxo(2, 5_000)], &mut estimator, &SelectionPolicy::default())
            .unwrap();
        let split = builder.determine_fee_and_change(&mut estimator).unwrap();

        // One input, recipient + change: 10 + 297 + 32 + 32 = 371 bytes at 10 sat/byte.
        assert_eq!(split.fee, 3_710);
        assert_eq!(split.change, 100_000 - 20_000 - 3_710);

        let unsigned = builder.build_unsigned(Some(&address(9))).unwrap();
        assert_eq!(unsigned.tx.input.len(), 1);
        assert_eq!(unsigned.tx.output.len(), 2);
        assert_eq!(unsigned.change_index, Some(1));
        assert_eq!(unsigned.tx.output[1].value.to_sat(), split.change);
        assert_eq!(unsigned.inputs[0].path, "m/0'/0/1");
    }

    #[test]
    fn dust_change_goes_to_fee() {
        let mut builder = TransactionBuilder::new(Network::Testnet);
        builder.add_recipient(&address(0), 20_000).unwrap();
        builder.set_fee(1_000).unwrap();
        builder.set_utxos(vec![wallet_utxo(1, 22_000)]).unwrap();
        let split = builder.determine_fee_and_change(&mut rates()).unwrap();
        assert_eq!(split, FeeAndChange { fee: 2_000, change: 0 });

        let unsigned = builder.build_unsigned(None).unwrap();
        assert_eq!(unsigned.tx.output.len(), 1);
        assert_eq!(unsigned.change_index, None);
    }

    #[test]
    fn change_without_address_fails() {
        let mut builder = TransactionBuilder::new(Network::Testnet);
        builder.add_recipient(&address(0), 20_000).unwrap();
        builder.set_fee(1_000).unwrap();
        builder.set_utxos(vec![wallet_utxo(1, 50_000)]).unwrap();
        builder.determine_fee_and_change(&mut rates()).unwrap();
        assert!(matches!(builder.build_unsigned(None), Err(WalletError::BuildError(_))));
        builder.set_change_address(&address(5)).unwrap();
        let unsigned = builder.build_unsigned(None).unwrap();
        assert_eq!(unsigned.tx.output.len(), 2);
    }

    #[test]
    fn explicit_fee_overrides_strategy() {
        let mut builder = TransactionBuilder::new(Network::Testnet);
        builder.add_recipient(&address(0), 20_000).unwrap();
        builder.set_fee_strategy(FeeStrategy::LowPriority).unwrap();
        builder.set_fee(4_321).unwrap();
        builder.set_utxos(vec![wallet_utxo(1, 50_000)]).unwrap();
        let split = builder.determine_fee_and_change(&mut rates()).unwrap();
        assert_eq!(split.fee, 4_321);
        assert_eq!(builder.fee(), Some(4_321));
    }

    #[test]
    fn minimize_scenario() {
        let mut builder = TransactionBuilder::new(Network::Testnet);
        builder.add_recipient(&address(0), 6_000).unwrap();
        builder
            .set_utxos(vec![wallet_utxo(1, 5_000), wallet_utxo(2, 3_000), wallet_utxo(3, 2_000)])
            .unwrap();
        builder.minimize_tx_fee(500).unwrap();
        let kept: Vec<u64> = builder.utxos().iter().map(|u| u.value).collect();
        assert_eq!(kept, vec![5_000, 3_000]);
    }

    #[test]
    fn update_output_value_resets_fee() {
        let mut builder = TransactionBuilder::new(Network::Testnet);
        builder.add_recipient(&address(0), 20_000).unwrap();
        builder.set_utxos(vec![wallet_utxo(1, 50_000)]).unwrap();
        builder.determine_fee_and_change(&mut rates()).unwrap();
        builder.update_output_value(0, 30_000).unwrap();
        assert_eq!(builder.stage(), BuildStage::UtxosSelected);
        assert_eq!(builder.output_total(), 30_000);
        assert!(builder.update_output_value(3, 30_000).is_err());
    }

    #[test]
    fn signed_builder_is_frozen() {
        let mut builder = TransactionBuilder::new(Network::Testnet);
        builder.add_recipient(&address(0), 20_000).unwrap();
        builder.mark_signed();
        assert!(matches!(builder.add_recipient(&address(1), 20_000), Err(WalletError::InvalidStage(_))));
        assert!(matches!(builder.set_fee(1), Err(WalletError::InvalidStage(_))));
    }

    #[test]
    fn serde_round_trip_preserves_state() {
        let mut builder = TransactionBuilder::new(Network::Testnet);
        builder.add_recipient(&address(0), 20_000).unwrap();
        builder.add_op_return(b"memo", false).unwrap();
        builder.set_fee(2_500).unwrap();
        builder.set_change_address(&address(4)).unwrap();
        builder.set_utxos(vec![wallet_utxo(1, 50_000)]).unwrap();

        let json = serde_json::to_string(&builder).unwrap();
        let restored: TransactionBuilder = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, builder);
        assert_eq!(restored.fee(), Some(2_500));
        assert_eq!(restored.stage(), BuildStage::UtxosSelected);
    }
}
