//! Fee strategies, transaction size estimation and change computation.

use tracing::debug;

use keel_core::constants::{
    DUST_THRESHOLD, OUTPUT_FRAMING_SIZE, P2SH_MULTISIG_INPUT_SIZE, TX_OVERHEAD_SIZE,
};
use keel_core::traits::FeeOracle;
use keel_core::types::{FeeRates, FeeStrategy};

use crate::error::WalletError;

/// Fee and change of a transaction whose inputs are fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct FeeAndChange {
    pub fee: u64,
    /// Zero when the leftover was dust and went to the fee.
    pub change: u64,
}

/// Estimated serialized size of a transaction spending `input_count`
/// multisig inputs into outputs with the given scriptPubKey lengths.
pub fn estimate_size<I: IntoIterator<Item = usize>>(input_count: usize, output_script_lens: I) -> usize {
    let outputs: usize = output_script_lens.into_iter().map(|len| OUTPUT_FRAMING_SIZE + len).sum();
    TX_OVERHEAD_SIZE + input_count * P2SH_MULTISIG_INPUT_SIZE + outputs
}

/// `ceil(size_bytes * fee_per_kb / 1000)`.
pub fn fee_for_size(size_bytes: usize, fee_per_kb: u64) -> u64 {
    let product = size_bytes as u128 * fee_per_kb as u128;
    u64::try_from(product.div_ceil(1000)).unwrap_or(u64::MAX)
}

/// Split `input_sum - output_sum` into fee and change. Change below the
/// dust threshold is folded into the fee.
pub fn split_change(input_sum: u64, output_sum: u64, fee: u64) -> Result<FeeAndChange, WalletError> {
    let need = output_sum.saturating_add(fee);
    if input_sum < need {
        return Err(WalletError::InsufficientFunds { have: input_sum, need });
    }
    let change = input_sum - need;
    if change < DUST_THRESHOLD {
        Ok(FeeAndChange { fee: fee + change, change: 0 })
    } else {
        Ok(FeeAndChange { fee, change })
    }
}

/// Fee calculator for one call chain.
///
/// Rates are fetched from the oracle at most once per estimator and never
/// persisted beyond it.
pub struct FeeEstimator<'a> {
    oracle: Option<&'a dyn FeeOracle>,
    rates: Option<FeeRates>,
}

impl<'a> FeeEstimator<'a> {
    pub fn new(oracle: &'a dyn FeeOracle) -> Self {
        Self { oracle: Some(oracle), rates: None }
    }

    /// Estimator with fixed rates and no oracle.
    pub fn with_rates(rates: FeeRates) -> Self {
        Self { oracle: None, rates: Some(rates) }
    }

    /// Current `(optimal, low_priority)` rates in sat per 1000 bytes.
    pub fn fee_per_kb(&mut self) -> Result<FeeRates, WalletError> {
        if let Some(rates) = self.rates {
            return Ok(rates);
        }
        let rates = match self.oracle {
            Some(oracle) => oracle.fee_per_kb()?,
            None => FeeRates::default(),
        };
        debug!(optimal = rates.optimal, low_priority = rates.low_priority, "fee rates fetched");
        self.rates = Some(rates);
        Ok(rates)
    }

    /// Fee for a transaction of `size_bytes` under `strategy`.
    pub fn fee_for(&mut self, strategy: FeeStrategy, size_bytes: usize) -> Result<u64, WalletError> {
        let rate = match strategy {
            FeeStrategy::Fixed(fee) => return Ok(fee),
            FeeStrategy::Optimal => self.fee_per_kb()?.optimal,
            FeeStrategy::LowPriority => self.fee_per_kb()?.low_priority,
        };
        Ok(fee_for_size(size_bytes, rate))
    }

    pub fn determine_fee_and_change(
        &mut self,
        strategy: FeeStrategy,
        input_sum: u64,
        output_sum: u64,
        size_bytes: usize,
    ) -> Result<FeeAndChange, WalletError> {
        let fee = self.fee_for(strategy, size_bytes)?;
        split_change(input_sum, output_sum, fee)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::error::{RemoteServiceError, Service};
    use keel_core::traits::RemoteResult;

    mockall::mock! {
        pub Oracle {}
        impl FeeOracle for Oracle {
            fn fee_per_kb(&self) -> RemoteResult<FeeRates>;
        }
    }

    #[test]
    fn size_of_one_in_two_out() {
        // 10 + 297 + 2 * 34
        assert_eq!(estimate_size(1, [25, 25]), 375);
    }

    #[test]
    fn op_return_output_counts_script_len() {
        assert_eq!(estimate_size(0, [12]), 10 + 9 + 12);
    }

    #[test]
    fn fee_rounds_up() {
        assert_eq!(fee_for_size(375, 10_000), 3_750);
        assert_eq!(fee_for_size(1, 10_000), 10);
        assert_eq!(fee_for_size(1, 1), 1);
        assert_eq!(fee_for_size(0, 10_000), 0);
    }

    #[test]
    fn dust_change_folds_into_fee() {
        let split = split_change(10_000, 6_000, 2_000).unwrap();
        assert_eq!(split, FeeAndChange { fee: 4_000, change: 0 });
    }

    #[test]
    fn change_above_dust_is_kept() {
        let split = split_change(20_000, 6_000, 2_000).unwrap();
        assert_eq!(split, FeeAndChange { fee: 2_000, change: 12_000 });
    }

    #[test]
    fn change_split_rejects_shortfall() {
        assert_eq!(
            split_change(5_000, 6_000, 100),
            Err(WalletError::InsufficientFunds { have: 5_000, need: 6_100 })
        );
    }

    #[test]
    fn oracle_is_called_once_per_estimator() {
        let mut oracle = MockOracle::new();
        oracle
            .expect_fee_per_kb()
            .times(1)
            .returning(|| Ok(FeeRates { optimal: 20_000, low_priority: 8_000 }));
        let mut estimator = FeeEstimator::new(&oracle);
        assert_eq!(estimator.fee_for(FeeStrategy::Optimal, 1_000).unwrap(), 20_000);
        assert_eq!(estimator.fee_for(FeeStrategy::LowPriority, 1_000).unwrap(), 8_000);
    }

    #[test]
    fn fixed_fee_skips_oracle() {
        let mut oracle = MockOracle::new();
        oracle.expect_fee_per_kb().times(0);
        let mut estimator = FeeEstimator::new(&oracle);
        assert_eq!(estimator.fee_for(FeeStrategy::Fixed(1_234), 99_999).unwrap(), 1_234);
    }

    #[test]
    fn oracle_failure_surfaces_as_remote_error() {
        let mut oracle = MockOracle::new();
        oracle.expect_fee_per_kb().returning(|| {
            Err(RemoteServiceError::application(Service::FeeOracle, "fee_per_kb", 503, "unavailable"))
        });
        let err = FeeEstimator::new(&oracle).fee_per_kb().unwrap_err();
        assert!(matches!(err, WalletError::RemoteService(e) if e.service() == Service::FeeOracle));
    }

    #[test]
    fn preset_rates_are_used() {
        let mut estimator = FeeEstimator::with_rates(FeeRates { optimal: 10_000, low_priority: 5_000 });
        let split = estimator
            .determine_fee_and_change(FeeStrategy::LowPriority, 100_000, 50_000, 1_000)
            .unwrap();
        assert_eq!(split, FeeAndChange { fee: 5_000, change: 45_000 });
    }
}
