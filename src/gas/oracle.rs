//! Suggested-fee computation for legacy and EIP-1559 networks

use crate::chain::RpcTransport;
use crate::config::{Config, NetworkConfig, EXPERIMENT_FEE_EQUALIZER};
use crate::error::{PilotError, PilotResult};
use crate::gas::congestion::{classify_congestion, network_congestion_metric, CongestionClass};
use crate::gas::history::fee_history_stats;
use crate::gas::{adjustment_factor, apply_buffer, buffer_percent, f64_to_u256, u256_to_f64, HeaderCache};

use ethers::types::U256;
use std::sync::Arc;
use tracing::{debug, warn};

/// Base fee and tip are considered pathologically far apart when they
/// differ by at least this factor; the fee equalizer lifts the lower one.
const EQUALIZER_MAGNITUDE: u64 = 1_000;

/// Adaptive fee oracle: node hints + fee history + congestion metric
pub struct GasOracle {
    transport: Arc<RpcTransport>,
    cache: Arc<HeaderCache>,
    network: NetworkConfig,
    fee_equalizer_enabled: bool,
}

impl GasOracle {
    pub fn new(transport: Arc<RpcTransport>, cache: Arc<HeaderCache>, cfg: &Config) -> Self {
        Self {
            transport,
            cache,
            network: cfg.network.clone(),
            fee_equalizer_enabled: cfg.is_experiment_enabled(EXPERIMENT_FEE_EQUALIZER),
        }
    }

    /// Congestion metric for the configured window; a data shortfall
    /// degrades to zero, other failures propagate.
    async fn congestion_metric(&self) -> PilotResult<f64> {
        match network_congestion_metric(
            &self.transport,
            &self.cache,
            self.network.gas_price_estimation_blocks,
            self.network.gas_price_estimation_congestion_strategy,
        )
        .await
        {
            Ok(metric) => Ok(metric),
            Err(e @ PilotError::CongestionDataInsufficient { .. }) => {
                warn!(error = %e, "Proceeding without a congestion metric");
                Ok(0.0)
            }
            Err(e) => Err(e),
        }
    }

    /// Congestion-adjusted legacy gas price
    pub async fn suggested_legacy_fees(&self) -> PilotResult<U256> {
        let suggested = self.transport.suggested_gas_price().await?;
        let metric = self.congestion_metric().await?;
        let class = classify_congestion(metric);
        let factor = adjustment_factor(self.network.gas_price_estimation_tx_priority);

        let adjusted = legacy_price(
            suggested,
            metric,
            factor,
            class,
            self.network.gas_limit,
            self.network.gas_estimation_max_tx_cost_wei,
        );
        debug!(
            metric,
            class = %class,
            suggested = %suggested,
            adjusted = %adjusted,
            "Suggested legacy fees"
        );
        Ok(adjusted)
    }

    /// Congestion-adjusted `(gasFeeCap, gasTipCap)` pair
    pub async fn suggested_eip1559_fees(&self) -> PilotResult<(U256, U256)> {
        let current_tip = self.transport.suggested_gas_tip_cap().await?;
        let stats =
            fee_history_stats(&self.transport, self.network.gas_price_estimation_blocks).await?;

        let priority = self.network.gas_price_estimation_tx_priority;
        let historical_base = f64_to_u256(stats.base_fee.for_priority(priority));
        let historical_tip = f64_to_u256(stats.tip.for_priority(priority));

        let metric = self.congestion_metric().await?;
        let class = classify_congestion(metric);
        let factor = adjustment_factor(priority);

        let (fee_cap, tip_cap) = dynamic_fees(
            current_tip,
            historical_base,
            historical_tip,
            metric,
            factor,
            class,
            self.network.gas_limit,
            self.network.gas_estimation_max_tx_cost_wei,
            self.fee_equalizer_enabled,
        );
        debug!(
            metric,
            class = %class,
            current_tip = %current_tip,
            historical_base = %historical_base,
            historical_tip = %historical_tip,
            fee_cap = %fee_cap,
            tip_cap = %tip_cap,
            "Suggested EIP-1559 fees"
        );
        Ok((fee_cap, tip_cap))
    }
}

/// Legacy pricing: congestion adjustment, buffer, absolute cost cap
pub fn legacy_price(
    suggested: U256,
    metric: f64,
    factor: f64,
    class: CongestionClass,
    gas_limit: u64,
    max_tx_cost_wei: u128,
) -> U256 {
    let adjustment = f64_to_u256(metric * factor * u256_to_f64(suggested));
    let adjusted = suggested + adjustment;
    let buffered = apply_buffer(adjusted, buffer_percent(class));
    cap_to_max_cost(buffered, gas_limit, max_tx_cost_wei)
}

/// EIP-1559 pricing: historical baseline, optional equalizer, congestion
/// adjustment on both dimensions, buffer, proportional cost cap.
#[allow(clippy::too_many_arguments)]
pub fn dynamic_fees(
    current_tip: U256,
    historical_base: U256,
    historical_tip: U256,
    metric: f64,
    factor: f64,
    class: CongestionClass,
    gas_limit: u64,
    max_tx_cost_wei: u128,
    equalize: bool,
) -> (U256, U256) {
    let mut suggested_tip = current_tip.max(historical_tip);
    let mut base_fee = historical_base;

    if equalize {
        (base_fee, suggested_tip) = equalize_fees(base_fee, suggested_tip);
    }

    let adjustment = f64_to_u256(metric * factor * u256_to_f64(suggested_tip));
    let adjusted_tip = suggested_tip + adjustment;
    let adjusted_base = base_fee + adjustment;

    let raw_fee_cap = adjusted_base + adjusted_tip;
    let fee_cap = apply_buffer(raw_fee_cap, buffer_percent(class));

    let capped = cap_to_max_cost(fee_cap, gas_limit, max_tx_cost_wei);
    if capped < fee_cap && !fee_cap.is_zero() {
        // scale the tip by the same ratio the cap shaved off the fee cap
        let tip_cap = adjusted_tip * capped / fee_cap;
        return (capped, tip_cap);
    }
    (fee_cap, adjusted_tip)
}

/// Lift the lower of base fee and tip when they differ by three or more
/// orders of magnitude (or one of them is zero).
fn equalize_fees(base_fee: U256, tip: U256) -> (U256, U256) {
    let magnitude = U256::from(EQUALIZER_MAGNITUDE);
    let far_apart = base_fee.is_zero()
        || tip.is_zero()
        || base_fee >= tip * magnitude
        || tip >= base_fee * magnitude;
    if !far_apart {
        return (base_fee, tip);
    }
    let higher = base_fee.max(tip);
    debug!(base_fee = %base_fee, tip = %tip, lifted_to = %higher, "Fee equalizer lifted the lower fee");
    (higher, higher)
}

fn cap_to_max_cost(per_gas: U256, gas_limit: u64, max_tx_cost_wei: u128) -> U256 {
    let gas_limit = U256::from(gas_limit.max(1));
    let max_cost = U256::from(max_tx_cost_wei);
    if per_gas.saturating_mul(gas_limit) > max_cost {
        let capped = max_cost / gas_limit;
        debug!(original = %per_gas, capped = %capped, "Estimated fee exceeds max allowed tx cost, capping");
        return capped;
    }
    per_gas
}

#[cfg(test)]
mod tests {
    use super::*;

    const GWEI: u64 = 1_000_000_000;
    const NO_CAP: u128 = u128::MAX;

    #[test]
    fn zero_metric_applies_low_buffer_only() {
        let suggested = U256::from(100 * GWEI);
        let price = legacy_price(suggested, 0.0, 1.2, CongestionClass::Low, 21_000, NO_CAP);
        // adjustment is zero, low-class buffer is +5 %
        assert_eq!(price, U256::from(105 * GWEI));
    }

    #[test]
    fn high_metric_classifies_ultra() {
        let suggested = U256::from(100u64);
        let price = legacy_price(
            suggested,
            0.8,
            1.0,
            classify_congestion(0.8),
            21_000,
            NO_CAP,
        );
        // 100 + 0.8*1.0*100 = 180, ultra buffer +20 % = 216
        assert_eq!(price, U256::from(216u64));
    }

    #[test]
    fn legacy_price_is_capped_by_max_cost() {
        let suggested = U256::from(1_000 * GWEI);
        let gas_limit = 1_000_000u64;
        let max_cost = 10u128 * GWEI as u128; // allows at most 10_000 wei per gas
        let price = legacy_price(suggested, 0.0, 1.0, CongestionClass::Low, gas_limit, max_cost);
        assert_eq!(price, U256::from(10_000u64));
    }

    #[test]
    fn dynamic_fees_use_higher_of_current_and_historical_tip() {
        let (fee_cap, tip) = dynamic_fees(
            U256::from(2 * GWEI),
            U256::from(10 * GWEI),
            U256::from(5 * GWEI),
            0.0,
            1.0,
            CongestionClass::Low,
            21_000,
            NO_CAP,
            false,
        );
        assert_eq!(tip, U256::from(5 * GWEI));
        // fee cap = (base + tip) * 1.05
        assert_eq!(fee_cap, U256::from(15 * GWEI) * 105 / 100);
    }

    #[test]
    fn dynamic_fee_cap_scales_tip_proportionally() {
        let gas_limit = 1_000_000u64;
        let max_cost = 1_000_000u128; // 1 wei per gas
        let (fee_cap, tip) = dynamic_fees(
            U256::from(GWEI),
            U256::from(GWEI),
            U256::from(GWEI),
            0.0,
            1.0,
            CongestionClass::Low,
            gas_limit,
            max_cost,
            false,
        );
        assert_eq!(fee_cap, U256::one());
        assert!(tip <= fee_cap);
    }

    #[test]
    fn equalizer_lifts_zero_and_distant_fees() {
        assert_eq!(
            equalize_fees(U256::zero(), U256::from(100u64)),
            (U256::from(100u64), U256::from(100u64))
        );
        assert_eq!(
            equalize_fees(U256::from(5_000_000u64), U256::from(5u64)),
            (U256::from(5_000_000u64), U256::from(5_000_000u64))
        );
        // within three orders of magnitude: untouched
        assert_eq!(
            equalize_fees(U256::from(900u64), U256::from(2u64)),
            (U256::from(900u64), U256::from(2u64))
        );
    }

    #[test]
    fn equalizer_only_runs_when_enabled() {
        let base = U256::from(1_000_000u64);
        let tip = U256::one();
        let (_, tip_without) = dynamic_fees(
            tip,
            base,
            tip,
            0.0,
            1.0,
            CongestionClass::Low,
            21_000,
            NO_CAP,
            false,
        );
        let (_, tip_with) = dynamic_fees(
            tip,
            base,
            tip,
            0.0,
            1.0,
            CongestionClass::Low,
            21_000,
            NO_CAP,
            true,
        );
        assert_eq!(tip_without, tip);
        assert_eq!(tip_with, base);
    }
}
