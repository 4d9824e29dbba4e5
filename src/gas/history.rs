//! Historical fee statistics from `eth_feeHistory`

use crate::chain::RpcTransport;
use crate::config::TxPriority;
use crate::error::{PilotError, PilotResult};
use crate::gas::u256_to_f64;

use tracing::trace;

/// The reward percentile asked of the node per block; the spread across
/// blocks is what the quantiles below are computed from.
const REWARD_PERCENTILE: f64 = 50.0;

/// Percentile summary of one fee dimension across the sampled window
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QuantileStats {
    pub max: f64,
    pub perc_99: f64,
    pub perc_50: f64,
    pub perc_25: f64,
}

impl QuantileStats {
    fn from_samples(mut samples: Vec<f64>) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        samples.sort_by(|a, b| a.total_cmp(b));
        Self {
            max: *samples.last().unwrap(),
            perc_99: quantile(&samples, 0.99),
            perc_50: quantile(&samples, 0.50),
            perc_25: quantile(&samples, 0.25),
        }
    }

    /// Value at the percentile this priority targets
    pub fn for_priority(&self, priority: TxPriority) -> f64 {
        match priority {
            TxPriority::Degen => self.max,
            TxPriority::Fast => self.perc_99,
            TxPriority::Standard => self.perc_50,
            TxPriority::Slow => self.perc_25,
        }
    }
}

/// Base-fee and tip statistics over the estimation window
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FeeStats {
    pub base_fee: QuantileStats,
    pub tip: QuantileStats,
}

/// Nearest-rank quantile over a sorted, non-empty sample set
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let rank = (q * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Fetch fee history for the last `blocks` blocks and summarise base fees
/// and tips into quantile stats.
pub async fn fee_history_stats(transport: &RpcTransport, blocks: u64) -> PilotResult<FeeStats> {
    let history = transport
        .fee_history(blocks, &[REWARD_PERCENTILE])
        .await
        .map_err(|e| PilotError::GasEstimation(format!("fee history unavailable: {e}")))?;

    let base_fees: Vec<f64> = history
        .base_fee_per_gas
        .iter()
        .map(|fee| u256_to_f64(*fee))
        .collect();
    let tips: Vec<f64> = history
        .reward
        .iter()
        .filter_map(|per_block| per_block.first())
        .map(|tip| u256_to_f64(*tip))
        .collect();

    if base_fees.is_empty() {
        return Err(PilotError::GasEstimation(
            "fee history returned no base fees".to_string(),
        ));
    }
    trace!(
        base_fee_samples = base_fees.len(),
        tip_samples = tips.len(),
        "Computed historical fee stats"
    );

    Ok(FeeStats {
        base_fee: QuantileStats::from_samples(base_fees),
        tip: QuantileStats::from_samples(tips),
    })
}
