//! Network congestion metric over recent block headers

use crate::chain::{BlockHeader, RpcTransport};
use crate::config::CongestionStrategy;
use crate::error::{PilotError, PilotResult};
use crate::gas::HeaderCache;

use futures::stream::{self, StreamExt};
use std::time::Instant;
use tracing::{debug, error, trace};

/// Upper bound on concurrent header fetches during the window walk
const FETCH_CONCURRENCY: usize = 20;

/// Minimum share of the requested window that must be available before the
/// metric is considered meaningful
const MIN_BLOCK_SHARE: f64 = 0.8;

/// Congestion classification of the current network state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionClass {
    Low,
    Medium,
    High,
    Ultra,
}

impl std::fmt::Display for CongestionClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CongestionClass::Low => "low",
            CongestionClass::Medium => "medium",
            CongestionClass::High => "high",
            CongestionClass::Ultra => "ultra",
        };
        f.write_str(name)
    }
}

/// Map a metric in [0, 1] onto a congestion class
pub fn classify_congestion(metric: f64) -> CongestionClass {
    if metric < 0.33 {
        CongestionClass::Low
    } else if metric <= 0.66 {
        CongestionClass::Medium
    } else if metric <= 0.75 {
        CongestionClass::High
    } else {
        CongestionClass::Ultra
    }
}

/// Compute the congestion metric over the last `window` blocks.
///
/// Headers are fetched through the cache with a bounded fan-out. If fewer
/// than 80 % of the requested headers are available the metric is not
/// meaningful and `CongestionDataInsufficient` is returned; callers decide
/// whether to degrade.
pub async fn network_congestion_metric(
    transport: &RpcTransport,
    cache: &HeaderCache,
    window: u64,
    strategy: CongestionStrategy,
) -> PilotResult<f64> {
    let last = transport.latest_block_number().await?;
    let first = last.saturating_sub(window.saturating_sub(1)).max(1);
    trace!(first, last, "Block range for congestion calculation");

    let started = Instant::now();
    let mut headers: Vec<BlockHeader> = stream::iter(first..=last)
        .map(|number| async move {
            if let Some(header) = cache.get(number) {
                return Some(header);
            }
            match transport.get_header(number).await {
                Ok(Some(header)) => {
                    cache.set(header.clone());
                    Some(header)
                }
                Ok(None) => None,
                Err(e) => {
                    error!(block = number, error = %e, "Failed to fetch block header");
                    None
                }
            }
        })
        .buffer_unordered(FETCH_CONCURRENCY)
        .filter_map(|h| async move { h })
        .collect()
        .await;
    debug!(
        blocks = headers.len(),
        elapsed = ?started.elapsed(),
        "Fetched header window"
    );

    let wanted = ((last - first + 1) as f64 * MIN_BLOCK_SHARE) as usize;
    if headers.len() < wanted.max(2) {
        return Err(PilotError::CongestionDataInsufficient {
            wanted: wanted.max(2),
            got: headers.len(),
        });
    }

    headers.sort_by_key(|h| h.number);
    Ok(match strategy {
        CongestionStrategy::Simple => simple_metric(&headers),
        CongestionStrategy::NewestFirst => newest_first_metric(&headers),
    })
}

/// Average of the base-fee trend and the mean gas-used ratio
pub fn simple_metric(headers: &[BlockHeader]) -> f64 {
    (base_fee_trend(headers) + gas_used_ratio(headers)) / 2.0
}

/// Weighted mean of per-block fullness, recent blocks weighted more.
/// Weight for a block at `distance` from the newest is
/// `1 / log10(distance + 10)`.
pub fn newest_first_metric(headers: &[BlockHeader]) -> f64 {
    let scale_factor = 10.0;
    let mut weighted_sum = 0.0;
    let mut total_weight = 0.0;

    for (i, header) in headers.iter().enumerate() {
        let distance = (headers.len() - 1 - i) as f64;
        let weight = 1.0 / (distance + scale_factor).log10();
        weighted_sum += header.gas_used_ratio() * weight;
        total_weight += weight;
    }

    if total_weight == 0.0 {
        return 0.0;
    }
    weighted_sum / total_weight
}

/// Fraction of consecutive block pairs in which the base fee rose
fn base_fee_trend(headers: &[BlockHeader]) -> f64 {
    if headers.len() < 2 {
        return 0.0;
    }
    let rises = headers
        .windows(2)
        .filter(|pair| pair[1].base_fee > pair[0].base_fee)
        .count();
    rises as f64 / (headers.len() - 1) as f64
}

fn gas_used_ratio(headers: &[BlockHeader]) -> f64 {
    if headers.is_empty() {
        return 0.0;
    }
    headers.iter().map(BlockHeader::gas_used_ratio).sum::<f64>() / headers.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::U256;

    fn header(number: u64, gas_used: u64, base_fee: u64) -> BlockHeader {
        BlockHeader {
            number,
            gas_used: U256::from(gas_used),
            gas_limit: U256::from(100u64),
            base_fee: U256::from(base_fee),
        }
    }

    #[test]
    fn classification_boundaries() {
        assert_eq!(classify_congestion(0.0), CongestionClass::Low);
        assert_eq!(classify_congestion(0.32), CongestionClass::Low);
        assert_eq!(classify_congestion(0.33), CongestionClass::Medium);
        assert_eq!(classify_congestion(0.66), CongestionClass::Medium);
        assert_eq!(classify_congestion(0.70), CongestionClass::High);
        assert_eq!(classify_congestion(0.75), CongestionClass::High);
        assert_eq!(classify_congestion(0.76), CongestionClass::Ultra);
        assert_eq!(classify_congestion(1.0), CongestionClass::Ultra);
    }

    #[test]
    fn simple_metric_empty_network() {
        // empty blocks, flat base fee: no congestion at all
        let headers: Vec<_> = (1..=5).map(|n| header(n, 0, 7)).collect();
        assert_eq!(simple_metric(&headers), 0.0);
    }

    #[test]
    fn simple_metric_full_rising_network() {
        // full blocks, strictly rising base fee: maximal congestion
        let headers: Vec<_> = (1..=5).map(|n| header(n, 100, n * 10)).collect();
        assert!((simple_metric(&headers) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn simple_metric_mixed() {
        // half-full blocks, base fee rises on 2 of 4 transitions
        let fees = [10u64, 20, 15, 25, 20];
        let headers: Vec<_> = fees
            .iter()
            .enumerate()
            .map(|(i, fee)| header(i as u64 + 1, 50, *fee))
            .collect();
        let expected = (0.5 + 0.5) / 2.0;
        assert!((simple_metric(&headers) - expected).abs() < 1e-9);
    }

    #[test]
    fn newest_first_weighs_recent_blocks_more() {
        // old blocks empty, newest full: metric must exceed the plain mean
        let mut headers: Vec<_> = (1..=9).map(|n| header(n, 0, 7)).collect();
        headers.push(header(10, 100, 7));
        let metric = newest_first_metric(&headers);
        assert!(metric > 0.1, "metric {metric} should exceed the plain mean");

        // and the mirror image: newest empty block drags the metric down
        let mut headers: Vec<_> = (1..=9).map(|n| header(n, 100, 7)).collect();
        headers.push(header(10, 0, 7));
        let mirrored = newest_first_metric(&headers);
        assert!(mirrored < 0.9);
        assert!(metric + mirrored - 1.0 < 1e-9);
    }

    #[test]
    fn newest_first_uniform_fullness_is_exact() {
        let headers: Vec<_> = (1..=20).map(|n| header(n, 60, 7)).collect();
        assert!((newest_first_metric(&headers) - 0.6).abs() < 1e-9);
    }
}
