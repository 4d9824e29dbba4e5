//! JSON-RPC transport
//!
//! Thin wrapper over an HTTP provider: dial-timeout-bounded connection
//! setup, custom header injection and the handful of typed calls the rest
//! of the library needs. Anything heavier (tracing, fee history walks)
//! builds on [`RpcTransport::provider`] or raw `request` calls.

use crate::config::Config;
use crate::error::{PilotError, PilotResult};

use ethers::providers::{Http, Middleware, Provider};
use ethers::types::{
    Address, Block, BlockId, BlockNumber, Bytes, FeeHistory, Transaction, TransactionReceipt,
    TxHash, H256, U256,
};
use ethers::types::transaction::eip2718::TypedTransaction;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::time::Duration;
use tracing::debug;

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// The block header fields fee estimation needs, detached from the full
/// RPC block so cache entries stay immutable and small.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub number: u64,
    pub gas_used: U256,
    pub gas_limit: U256,
    pub base_fee: U256,
}

impl BlockHeader {
    pub fn from_block(block: &Block<H256>) -> Option<Self> {
        Some(Self {
            number: block.number?.as_u64(),
            gas_used: block.gas_used,
            gas_limit: block.gas_limit,
            base_fee: block.base_fee_per_gas.unwrap_or_default(),
        })
    }

    /// Block fullness in [0, 1]
    pub fn gas_used_ratio(&self) -> f64 {
        if self.gas_limit.is_zero() {
            return 0.0;
        }
        self.gas_used.as_u128() as f64 / self.gas_limit.as_u128() as f64
    }
}

/// HTTP JSON-RPC transport for a single endpoint
pub struct RpcTransport {
    provider: Provider<Http>,
    url: String,
    chain_id: u64,
}

impl RpcTransport {
    /// Connect to the first configured RPC URL, honoring the dial timeout
    /// and any custom headers from the environment.
    pub fn connect(cfg: &Config) -> PilotResult<Self> {
        let raw_url = cfg
            .network
            .urls_secret
            .first()
            .ok_or_else(|| PilotError::Config("no RPC URLs configured".to_string()))?;
        let url: url::Url = raw_url
            .parse()
            .map_err(|e| PilotError::Config(format!("invalid RPC URL {raw_url:?}: {e}")))?;

        let mut headers = HeaderMap::new();
        for (key, value) in &cfg.rpc_headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| PilotError::Config(format!("invalid RPC header name {key:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| PilotError::Config(format!("invalid RPC header value for {key}: {e}")))?;
            headers.insert(name, value);
        }

        let dial_timeout = cfg
            .network
            .dial_timeout
            .map(|d| d.inner())
            .unwrap_or(DEFAULT_DIAL_TIMEOUT);
        let http_client = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(dial_timeout)
            .build()
            .map_err(|e| PilotError::Config(format!("failed to build HTTP client: {e}")))?;

        let transport = Http::new_with_client(url, http_client);
        let provider = Provider::new(transport).interval(POLL_INTERVAL);

        debug!(url = %raw_url, chain_id = cfg.network.chain_id, "Connected RPC transport");
        Ok(Self {
            provider,
            url: raw_url.clone(),
            chain_id: cfg.network.chain_id,
        })
    }

    pub fn provider(&self) -> &Provider<Http> {
        &self.provider
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub async fn latest_block_number(&self) -> PilotResult<u64> {
        Ok(self.provider.get_block_number().await?.as_u64())
    }

    /// Fetch the slim header for a block, `None` if the node does not have it
    pub async fn get_header(&self, number: u64) -> PilotResult<Option<BlockHeader>> {
        let block = self.provider.get_block(number).await?;
        Ok(block.as_ref().and_then(BlockHeader::from_block))
    }

    pub async fn suggested_gas_price(&self) -> PilotResult<U256> {
        Ok(self.provider.get_gas_price().await?)
    }

    /// Node's suggested priority fee (`eth_maxPriorityFeePerGas`)
    pub async fn suggested_gas_tip_cap(&self) -> PilotResult<U256> {
        Ok(self
            .provider
            .request("eth_maxPriorityFeePerGas", ())
            .await?)
    }

    pub async fn fee_history(
        &self,
        block_count: u64,
        reward_percentiles: &[f64],
    ) -> PilotResult<FeeHistory> {
        Ok(self
            .provider
            .fee_history(block_count, BlockNumber::Latest, reward_percentiles)
            .await?)
    }

    pub async fn get_receipt(&self, hash: TxHash) -> PilotResult<Option<TransactionReceipt>> {
        Ok(self.provider.get_transaction_receipt(hash).await?)
    }

    pub async fn get_transaction(&self, hash: TxHash) -> PilotResult<Option<Transaction>> {
        Ok(self.provider.get_transaction(hash).await?)
    }

    pub async fn send_raw_transaction(&self, raw: Bytes) -> PilotResult<TxHash> {
        let pending = self
            .provider
            .send_raw_transaction(raw)
            .await
            .map_err(|e| PilotError::TxRejected(e.to_string()))?;
        Ok(pending.tx_hash())
    }

    /// Read-only call, optionally pinned to a block
    pub async fn call(
        &self,
        tx: &TypedTransaction,
        block: Option<BlockId>,
    ) -> Result<Bytes, ethers::providers::ProviderError> {
        self.provider.call(tx, block).await
    }

    pub async fn pending_nonce_at(&self, address: Address) -> PilotResult<u64> {
        Ok(self
            .provider
            .get_transaction_count(address, Some(BlockNumber::Pending.into()))
            .await?
            .as_u64())
    }

    pub async fn latest_nonce_at(&self, address: Address) -> PilotResult<u64> {
        Ok(self
            .provider
            .get_transaction_count(address, Some(BlockNumber::Latest.into()))
            .await?
            .as_u64())
    }

    pub async fn balance_of(&self, address: Address) -> PilotResult<U256> {
        Ok(self.provider.get_balance(address, None).await?)
    }

    pub async fn get_code(&self, address: Address) -> PilotResult<Bytes> {
        Ok(self.provider.get_code(address, None).await?)
    }

    pub async fn estimate_gas(&self, tx: &TypedTransaction) -> PilotResult<U256> {
        self.provider
            .estimate_gas(tx, None)
            .await
            .map_err(|e| PilotError::GasEstimation(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::U64;

    fn block_with(number: u64, gas_used: u64, gas_limit: u64, base_fee: u64) -> Block<H256> {
        Block {
            number: Some(U64::from(number)),
            gas_used: U256::from(gas_used),
            gas_limit: U256::from(gas_limit),
            base_fee_per_gas: Some(U256::from(base_fee)),
            ..Default::default()
        }
    }

    #[test]
    fn header_from_block() {
        let header = BlockHeader::from_block(&block_with(7, 5_000_000, 10_000_000, 42)).unwrap();
        assert_eq!(header.number, 7);
        assert_eq!(header.base_fee, U256::from(42));
        assert!((header.gas_used_ratio() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn pending_block_has_no_header() {
        let mut block = block_with(0, 0, 1, 0);
        block.number = None;
        assert!(BlockHeader::from_block(&block).is_none());
    }

    #[test]
    fn zero_gas_limit_ratio_is_zero() {
        let header = BlockHeader {
            number: 1,
            gas_used: U256::from(100),
            gas_limit: U256::zero(),
            base_fee: U256::zero(),
        };
        assert_eq!(header.gas_used_ratio(), 0.0);
    }
}
