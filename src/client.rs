//! The client: composition root and public surface
//!
//! Wires the transport, key set, nonce manager, gas oracle, ABI store,
//! contract map and tracer together. Construction reconciles nonces,
//! optionally funds ephemeral keys from the root key and runs the startup
//! health check before handing the client out.

use crate::abi::{AbiFinder, ContractMap, ContractStore};
use crate::chain::RpcTransport;
use crate::config::{Config, KeyfileSource, TracingLevel};
use crate::error::{PilotError, PilotResult};
use crate::gas::{GasOracle, HeaderCache};
use crate::keys;
use crate::trace::decoder::{decode_revert, decode_transaction_frame};
use crate::trace::{DecodedCall, DecodedTransaction, Tracer};
use crate::tx::lifecycle::{
    retry_on_connection_refused, send_with_bumps, sign_and_send, wait_mined,
};
use crate::tx::{
    noop_bump_strategy, priority_bump_strategy, FeeSnapshot, GasBumpStrategy, NonceManager,
    TxOutcome, TxTemplate,
};

use ethers::abi::{Abi, Token};
use ethers::providers::RpcError;
use ethers::signers::LocalWallet;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address, BlockId, Bytes, TransactionReceipt, TransactionRequest, TxHash, U256, U64,
};
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const WEI_PER_ETHER: u128 = 1_000_000_000_000_000_000;
const HEALTH_CHECK_TRANSFER_WEI: u64 = 10_000;
const CODE_PRESENCE_ATTEMPTS: u32 = 10;
const CODE_PRESENCE_DELAY: Duration = Duration::from_secs(1);

/// Funding split from the root key to ephemeral keys
#[derive(Debug, Clone)]
pub struct FundingDetails {
    pub root_balance: U256,
    pub total_fee: U256,
    pub free_balance: U256,
    pub addr_funding: U256,
    pub network_transfer_fee: U256,
}

/// A successful contract deployment
#[derive(Debug, Clone)]
pub struct DeploymentData {
    pub address: Address,
    pub outcome: TxOutcome,
}

/// Ethereum JSON-RPC client with nonce coordination, adaptive fees, gas
/// bumping and call-tree tracing.
pub struct Client {
    cfg: Config,
    transport: Arc<RpcTransport>,
    wallets: Vec<LocalWallet>,
    addresses: Vec<Address>,
    contract_store: Arc<ContractStore>,
    contract_map: Arc<ContractMap>,
    abi_finder: Arc<AbiFinder>,
    nonce_manager: Arc<NonceManager>,
    header_cache: Arc<HeaderCache>,
    gas_oracle: GasOracle,
    tracer: Arc<Tracer>,
    bump_strategy: GasBumpStrategy,
    contract_map_file: Option<PathBuf>,
}

impl Client {
    /// Construct a client from validated configuration
    pub async fn new(cfg: Config) -> PilotResult<Self> {
        let transport = Arc::new(RpcTransport::connect(&cfg)?);
        let wallets = keys::resolve_wallets(&cfg)?;
        let addresses = keys::addresses_of(&wallets);

        let contract_map_file = Self::resolve_map_file(&cfg);
        let contract_map = match &contract_map_file {
            Some(path) => {
                let map = ContractMap::load(path)?;
                if !map.is_empty() {
                    info!(size = map.len(), file = ?path, "Read contract map from file");
                }
                Arc::new(map)
            }
            None => {
                debug!("Simulated network, contract map won't be read from file");
                Arc::new(ContractMap::new())
            }
        };

        let contract_store = Arc::new(ContractStore::new());
        let abi_finder = Arc::new(AbiFinder::new(contract_store.clone(), contract_map.clone()));
        let header_cache = Arc::new(HeaderCache::new(cfg.network.gas_price_estimation_blocks));
        let gas_oracle = GasOracle::new(transport.clone(), header_cache.clone(), &cfg);
        let nonce_manager = Arc::new(NonceManager::new(
            cfg.nonce_manager.clone(),
            transport.clone(),
            addresses.clone(),
        ));
        let tracer = Arc::new(Tracer::new(
            transport.clone(),
            abi_finder.clone(),
            addresses.clone(),
            cfg.trace_to_json,
        ));
        let bump_strategy = if cfg.gas_bump_retries > 0 {
            priority_bump_strategy(cfg.network.gas_price_estimation_tx_priority)
        } else {
            noop_bump_strategy()
        };

        let client = Self {
            cfg,
            transport,
            wallets,
            addresses,
            contract_store,
            contract_map,
            abi_finder,
            nonce_manager,
            header_cache,
            gas_oracle,
            tracer,
            bump_strategy,
            contract_map_file,
        };

        client.nonce_manager.update_nonces().await?;
        if client.cfg.pending_nonce_protection_enabled {
            client.assert_no_pending_txs().await?;
        }

        info!(
            network = %client.cfg.network.name,
            chain_id = client.cfg.network.chain_id,
            rpc = client.transport.url(),
            keys = client.addresses.len(),
            "Created new client"
        );

        if client.is_ephemeral_mode() && client.addresses.len() > 1 {
            client.fund_ephemeral_keys().await?;
        }
        if client.cfg.check_rpc_health_on_start {
            client.startup_health_check().await?;
        }
        Ok(client)
    }

    fn resolve_map_file(cfg: &Config) -> Option<PathBuf> {
        if cfg.is_simulated_network() {
            return None;
        }
        match &cfg.contract_map_file {
            Some(path) => Some(PathBuf::from(path)),
            None if cfg.save_deployed_contracts_map => {
                Some(PathBuf::from(cfg.generate_contract_map_file_name()))
            }
            None => None,
        }
    }

    fn is_ephemeral_mode(&self) -> bool {
        self.cfg.ephemeral_addresses_number.unwrap_or(0) > 0
            && self.cfg.keyfile_source == KeyfileSource::Disabled
    }

    /// Replace the gas bump strategy (identity disables bumping)
    pub fn set_bump_strategy(&mut self, strategy: GasBumpStrategy) {
        self.bump_strategy = strategy;
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn transport(&self) -> &Arc<RpcTransport> {
        &self.transport
    }

    pub fn addresses(&self) -> &[Address] {
        &self.addresses
    }

    pub fn contract_store(&self) -> &Arc<ContractStore> {
        &self.contract_store
    }

    pub fn contract_map(&self) -> &Arc<ContractMap> {
        &self.contract_map
    }

    pub fn tracer(&self) -> &Arc<Tracer> {
        &self.tracer
    }

    pub fn nonce_manager(&self) -> &Arc<NonceManager> {
        &self.nonce_manager
    }

    pub fn header_cache(&self) -> &Arc<HeaderCache> {
        &self.header_cache
    }

    /// The privileged funding key
    pub fn root_key_address(&self) -> PilotResult<Address> {
        self.addresses
            .first()
            .copied()
            .ok_or_else(|| PilotError::Config("no addresses loaded".to_string()))
    }

    /// Index of any key whose last nonce reconciliation succeeded
    pub fn any_synced_key(&self) -> Option<usize> {
        self.nonce_manager.any_synced_key()
    }

    /// Re-run nonce reconciliation for every managed key
    pub async fn update_nonces(&self) -> PilotResult<()> {
        self.nonce_manager.update_nonces().await
    }

    /* fee estimation */

    /// Congestion-adjusted legacy gas price
    pub async fn suggested_legacy_fees(&self) -> PilotResult<U256> {
        self.gas_oracle.suggested_legacy_fees().await
    }

    /// Congestion-adjusted `(gasFeeCap, gasTipCap)` pair
    pub async fn suggested_eip1559_fees(&self) -> PilotResult<(U256, U256)> {
        self.gas_oracle.suggested_eip1559_fees().await
    }

    /// Current fee snapshot for the active network: oracle estimate when
    /// enabled (static config values on oracle failure), otherwise config
    /// values with node hints filling the gaps.
    pub async fn fee_snapshot(&self) -> PilotResult<FeeSnapshot> {
        let network = &self.cfg.network;
        if network.eip_1559_dynamic_fees {
            if network.gas_price_estimation_enabled {
                match self.gas_oracle.suggested_eip1559_fees().await {
                    Ok((gas_fee_cap, gas_tip_cap)) => {
                        return Ok(FeeSnapshot::Dynamic {
                            gas_fee_cap,
                            gas_tip_cap,
                        })
                    }
                    Err(e) => {
                        warn!(error = %e, "Gas estimation failed, falling back to configured static fees")
                    }
                }
            }
            let gas_tip_cap = if network.gas_tip_cap > 0 {
                U256::from(network.gas_tip_cap)
            } else {
                self.transport.suggested_gas_tip_cap().await?
            };
            Ok(FeeSnapshot::Dynamic {
                gas_fee_cap: U256::from(network.gas_fee_cap),
                gas_tip_cap,
            })
        } else {
            if network.gas_price_estimation_enabled {
                match self.gas_oracle.suggested_legacy_fees().await {
                    Ok(gas_price) => return Ok(FeeSnapshot::Legacy { gas_price }),
                    Err(e) => {
                        warn!(error = %e, "Gas estimation failed, falling back to configured static fees")
                    }
                }
            }
            let gas_price = if network.gas_price > 0 {
                U256::from(network.gas_price)
            } else {
                self.transport.suggested_gas_price().await?
            };
            Ok(FeeSnapshot::Legacy { gas_price })
        }
    }

    /* transaction options */

    /// Transaction template for the root key
    pub async fn tx_opts(&self) -> PilotResult<TxTemplate> {
        self.tx_key_opts(0).await
    }

    /// Transaction template for key `key_index`: next nonce from the nonce
    /// manager, fees from the oracle/config, gas limit from the network.
    pub async fn tx_key_opts(&self, key_index: usize) -> PilotResult<TxTemplate> {
        let address = self.key_address(key_index)?;
        let fee = self.fee_snapshot().await?;
        let nonce = self.nonce_manager.next_nonce(address);
        debug!(
            key = key_index,
            nonce,
            fee = ?fee,
            gas_limit = self.cfg.network.gas_limit,
            "New transaction options"
        );
        Ok(TxTemplate {
            from_index: key_index,
            to: None,
            value: U256::zero(),
            data: Bytes::default(),
            gas_limit: self.cfg.network.gas_limit,
            fee,
            nonce,
        })
    }

    /* submission */

    /// Sign and broadcast a template, then watch it to a receipt within
    /// the transaction timeout, bumping fees up to `gas_bump_retries`
    /// times.
    pub async fn send_with_bumps(&self, template: &TxTemplate) -> PilotResult<TxOutcome> {
        let from = self.key_address(template.from_index)?;
        let tx = template.to_typed(from, self.cfg.network.chain_id);
        send_with_bumps(
            &self.transport,
            &self.wallets,
            tx,
            &self.bump_strategy,
            self.cfg.network.transaction_timeout.inner(),
            self.cfg.gas_bump_retries,
        )
        .await
    }

    /// Submit with connection-refused retries, then decode the result.
    /// Mirrors the full submission pipeline most callers want.
    pub async fn submit_and_decode(&self, template: &TxTemplate) -> PilotResult<DecodedTransaction> {
        let outcome =
            retry_on_connection_refused(|| self.send_with_bumps(template)).await?;
        self.decode(outcome.hash).await
    }

    /// Transfer wei between keys with the flat transfer gas limit. The
    /// primitive behind ephemeral funding and the startup health check.
    pub async fn transfer_from_key(
        &self,
        from_index: usize,
        to: Address,
        value: U256,
    ) -> PilotResult<TransactionReceipt> {
        let from = self.key_address(from_index)?;
        let gas_price = match self.cfg.network.gas_price {
            0 => self.transport.suggested_gas_price().await?,
            configured => U256::from(configured),
        };
        let template = TxTemplate {
            from_index,
            to: Some(to),
            value,
            data: Bytes::default(),
            gas_limit: self.cfg.network.transfer_gas_fee,
            fee: FeeSnapshot::Legacy { gas_price },
            nonce: self.nonce_manager.next_nonce(from),
        };
        let tx = template.to_typed(from, self.cfg.network.chain_id);
        let hash = sign_and_send(&self.transport, &self.wallets[from_index], &tx).await?;
        info!(
            from = from_index,
            to = ?to,
            value = %value,
            tx = ?hash,
            "Send ETH"
        );
        wait_mined(
            &self.transport,
            hash,
            self.cfg.network.transaction_timeout.inner(),
        )
        .await
    }

    /* deployment */

    /// Deploy a contract and wait until its code is observable at the
    /// deployed address. Records the deployment in the contract map (and
    /// the map file on live networks) so traces can name it.
    pub async fn deploy_contract(
        &self,
        template: &TxTemplate,
        name: &str,
        abi: Abi,
        bytecode: Bytes,
        constructor_args: &[Token],
    ) -> PilotResult<DeploymentData> {
        let data = match (abi.constructor(), constructor_args.is_empty()) {
            (Some(constructor), _) => Bytes::from(
                constructor
                    .encode_input(bytecode.to_vec(), constructor_args)
                    .map_err(|e| {
                        PilotError::Config(format!("failed to encode constructor args: {e}"))
                    })?,
            ),
            (None, true) => bytecode,
            (None, false) => {
                return Err(PilotError::Config(format!(
                    "{name} has no constructor but constructor args were given"
                )))
            }
        };
        let template = template.clone().with_data(data);
        info!(contract = name, "Deploying contract");

        let outcome = self.send_with_bumps(&template).await?;
        let address = outcome
            .receipt
            .contract_address
            .ok_or_else(|| PilotError::Internal("deployment receipt has no address".to_string()))?;

        self.wait_for_code(address).await?;
        info!(contract = name, address = ?address, tx = ?outcome.hash, "Deployed contract");

        self.contract_map.add(address, name);
        if !self.contract_store.has_abi(name) {
            self.contract_store.add_abi(name, abi);
        }
        if self.cfg.should_save_contract_map() {
            if let Some(path) = &self.contract_map_file {
                if let Err(e) = ContractMap::save_entry(path, address, name) {
                    warn!(error = %e, "Failed to save deployed contract address to file");
                }
            }
        }

        Ok(DeploymentData { address, outcome })
    }

    /// Deploy by name from the contract store's ABI and bytecode
    pub async fn deploy_contract_from_store(
        &self,
        template: &TxTemplate,
        name: &str,
        constructor_args: &[Token],
    ) -> PilotResult<DeploymentData> {
        let name = name.trim_end_matches(".abi").trim_end_matches(".bin");
        let abi = self
            .contract_store
            .get_abi(name)
            .ok_or_else(|| PilotError::NoAbiFound(name.to_string()))?;
        let bytecode = self
            .contract_store
            .get_bytecode(name)
            .ok_or_else(|| PilotError::Config(format!("no bytecode found for {name}")))?;
        self.deploy_contract(template, name, abi, bytecode, constructor_args)
            .await
    }

    // a mined deployment can briefly precede code visibility on some nodes
    async fn wait_for_code(&self, address: Address) -> PilotResult<()> {
        for attempt in 1..=CODE_PRESENCE_ATTEMPTS {
            match self.transport.get_code(address).await {
                Ok(code) if !code.is_empty() => return Ok(()),
                Ok(_) => debug!(attempt, address = ?address, "Waiting for contract code"),
                Err(e) => warn!(attempt, error = %e, "Failed to fetch contract code"),
            }
            tokio::time::sleep(CODE_PRESENCE_DELAY).await;
        }
        Err(PilotError::Timeout {
            operation: format!("contract code at {address:?}"),
        })
    }

    /* decoding */

    /// Wait for inclusion and decode the transaction: top-level call,
    /// receipt logs, revert reason for failed transactions, and the full
    /// frame tree when the tracing level asks for it.
    pub async fn decode(&self, hash: TxHash) -> PilotResult<DecodedTransaction> {
        let receipt = wait_mined(
            &self.transport,
            hash,
            self.cfg.network.transaction_timeout.inner(),
        )
        .await?;
        let tx = self
            .transport
            .get_transaction(hash)
            .await?
            .ok_or(PilotError::TxNotFound(hash))?;

        let reverted = receipt.status == Some(U64::zero());
        if reverted {
            let revert_err = self.revert_reason(&tx, &receipt).await;
            if matches!(
                self.cfg.tracing_level,
                TracingLevel::All | TracingLevel::Reverted
            ) {
                if let Err(e) = self.tracer.trace_transaction(hash).await {
                    warn!(tx = ?hash, error = %e, "Failed to trace reverted transaction");
                }
            }
            return Err(revert_err);
        }

        let top_level =
            match decode_transaction_frame(&self.abi_finder, &self.addresses, &tx, &receipt) {
                Ok(frame) => frame,
                // tracing may still surface useful data for this tx
                Err(e) if self.cfg.tracing_level == TracingLevel::All => {
                    warn!(tx = ?hash, error = %e, "Failed to decode top-level call, relying on trace");
                    DecodedCall {
                        comment: crate::trace::FAILED_TO_DECODE.to_string(),
                        ..Default::default()
                    }
                }
                Err(e) => return Err(e),
            };

        let all_frames = if self.cfg.tracing_level == TracingLevel::All {
            self.tracer.trace_transaction(hash).await?
        } else {
            Vec::new()
        };

        Ok(DecodedTransaction {
            hash,
            receipt,
            raw_tx: tx,
            top_level,
            all_frames,
        })
    }

    /// Re-issue the reverted call read-only at its block to extract and
    /// decode the revert payload.
    async fn revert_reason(
        &self,
        tx: &ethers::types::Transaction,
        receipt: &TransactionReceipt,
    ) -> PilotError {
        let mut request = TransactionRequest::new()
            .from(tx.from)
            .value(tx.value)
            .data(tx.input.clone())
            .gas(tx.gas);
        if let Some(to) = tx.to {
            request = request.to(to);
        }
        if let Some(gas_price) = tx.gas_price {
            request = request.gas_price(gas_price);
        }
        let call: TypedTransaction = request.into();
        let block = receipt.block_number.map(|b| BlockId::from(b.as_u64()));

        match self.transport.call(&call, block).await {
            Ok(_) => PilotError::Reverted {
                name: crate::trace::UNKNOWN.to_string(),
                values: vec!["transaction reverted but the replayed call succeeded".to_string()],
            },
            Err(e) => match extract_revert_bytes(&e) {
                Some(payload) => decode_revert(&payload, &self.contract_store),
                None => PilotError::Reverted {
                    name: crate::trace::UNKNOWN.to_string(),
                    values: vec![e.to_string()],
                },
            },
        }
    }

    /* startup duties */

    async fn assert_no_pending_txs(&self) -> PilotResult<()> {
        for address in &self.addresses {
            let pending = self.transport.pending_nonce_at(*address).await?;
            let latest = self.transport.latest_nonce_at(*address).await?;
            if pending > latest {
                return Err(PilotError::PendingTxProtection(*address));
            }
        }
        Ok(())
    }

    async fn startup_health_check(&self) -> PilotResult<()> {
        let root = self.root_key_address()?;
        self.transfer_from_key(0, root, U256::from(HEALTH_CHECK_TRANSFER_WEI))
            .await
            .map_err(|e| PilotError::HealthCheckFailed(e.to_string()))?;
        info!("Startup health check passed");
        Ok(())
    }

    /// Work out how much each ephemeral key receives out of the root key's
    /// balance, after transfer fees and the configured root buffer.
    pub async fn calculate_subkey_funding(&self, addrs: u64) -> PilotResult<FundingDetails> {
        let root = self.root_key_address()?;
        let balance = self.transport.balance_of(root).await?;

        let gas_price = match self.cfg.network.gas_price {
            0 => self.transport.suggested_gas_price().await?,
            configured => U256::from(configured),
        };
        let network_transfer_fee = gas_price * U256::from(self.cfg.network.transfer_gas_fee);
        let total_fee = network_transfer_fee * U256::from(addrs);
        let buffer = U256::from(self.cfg.root_key_funds_buffer) * U256::from(WEI_PER_ETHER);

        let reserved = total_fee + buffer;
        if balance < reserved {
            return Err(PilotError::InsufficientRootKeyBalance {
                balance: balance.to_string(),
            });
        }
        let free_balance = balance - reserved;
        let addr_funding = free_balance / U256::from(addrs.max(1));

        let fmt_wei = |wei: U256| format!("{}/{}", wei, wei_to_ether(wei));
        info!(
            balance = %fmt_wei(balance),
            total_fee = %fmt_wei(total_fee),
            free = %fmt_wei(free_balance),
            per_key = %fmt_wei(addr_funding),
            "Splitting funds from the root key"
        );
        Ok(FundingDetails {
            root_balance: balance,
            total_fee,
            free_balance,
            addr_funding,
            network_transfer_fee,
        })
    }

    async fn fund_ephemeral_keys(&self) -> PilotResult<()> {
        let count = (self.addresses.len() - 1) as u64;
        let funding = self.calculate_subkey_funding(count).await?;
        warn!("Ephemeral mode, all funds moved to ephemeral keys will be lost on exit");

        let transfers = self.addresses[1..].iter().map(|addr| {
            let to = *addr;
            async move {
                self.transfer_from_key(0, to, funding.addr_funding)
                    .await
                    .map(|_| ())
            }
        });
        for result in join_all(transfers).await {
            result?;
        }
        Ok(())
    }

    fn key_address(&self, index: usize) -> PilotResult<Address> {
        self.addresses
            .get(index)
            .copied()
            .ok_or(PilotError::NoSuchKey(index))
    }
}

/// Pull hex revert bytes out of a JSON-RPC error response
fn extract_revert_bytes(error: &ethers::providers::ProviderError) -> Option<Vec<u8>> {
    let response = error.as_error_response()?;
    let data = response.data.as_ref()?;
    let hex_str = match data {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Object(obj) => obj.get("data")?.as_str()?.to_string(),
        _ => return None,
    };
    hex::decode(hex_str.trim_start_matches("0x")).ok()
}

/// Wei to a lossy ether float, for logs only
pub fn wei_to_ether(wei: U256) -> f64 {
    crate::gas::u256_to_f64(wei) / WEI_PER_ETHER as f64
}

/// Whole ether to wei
pub fn ether_to_wei(ether: u64) -> U256 {
    U256::from(ether) * U256::from(WEI_PER_ETHER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ether_conversions() {
        assert_eq!(ether_to_wei(2), U256::from(2u128 * WEI_PER_ETHER));
        assert!((wei_to_ether(ether_to_wei(3)) - 3.0).abs() < 1e-9);
        assert!((wei_to_ether(U256::from(WEI_PER_ETHER / 2)) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn selector_helper_matches_input_prefix() {
        // tie the decode invariant to the helper the decoder uses
        let input = [0xa9, 0x05, 0x9c, 0xbb, 0x00, 0x01];
        assert_eq!(
            crate::trace::decoder::selector_of(&input),
            Some([0xa9, 0x05, 0x9c, 0xbb])
        );
    }
}
