//! Multi-key nonce coordination
//!
//! Each managed address gets an atomic counter; allocation is lock-free on
//! the hot path and never talks to the node. Reconciliation
//! (`update_nonces`) queries the node's pending count per key under the
//! configured rate limit and retry budget, and only ever moves a local
//! counter forward.

use crate::chain::RpcTransport;
use crate::config::NonceManagerConfig;
use crate::error::{PilotError, PilotResult};

use dashmap::DashMap;
use ethers::types::Address;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Per-address sequential nonce allocation with remote reconciliation
pub struct NonceManager {
    cfg: NonceManagerConfig,
    transport: Arc<RpcTransport>,
    addresses: Vec<Address>,
    counters: DashMap<Address, AtomicU64>,
    synced: DashMap<Address, AtomicBool>,
}

impl NonceManager {
    pub fn new(
        cfg: NonceManagerConfig,
        transport: Arc<RpcTransport>,
        addresses: Vec<Address>,
    ) -> Self {
        let counters = DashMap::new();
        let synced = DashMap::new();
        for addr in &addresses {
            counters.insert(*addr, AtomicU64::new(0));
            synced.insert(*addr, AtomicBool::new(false));
        }
        Self {
            cfg,
            transport,
            addresses,
            counters,
            synced,
        }
    }

    /// Allocate the next nonce for `addr`. Atomic, never blocks on I/O;
    /// k calls yield k distinct, strictly increasing values.
    pub fn next_nonce(&self, addr: Address) -> u64 {
        if let Some(counter) = self.counters.get(&addr) {
            return counter.fetch_add(1, Ordering::SeqCst);
        }
        self.counters
            .entry(addr)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::SeqCst)
    }

    /// Peek at the next nonce without consuming it
    pub fn current(&self, addr: Address) -> u64 {
        self.counters
            .get(&addr)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Reconcile every managed address against the node's pending count.
    ///
    /// Each address is queried under the configured per-address rate limit
    /// with `key_sync_retries` attempts and a fixed delay between them; the
    /// whole pass is bounded by `key_sync_timeout`. A key that exhausts its
    /// retries fails the operation and is named in the error. Previously
    /// issued nonces stay valid either way.
    pub async fn update_nonces(&self) -> PilotResult<()> {
        let deadline = self.cfg.key_sync_timeout.inner();
        let addresses = self.addresses.clone();
        tokio::time::timeout(deadline, async {
            for addr in addresses {
                self.sync_key(addr).await?;
            }
            Ok(())
        })
        .await
        .map_err(|_| PilotError::Timeout {
            operation: "nonce reconciliation".to_string(),
        })?
    }

    /// Index of any address whose last reconciliation succeeded
    pub fn any_synced_key(&self) -> Option<usize> {
        self.addresses.iter().position(|addr| {
            self.synced
                .get(addr)
                .map(|s| s.load(Ordering::SeqCst))
                .unwrap_or(false)
        })
    }

    async fn sync_key(&self, addr: Address) -> PilotResult<()> {
        let rate = self.cfg.key_sync_rate_limit_per_sec.max(1);
        let min_interval = Duration::from_secs_f64(1.0 / rate as f64);
        let mut last_err = String::new();

        for attempt in 0..self.cfg.key_sync_retries.max(1) {
            if attempt > 0 {
                tokio::time::sleep(self.cfg.key_sync_retry_delay.inner()).await;
            }
            tokio::time::sleep(min_interval).await;

            match self.transport.pending_nonce_at(addr).await {
                Ok(remote) => {
                    let updated = self.apply_remote(addr, remote);
                    if let Some(synced) = self.synced.get(&addr) {
                        synced.store(true, Ordering::SeqCst);
                    }
                    debug!(address = ?addr, remote, updated, "Reconciled nonce");
                    return Ok(());
                }
                Err(e) => {
                    warn!(address = ?addr, attempt, error = %e, "Nonce sync attempt failed");
                    last_err = e.to_string();
                }
            }
        }

        if let Some(synced) = self.synced.get(&addr) {
            synced.store(false, Ordering::SeqCst);
        }
        Err(PilotError::NonceSync {
            address: addr,
            message: last_err,
        })
    }

    /// Move the local counter up to the remote pending count; never down.
    /// Returns whether the counter changed.
    fn apply_remote(&self, addr: Address, remote: u64) -> bool {
        let counter = self.counters.entry(addr).or_insert_with(|| AtomicU64::new(0));
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |local| {
                (remote > local).then_some(remote)
            })
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn manager() -> NonceManager {
        let mut cfg = Config {
            abi_dir: None,
            bin_dir: None,
            contract_map_file: None,
            save_deployed_contracts_map: false,
            tracing_level: Default::default(),
            trace_to_json: false,
            pending_nonce_protection_enabled: false,
            check_rpc_health_on_start: false,
            ephemeral_addresses_number: None,
            root_key_funds_buffer: 0,
            gas_bump_retries: 0,
            experiments_enabled: vec![],
            nonce_manager: Default::default(),
            networks: vec![],
            network: Default::default(),
            keyfile_source: Default::default(),
            rpc_headers: vec![],
        };
        cfg.network.chain_id = 1;
        cfg.network.urls_secret = vec!["http://localhost:8545".to_string()];
        let transport = Arc::new(RpcTransport::connect(&cfg).unwrap());
        NonceManager::new(
            cfg.nonce_manager.clone(),
            transport,
            vec![addr(1), addr(2)],
        )
    }

    fn addr(last: u8) -> Address {
        let mut bytes = [0u8; 20];
        bytes[19] = last;
        Address::from(bytes)
    }

    #[test]
    fn nonces_are_strictly_increasing() {
        let nm = manager();
        let issued: Vec<u64> = (0..100).map(|_| nm.next_nonce(addr(1))).collect();
        for pair in issued.windows(2) {
            assert!(pair[1] > pair[0]);
        }
        assert_eq!(issued[0], 0);
        assert_eq!(issued[99], 99);
    }

    #[test]
    fn keys_have_independent_sequences() {
        let nm = manager();
        assert_eq!(nm.next_nonce(addr(1)), 0);
        assert_eq!(nm.next_nonce(addr(1)), 1);
        assert_eq!(nm.next_nonce(addr(2)), 0);
    }

    #[test]
    fn concurrent_allocation_yields_distinct_nonces() {
        let nm = Arc::new(manager());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let nm = nm.clone();
            handles.push(std::thread::spawn(move || {
                (0..250).map(|_| nm.next_nonce(addr(1))).collect::<Vec<u64>>()
            }));
        }
        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 8 * 250, "every allocation must be distinct");
    }

    #[test]
    fn reconciliation_only_moves_forward() {
        let nm = manager();
        for _ in 0..10 {
            nm.next_nonce(addr(1));
        }
        // remote behind local: no change
        assert!(!nm.apply_remote(addr(1), 4));
        assert_eq!(nm.current(addr(1)), 10);
        // remote ahead: local jumps to it
        assert!(nm.apply_remote(addr(1), 25));
        assert_eq!(nm.current(addr(1)), 25);
        assert_eq!(nm.next_nonce(addr(1)), 25);
    }

    #[test]
    fn unsynced_manager_reports_no_synced_key() {
        let nm = manager();
        assert_eq!(nm.any_synced_key(), None);
    }
}
