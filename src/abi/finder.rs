//! Selector-to-ABI resolution
//!
//! Given a callee address and a 4-byte selector, find the ABI and method
//! to decode with. The callee's mapped contract is preferred; when the
//! address is unknown (or its ABI lacks the selector) every stored ABI is
//! searched, and ambiguity is reported through `duplicate_count` rather
//! than hidden.

use crate::abi::store::function_by_selector;
use crate::abi::{ContractMap, ContractStore};
use crate::error::{PilotError, PilotResult};

use ethers::abi::{Abi, Function};
use ethers::types::Address;
use std::sync::Arc;
use tracing::trace;

/// Outcome of resolving a selector against the known contracts
#[derive(Debug, Clone)]
pub struct AbiFinderResult {
    pub contract_name: String,
    pub abi: Abi,
    pub function: Function,
    /// How many *other* stored ABIs also contain the selector. Non-zero
    /// means the resolution is best-effort.
    pub duplicate_count: usize,
}

/// Resolves 4-byte selectors via the contract map and ABI store
pub struct AbiFinder {
    store: Arc<ContractStore>,
    map: Arc<ContractMap>,
}

impl AbiFinder {
    pub fn new(store: Arc<ContractStore>, map: Arc<ContractMap>) -> Self {
        Self { store, map }
    }

    pub fn store(&self) -> &Arc<ContractStore> {
        &self.store
    }

    pub fn map(&self) -> &Arc<ContractMap> {
        &self.map
    }

    /// Find the ABI method behind `selector` for a call to `to`
    pub fn find_by_method(
        &self,
        to: Option<Address>,
        selector: [u8; 4],
    ) -> PilotResult<AbiFinderResult> {
        let duplicates = self.count_matching_abis(selector);

        if let Some(address) = to {
            if let Some(name) = self.map.name_of(address) {
                if let Some(abi) = self.store.get_abi(&name) {
                    if let Some(function) = function_by_selector(&abi, selector) {
                        trace!(contract = %name, selector = %hex::encode(selector), "Resolved selector via contract map");
                        return Ok(AbiFinderResult {
                            contract_name: name,
                            function: function.clone(),
                            duplicate_count: duplicates.saturating_sub(1),
                            abi,
                        });
                    }
                }
            }
        }

        // fall back to a global scan in deterministic name order
        for name in self.store.names() {
            let abi = match self.store.get_abi(&name) {
                Some(abi) => abi,
                None => continue,
            };
            if let Some(function) = function_by_selector(&abi, selector) {
                trace!(contract = %name, selector = %hex::encode(selector), "Resolved selector via global ABI scan");
                return Ok(AbiFinderResult {
                    contract_name: name,
                    function: function.clone(),
                    duplicate_count: duplicates.saturating_sub(1),
                    abi,
                });
            }
        }

        Err(PilotError::NoAbiMethod { selector })
    }

    fn count_matching_abis(&self, selector: [u8; 4]) -> usize {
        self.store
            .names()
            .iter()
            .filter_map(|name| self.store.get_abi(name))
            .filter(|abi| function_by_selector(abi, selector).is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::store::tests::{COUNTER_ABI, VAULT_ABI};

    fn setup() -> (AbiFinder, Address, [u8; 4]) {
        let store = Arc::new(ContractStore::new());
        store.add_abi_json("Counter", COUNTER_ABI).unwrap();
        store.add_abi_json("Vault", VAULT_ABI).unwrap();

        let counter_addr: Address = "0x00000000000000000000000000000000000000aa".parse().unwrap();
        let map = Arc::new(ContractMap::new());
        map.add(counter_addr, "Counter");

        let selector = store
            .get_abi("Counter")
            .unwrap()
            .function("increment")
            .unwrap()
            .short_signature();
        (AbiFinder::new(store, map), counter_addr, selector)
    }

    #[test]
    fn known_address_resolves_directly() {
        let (finder, counter_addr, selector) = setup();
        let result = finder.find_by_method(Some(counter_addr), selector).unwrap();
        assert_eq!(result.contract_name, "Counter");
        assert_eq!(result.function.name, "increment");
        // Vault also has increment(uint256)
        assert_eq!(result.duplicate_count, 1);
    }

    #[test]
    fn unknown_address_falls_back_to_global_scan() {
        let (finder, _, selector) = setup();
        let stranger: Address = "0x00000000000000000000000000000000000000ff".parse().unwrap();
        let result = finder.find_by_method(Some(stranger), selector).unwrap();
        assert_eq!(result.contract_name, "Counter");
        assert_eq!(result.duplicate_count, 1);
    }

    #[test]
    fn unambiguous_selector_has_no_duplicates() {
        let (finder, _, _) = setup();
        let owner_selector = finder
            .store()
            .get_abi("Counter")
            .unwrap()
            .function("owner")
            .unwrap()
            .short_signature();
        let result = finder.find_by_method(None, owner_selector).unwrap();
        assert_eq!(result.duplicate_count, 0);
        assert_eq!(result.contract_name, "Counter");
    }

    #[test]
    fn unknown_selector_errors() {
        let (finder, _, _) = setup();
        let err = finder.find_by_method(None, [0xde, 0xad, 0xbe, 0xef]).unwrap_err();
        assert!(matches!(err, PilotError::NoAbiMethod { .. }));
    }
}
