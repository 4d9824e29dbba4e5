//! In-memory store of contract ABIs and deployment bytecode
//!
//! The store is populated by the embedding application (typically from an
//! ABI directory, one entry per file stem) and mutated after deployments.
//! Reads dominate; `DashMap` keeps the hot decode path lock-cheap.

use crate::error::{PilotError, PilotResult};

use dashmap::DashMap;
use ethers::abi::{Abi, Function};
use ethers::types::Bytes;
use tracing::debug;

/// `name → ABI` (+ optional bytecode) registry
#[derive(Default)]
pub struct ContractStore {
    abis: DashMap<String, Abi>,
    bytecodes: DashMap<String, Bytes>,
}

impl ContractStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an ABI under a contract name. A trailing `.abi` file
    /// suffix is stripped so names match the contract map.
    pub fn add_abi(&self, name: &str, abi: Abi) {
        let name = name.trim_end_matches(".abi");
        debug!(contract = name, "Registered ABI");
        self.abis.insert(name.to_string(), abi);
    }

    /// Parse and register an ABI from its JSON representation
    pub fn add_abi_json(&self, name: &str, json: &str) -> PilotResult<()> {
        let abi: Abi = serde_json::from_str(json)
            .map_err(|e| PilotError::Config(format!("invalid ABI JSON for {name}: {e}")))?;
        self.add_abi(name, abi);
        Ok(())
    }

    pub fn add_bytecode(&self, name: &str, bytecode: Bytes) {
        let name = name.trim_end_matches(".bin");
        self.bytecodes.insert(name.to_string(), bytecode);
    }

    pub fn get_abi(&self, name: &str) -> Option<Abi> {
        self.abis.get(name.trim_end_matches(".abi")).map(|a| a.clone())
    }

    pub fn get_bytecode(&self, name: &str) -> Option<Bytes> {
        self.bytecodes
            .get(name.trim_end_matches(".bin"))
            .map(|b| b.clone())
    }

    pub fn has_abi(&self, name: &str) -> bool {
        self.abis.contains_key(name.trim_end_matches(".abi"))
    }

    /// Registered contract names, sorted for deterministic iteration
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.abis.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.abis.len()
    }

    pub fn is_empty(&self) -> bool {
        self.abis.is_empty()
    }
}

/// Find a function in an ABI by its 4-byte selector
pub fn function_by_selector(abi: &Abi, selector: [u8; 4]) -> Option<&Function> {
    abi.functions().find(|f| f.short_signature() == selector)
}

/// Canonical method signature, e.g. `transfer(address,uint256)`
pub fn function_signature(function: &Function) -> String {
    let params: Vec<String> = function.inputs.iter().map(|p| p.kind.to_string()).collect();
    format!("{}({})", function.name, params.join(","))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const COUNTER_ABI: &str = r#"[
        {"type":"function","name":"increment","inputs":[{"name":"by","type":"uint256"}],"outputs":[{"name":"","type":"uint256"}],"stateMutability":"nonpayable"},
        {"type":"function","name":"owner","inputs":[],"outputs":[{"name":"","type":"address"}],"stateMutability":"view"},
        {"type":"event","name":"Incremented","inputs":[{"name":"by","type":"uint256","indexed":false},{"name":"total","type":"uint256","indexed":true}],"anonymous":false},
        {"type":"error","name":"TooBig","inputs":[{"name":"given","type":"uint256"},{"name":"max","type":"uint256"}]}
    ]"#;

    pub(crate) const VAULT_ABI: &str = r#"[
        {"type":"function","name":"increment","inputs":[{"name":"by","type":"uint256"}],"outputs":[{"name":"","type":"uint256"}],"stateMutability":"nonpayable"},
        {"type":"function","name":"deposit","inputs":[],"outputs":[],"stateMutability":"payable"}
    ]"#;

    #[test]
    fn add_and_get_with_suffix_stripping() {
        let store = ContractStore::new();
        store.add_abi_json("Counter.abi", COUNTER_ABI).unwrap();
        assert!(store.has_abi("Counter"));
        assert!(store.has_abi("Counter.abi"));
        assert!(store.get_abi("Counter").is_some());
        assert_eq!(store.names(), vec!["Counter".to_string()]);
    }

    #[test]
    fn invalid_json_is_rejected() {
        let store = ContractStore::new();
        assert!(store.add_abi_json("Broken", "not json").is_err());
    }

    #[test]
    fn selector_lookup() {
        let store = ContractStore::new();
        store.add_abi_json("Counter", COUNTER_ABI).unwrap();
        let abi = store.get_abi("Counter").unwrap();
        let inc = abi.function("increment").unwrap();
        let found = function_by_selector(&abi, inc.short_signature()).unwrap();
        assert_eq!(found.name, "increment");
        assert_eq!(function_signature(found), "increment(uint256)");
        assert!(function_by_selector(&abi, [0xde, 0xad, 0xbe, 0xef]).is_none());
    }
}
