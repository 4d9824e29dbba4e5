//! Address-to-name map of deployed contracts
//!
//! Written by `deploy_contract`, read by the decoder and tracer. The map
//! tolerates name collisions: one name may cover several addresses, and a
//! reverse lookup returns any of them. Optionally persisted as a TOML file
//! of `"0x<addr>" = "<ContractName>"` lines on live networks.

use crate::error::{PilotError, PilotResult};

use ethers::types::Address;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::Path;
use std::sync::RwLock;
use tracing::debug;

/// Shared map between deployed addresses and contract names
#[derive(Default)]
pub struct ContractMap {
    inner: RwLock<HashMap<Address, String>>,
}

impl ContractMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: HashMap<Address, String>) -> Self {
        Self {
            inner: RwLock::new(entries),
        }
    }

    pub fn is_known(&self, address: Address) -> bool {
        self.inner.read().unwrap().contains_key(&address)
    }

    pub fn name_of(&self, address: Address) -> Option<String> {
        self.inner.read().unwrap().get(&address).cloned()
    }

    /// Reverse lookup. On name collisions any matching address may be
    /// returned; callers must not rely on which one.
    pub fn address_of(&self, name: &str) -> Option<Address> {
        self.inner
            .read()
            .unwrap()
            .iter()
            .find(|(_, n)| n.as_str() == name)
            .map(|(addr, _)| *addr)
    }

    pub fn add(&self, address: Address, name: &str) {
        let name = name.trim_end_matches(".abi");
        debug!(address = ?address, contract = name, "Recorded deployed contract");
        self.inner.write().unwrap().insert(address, name.to_string());
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().is_empty()
    }

    pub fn entries(&self) -> HashMap<Address, String> {
        self.inner.read().unwrap().clone()
    }

    /// Load a map file. A missing file yields an empty map; a malformed
    /// one is an error.
    pub fn load(path: &Path) -> PilotResult<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => {
                return Err(PilotError::Config(format!(
                    "failed to read contract map {path:?}: {e}"
                )))
            }
        };
        let parsed: HashMap<String, String> = toml::from_str(&raw).map_err(|e| {
            PilotError::Config(format!("failed to parse contract map {path:?}: {e}"))
        })?;

        let mut entries = HashMap::with_capacity(parsed.len());
        for (addr, name) in parsed {
            let addr: Address = addr.parse().map_err(|e| {
                PilotError::Config(format!("invalid address {addr:?} in contract map: {e}"))
            })?;
            entries.insert(addr, name);
        }
        Ok(Self::from_entries(entries))
    }

    /// Append a single deployment to the map file
    pub fn save_entry(path: &Path, address: Address, name: &str) -> PilotResult<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| PilotError::Config(format!("failed to open contract map {path:?}: {e}")))?;
        writeln!(file, "\"{address:#x}\" = \"{name}\"")
            .map_err(|e| PilotError::Config(format!("failed to write contract map {path:?}: {e}")))
    }

    /// Write the whole map, one entry per line
    pub fn save(&self, path: &Path) -> PilotResult<()> {
        let entries = self.entries();
        let mut lines: Vec<String> = entries
            .iter()
            .map(|(addr, name)| format!("\"{addr:#x}\" = \"{name}\""))
            .collect();
        lines.sort();
        std::fs::write(path, lines.join("\n") + "\n")
            .map_err(|e| PilotError::Config(format!("failed to write contract map {path:?}: {e}")))
    }
}
