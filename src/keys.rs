//! Signing key management
//!
//! Keys come from three places: the network config (index 0 is the root
//! key), an optional key-file (on disk or base64-encoded in an env var),
//! or ephemeral generation at startup. Ephemeral mode and key-file mode
//! are mutually exclusive; config validation enforces that.

use crate::config::{Config, KeyfileSource};
use crate::error::{PilotError, PilotResult};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// On-disk key-file format
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyFile {
    pub keys: Vec<KeyData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyData {
    pub private_key: String,
    pub address: String,
    #[serde(default)]
    pub funds: String,
}

impl KeyFile {
    pub fn load(path: &Path) -> PilotResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| PilotError::Config(format!("failed to read key file {path:?}: {e}")))?;
        let kf: KeyFile = toml::from_str(&raw)
            .map_err(|e| PilotError::Config(format!("failed to parse key file {path:?}: {e}")))?;
        if kf.keys.is_empty() {
            return Err(PilotError::Config("keyfile is empty".to_string()));
        }
        Ok(kf)
    }

    pub fn from_base64(blob: &str) -> PilotResult<Self> {
        let raw = BASE64
            .decode(blob.trim())
            .map_err(|e| PilotError::Config(format!("failed to decode base64 key file: {e}")))?;
        let raw = String::from_utf8(raw)
            .map_err(|e| PilotError::Config(format!("key file is not valid UTF-8: {e}")))?;
        let kf: KeyFile = toml::from_str(&raw)
            .map_err(|e| PilotError::Config(format!("failed to parse key file: {e}")))?;
        if kf.keys.is_empty() {
            return Err(PilotError::Config("keyfile is empty".to_string()));
        }
        Ok(kf)
    }

    pub fn save(&self, path: &Path) -> PilotResult<()> {
        let raw = toml::to_string_pretty(self)
            .map_err(|e| PilotError::Internal(format!("failed to serialize key file: {e}")))?;
        std::fs::write(path, raw)
            .map_err(|e| PilotError::Config(format!("failed to write key file {path:?}: {e}")))
    }
}

/// Parse a hex private key into a wallet bound to the network chain id
pub fn wallet_from_hex(key: &str, chain_id: u64) -> PilotResult<LocalWallet> {
    let wallet: LocalWallet = key
        .trim_start_matches("0x")
        .parse()
        .map_err(|e| PilotError::Wallet(format!("invalid private key: {e}")))?;
    Ok(wallet.with_chain_id(chain_id))
}

/// Generate `n` throwaway wallets. Never persisted; funds moved to them
/// are lost when the process exits.
pub fn ephemeral_wallets(n: u64, chain_id: u64) -> Vec<LocalWallet> {
    let mut rng = rand::thread_rng();
    (0..n)
        .map(|_| LocalWallet::new(&mut rng).with_chain_id(chain_id))
        .collect()
}

/// Resolve the full ordered key set for a config: network keys first (root
/// key at index 0), then key-file keys or freshly generated ephemeral keys.
pub fn resolve_wallets(cfg: &Config) -> PilotResult<Vec<LocalWallet>> {
    let chain_id = cfg.network.chain_id;
    let mut wallets = Vec::new();

    for key in &cfg.network.private_keys_secret {
        wallets.push(wallet_from_hex(key, chain_id)?);
    }

    match &cfg.keyfile_source {
        KeyfileSource::File(path) => {
            let kf = KeyFile::load(path)?;
            info!(keys = kf.keys.len(), path = ?path, "Loaded key file");
            for entry in &kf.keys {
                wallets.push(wallet_from_hex(&entry.private_key, chain_id)?);
            }
        }
        KeyfileSource::Base64Env(blob) => {
            let kf = KeyFile::from_base64(blob)?;
            info!(keys = kf.keys.len(), "Loaded key file from base64 env");
            for entry in &kf.keys {
                wallets.push(wallet_from_hex(&entry.private_key, chain_id)?);
            }
        }
        KeyfileSource::Disabled => {
            let ephemeral = cfg.ephemeral_addresses_number.unwrap_or(0);
            if ephemeral > 0 {
                warn!(count = ephemeral, "Ephemeral mode, all funds moved to these keys will be lost");
                wallets.extend(ephemeral_wallets(ephemeral, chain_id));
            }
        }
    }

    if wallets.is_empty() {
        return Err(PilotError::Config(
            "no private keys loaded; set the root key or enable ephemeral addresses".to_string(),
        ));
    }
    Ok(wallets)
}

/// Addresses of the given wallets, in key order
pub fn addresses_of(wallets: &[LocalWallet]) -> Vec<Address> {
    wallets.iter().map(|w| w.address()).collect()
}
