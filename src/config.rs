//! Configuration management
//!
//! Loads configuration from TOML files with environment variable substitution,
//! binds the env-provided secrets (root key, key-file, RPC headers) and
//! validates the result before the client is allowed to construct.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::env;
use std::path::PathBuf;
use std::time::Duration as StdDuration;

pub const ENV_CONFIG_PATH: &str = "TXPILOT_CONFIG";
pub const ENV_NETWORK: &str = "NETWORK";
pub const ENV_ROOT_PRIVATE_KEY: &str = "TXPILOT_ROOT_PRIVATE_KEY";
pub const ENV_KEYFILE_PATH: &str = "TXPILOT_KEYFILE_PATH";
pub const ENV_KEYFILE_BASE64: &str = "TXPILOT_KEYFILE_BASE64";
pub const ENV_RPC_HEADERS: &str = "TXPILOT_RPC_HEADERS";
pub const ENV_URL_OVERRIDE: &str = "TXPILOT_URL";

/// Networks with these names are treated as simulated: the contract map is
/// never persisted for them and ephemeral keys are expected.
const SIMULATED_NETWORKS: [&str; 2] = ["geth", "anvil"];

pub const EXPERIMENT_SLOW_FUNDS_RETURN: &str = "slow_funds_return";
pub const EXPERIMENT_FEE_EQUALIZER: &str = "eip_1559_fee_equalizer";

/// A non-negative duration deserialized from humantime strings ("30s", "1m").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Duration(pub StdDuration);

impl Duration {
    pub fn new(d: StdDuration) -> Self {
        Self(d)
    }

    pub fn inner(&self) -> StdDuration {
        self.0
    }
}

impl<'de> Deserialize<'de> for Duration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw)
            .map(Duration)
            .map_err(serde::de::Error::custom)
    }
}

impl Serialize for Duration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(self.0).to_string())
    }
}

/// Transaction priority: selects historical fee percentile, adjustment
/// factor and the default gas bump strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TxPriority {
    Slow,
    #[default]
    Standard,
    Fast,
    #[serde(alias = "ultra")]
    Degen,
}

/// When the tracing pipeline runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TracingLevel {
    #[default]
    None,
    Reverted,
    All,
}

/// Which congestion metric to compute from recent headers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CongestionStrategy {
    Simple,
    #[default]
    NewestFirst,
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub abi_dir: Option<PathBuf>,
    pub bin_dir: Option<PathBuf>,
    pub contract_map_file: Option<String>,
    #[serde(default)]
    pub save_deployed_contracts_map: bool,
    #[serde(default)]
    pub tracing_level: TracingLevel,
    #[serde(default)]
    pub trace_to_json: bool,
    #[serde(default)]
    pub pending_nonce_protection_enabled: bool,
    #[serde(default)]
    pub check_rpc_health_on_start: bool,
    pub ephemeral_addresses_number: Option<u64>,
    /// Ether kept on the root key when splitting funds to ephemeral keys
    #[serde(default)]
    pub root_key_funds_buffer: u64,
    #[serde(default)]
    pub gas_bump_retries: u32,
    #[serde(default)]
    pub experiments_enabled: Vec<String>,
    #[serde(default)]
    pub nonce_manager: NonceManagerConfig,
    pub networks: Vec<NetworkConfig>,

    // bound from env, not the TOML file
    #[serde(skip)]
    pub network: NetworkConfig,
    #[serde(skip)]
    pub keyfile_source: KeyfileSource,
    #[serde(skip)]
    pub rpc_headers: Vec<(String, String)>,
}

/// Budgets for nonce reconciliation against the remote node
#[derive(Debug, Clone, Deserialize)]
pub struct NonceManagerConfig {
    #[serde(default = "default_rate_limit")]
    pub key_sync_rate_limit_per_sec: u32,
    #[serde(default = "default_sync_timeout")]
    pub key_sync_timeout: Duration,
    #[serde(default = "default_sync_retries")]
    pub key_sync_retries: u32,
    #[serde(default = "default_sync_retry_delay")]
    pub key_sync_retry_delay: Duration,
}

fn default_rate_limit() -> u32 {
    10
}
fn default_sync_timeout() -> Duration {
    Duration(StdDuration::from_secs(30))
}
fn default_sync_retries() -> u32 {
    3
}
fn default_sync_retry_delay() -> Duration {
    Duration(StdDuration::from_secs(1))
}

impl Default for NonceManagerConfig {
    fn default() -> Self {
        Self {
            key_sync_rate_limit_per_sec: default_rate_limit(),
            key_sync_timeout: default_sync_timeout(),
            key_sync_retries: default_sync_retries(),
            key_sync_retry_delay: default_sync_retry_delay(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    pub chain_id: u64,
    pub urls_secret: Vec<String>,
    #[serde(default)]
    pub eip_1559_dynamic_fees: bool,
    /// Fallback legacy gas price in wei; 0 means "ask the node"
    #[serde(default)]
    pub gas_price: u64,
    #[serde(default)]
    pub gas_fee_cap: u64,
    #[serde(default)]
    pub gas_tip_cap: u64,
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
    #[serde(default = "default_transfer_gas_fee")]
    pub transfer_gas_fee: u64,
    #[serde(default = "default_txn_timeout")]
    pub transaction_timeout: Duration,
    #[serde(default)]
    pub dial_timeout: Option<Duration>,
    #[serde(default)]
    pub private_keys_secret: Vec<String>,
    #[serde(default)]
    pub gas_price_estimation_enabled: bool,
    #[serde(default = "default_estimation_blocks")]
    pub gas_price_estimation_blocks: u64,
    #[serde(default)]
    pub gas_price_estimation_tx_priority: TxPriority,
    #[serde(default)]
    pub gas_price_estimation_congestion_strategy: CongestionStrategy,
    /// Absolute per-transaction cost ceiling used to cap estimated fees
    #[serde(default = "default_max_tx_cost_wei")]
    pub gas_estimation_max_tx_cost_wei: u128,
}

fn default_gas_limit() -> u64 {
    8_000_000
}
fn default_transfer_gas_fee() -> u64 {
    21_000
}
fn default_txn_timeout() -> Duration {
    Duration(StdDuration::from_secs(30))
}
fn default_estimation_blocks() -> u64 {
    50
}
fn default_max_tx_cost_wei() -> u128 {
    1_000_000_000_000_000_000
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            chain_id: 0,
            urls_secret: Vec::new(),
            eip_1559_dynamic_fees: false,
            gas_price: 0,
            gas_fee_cap: 0,
            gas_tip_cap: 0,
            gas_limit: default_gas_limit(),
            transfer_gas_fee: default_transfer_gas_fee(),
            transaction_timeout: default_txn_timeout(),
            dial_timeout: None,
            private_keys_secret: Vec::new(),
            gas_price_estimation_enabled: false,
            gas_price_estimation_blocks: default_estimation_blocks(),
            gas_price_estimation_tx_priority: TxPriority::Standard,
            gas_price_estimation_congestion_strategy: CongestionStrategy::NewestFirst,
            gas_estimation_max_tx_cost_wei: default_max_tx_cost_wei(),
        }
    }
}

/// Where the key-file comes from. Exactly one of ephemeral mode or a
/// non-disabled key-file source may be active.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum KeyfileSource {
    #[default]
    Disabled,
    File(PathBuf),
    Base64Env(String),
}

impl Config {
    /// Load configuration from the path in `TXPILOT_CONFIG`, select the
    /// network named by `NETWORK` and bind env-provided secrets.
    pub fn from_env() -> Result<Self> {
        let config_path = env::var(ENV_CONFIG_PATH)
            .map(PathBuf::from)
            .with_context(|| format!("config path is empty, set {ENV_CONFIG_PATH}"))?;

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {config_path:?}"))?;
        let config_str = substitute_env_vars(&config_str);

        let mut cfg: Config =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        let network_name =
            env::var(ENV_NETWORK).with_context(|| format!("no network selected, set {ENV_NETWORK}"))?;
        cfg.select_network(&network_name)?;

        if let Ok(url) = env::var(ENV_URL_OVERRIDE) {
            cfg.network.urls_secret = vec![url];
        }
        if let Ok(root_key) = env::var(ENV_ROOT_PRIVATE_KEY) {
            // root key goes first so index 0 stays the funder
            cfg.network.private_keys_secret.insert(0, root_key);
        }

        cfg.keyfile_source = match (env::var(ENV_KEYFILE_PATH), env::var(ENV_KEYFILE_BASE64)) {
            (Ok(_), Ok(_)) => {
                bail!("{ENV_KEYFILE_PATH} and {ENV_KEYFILE_BASE64} are mutually exclusive")
            }
            (Ok(path), _) => KeyfileSource::File(PathBuf::from(path)),
            (_, Ok(blob)) => KeyfileSource::Base64Env(blob),
            _ => KeyfileSource::Disabled,
        };

        if let Ok(raw) = env::var(ENV_RPC_HEADERS) {
            cfg.rpc_headers = parse_rpc_headers(&raw)?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Pick the active network out of `networks` by name
    pub fn select_network(&mut self, name: &str) -> Result<()> {
        let network = self
            .networks
            .iter()
            .find(|n| n.name == name)
            .cloned()
            .with_context(|| format!("network {name} not found in configuration"))?;
        self.network = network;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.network.urls_secret.is_empty() {
            bail!("network {} has no RPC URLs configured", self.network.name);
        }
        if self.network.chain_id == 0 {
            bail!("network {} has no chain id configured", self.network.name);
        }

        let ephemeral = self.ephemeral_addresses_number.unwrap_or(0) > 0;
        if ephemeral && self.keyfile_source != KeyfileSource::Disabled {
            bail!(
                "ephemeral addresses and a key-file source are both active; \
                 disable one of them, the two modes are mutually exclusive"
            );
        }
        Ok(())
    }

    pub fn is_simulated_network(&self) -> bool {
        let name = self.network.name.to_lowercase();
        SIMULATED_NETWORKS.contains(&name.as_str())
    }

    pub fn is_experiment_enabled(&self, experiment: &str) -> bool {
        self.experiments_enabled.iter().any(|e| e == experiment)
    }

    /// Contract map persistence is for live networks only
    pub fn should_save_contract_map(&self) -> bool {
        !self.is_simulated_network() && self.save_deployed_contracts_map
    }

    /// Generate a file name for the contract map when none was configured
    pub fn generate_contract_map_file_name(&self) -> String {
        let now = chrono::Utc::now().format("%Y-%m-%d-%H-%M-%S");
        format!(
            "deployed_contracts_{}_{}.toml",
            self.network.name.to_lowercase(),
            now
        )
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

/// Parse a `"K1=V1,K2=V2"` header string. A malformed entry (missing `=`,
/// empty key or value, more than one `=`) fails validation.
pub fn parse_rpc_headers(raw: &str) -> Result<Vec<(String, String)>> {
    let mut headers = Vec::new();
    for entry in raw.split(',') {
        let parts: Vec<&str> = entry.split('=').collect();
        if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
            bail!("malformed RPC header entry: {entry:?}, expected K=V");
        }
        headers.push((parts[0].to_string(), parts[1].to_string()));
    }
    Ok(headers)
}
