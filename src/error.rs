//! Error types for txpilot

use ethers::types::{Address, H256};
use thiserror::Error;

/// Main error type for the client library
#[derive(Error, Debug)]
pub enum PilotError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("RPC unreachable: {0}")]
    RpcUnreachable(String),

    #[error("RPC error: {0}")]
    Rpc(#[from] ethers::providers::ProviderError),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Nonce sync failed for {address:?}: {message}")]
    NonceSync { address: Address, message: String },

    #[error("Transaction rejected: {0}")]
    TxRejected(String),

    #[error("retry timeout")]
    RetryTimeout,

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("unsupported tx type {tx_type}")]
    BumpUnsupportedType { tx_type: u64 },

    #[error("sender {0:?} not found in loaded keys, cannot re-sign for gas bump")]
    BumpUnknownSender(Address),

    #[error("no ABI method found for selector 0x{}", hex::encode(selector))]
    NoAbiMethod { selector: [u8; 4] },

    #[error("no ABI found in contract store for {0}")]
    NoAbiFound(String),

    #[error("Failed to decode transaction input: {0}")]
    DecodeInput(String),

    #[error("Failed to decode transaction output: {0}")]
    DecodeOutput(String),

    #[error("Failed to decode log: {0}")]
    DecodeLog(String),

    #[error("error type: {name}, error values: [{}]", values.join(" "))]
    Reverted { name: String, values: Vec<String> },

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    #[error("insufficient data for congestion calculation: wanted at least {wanted} headers, got {got}")]
    CongestionDataInsufficient { wanted: usize, got: usize },

    #[error("Health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("address {0:?} has pending transactions and pending nonce protection is enabled")]
    PendingTxProtection(Address),

    #[error("insufficient root key balance: {balance}")]
    InsufficientRootKeyBalance { balance: String },

    #[error("Transaction {0:?} not found")]
    TxNotFound(H256),

    #[error("no trace found for {0:?}")]
    NoTrace(H256),

    #[error("Key {0} is not loaded")]
    NoSuchKey(usize),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PilotError {
    /// Check if the error is worth retrying at the transport level
    pub fn is_retryable(&self) -> bool {
        match self {
            PilotError::RpcUnreachable(_) | PilotError::Timeout { .. } => true,
            PilotError::Rpc(e) => {
                let msg = e.to_string().to_lowercase();
                msg.contains("connection refused") || msg.contains("connection reset")
            }
            _ => false,
        }
    }

    /// Check if the error is a node-side connection refusal
    pub fn is_connection_refused(&self) -> bool {
        self.to_string().to_lowercase().contains("connection refused")
    }
}

/// Result type for client operations
pub type PilotResult<T> = Result<T, PilotError>;
