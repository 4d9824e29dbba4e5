//! Transaction decoding and call-tree tracing

pub mod decoder;
pub mod tracer;

pub use tracer::Tracer;

use ethers::types::{Transaction, TransactionReceipt, TxHash, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const UNKNOWN: &str = "unknown";
pub const YOU: &str = "you";
pub const FAILED_TO_DECODE: &str = "failed to decode";
pub const NO_DATA: &str = "no data";

pub const COMMENT_MISSING_ABI: &str = "Call not decoded due to missing ABI instance";
pub const COMMENT_MISSING_CALL_TRACE: &str =
    "This call was missing from call trace, but its signature was present in 4bytes trace. \
     Most data is missing; call order remains unknown";

/// One decoded event from a call frame or receipt
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecodedLog {
    /// Canonical event signature, e.g. `Transfer(address,address,uint256)`
    pub signature: String,
    pub address: String,
    pub topics: Vec<String>,
    /// Parameter name → decoded value; unnamed parameters get numeric keys
    pub data: BTreeMap<String, serde_json::Value>,
}

/// One decoded call frame. The root frame is the externally-owned-account
/// call; children are internal calls discovered by the tracer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecodedCall {
    pub from_address: String,
    pub to_address: String,
    /// Contract name, `"you"` for the library's own keys, or `"unknown"`
    pub from_name: String,
    pub to_name: String,
    /// Hex 4-byte selector
    pub selector: String,
    /// Canonical method signature, e.g. `transfer(address,uint256)`
    pub method: String,
    pub inputs: BTreeMap<String, serde_json::Value>,
    pub outputs: BTreeMap<String, serde_json::Value>,
    pub events: Vec<DecodedLog>,
    pub value: U256,
    pub gas_limit: u64,
    pub gas_used: u64,
    /// Warnings: missing ABI, duplicated selector, missing frame
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,
}

/// Result of decoding one transaction end to end
#[derive(Debug, Clone)]
pub struct DecodedTransaction {
    pub hash: TxHash,
    pub receipt: TransactionReceipt,
    pub raw_tx: Transaction,
    pub top_level: DecodedCall,
    /// All frames, root first, when the tracing pipeline ran
    pub all_frames: Vec<DecodedCall>,
}
