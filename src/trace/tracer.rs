//! `debug_traceTransaction` plumbing and the call-tree walk
//!
//! Two tracers are combined: the 4byte tracer gives selector/argument-size
//! call counts, the call tracer (with logs) gives the nested frame tree.
//! Frames are decoded via the ABI finder; selectors the 4byte tracer saw
//! but the call tree lacks are synthesised as placeholder frames so the
//! caller still learns they happened.

use crate::abi::AbiFinder;
use crate::chain::RpcTransport;
use crate::error::{PilotError, PilotResult};
use crate::trace::decoder::{decode_call, selector_of};
use crate::trace::{
    DecodedCall, DecodedLog, COMMENT_MISSING_CALL_TRACE, FAILED_TO_DECODE, NO_DATA, UNKNOWN,
};

use dashmap::DashMap;
use ethers::types::{Address, Bytes, TxHash, H256, U256};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

const TRACES_DIR: &str = "traces";

/// One log entry inside a call-tracer frame
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTraceLog {
    #[serde(default)]
    pub address: Address,
    #[serde(default)]
    pub topics: Vec<H256>,
    #[serde(default)]
    pub data: Bytes,
}

/// One node of the call-tracer tree
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCall {
    pub from: Option<Address>,
    pub to: Option<Address>,
    #[serde(default)]
    pub input: Bytes,
    pub output: Option<Bytes>,
    pub gas: Option<U256>,
    pub gas_used: Option<U256>,
    pub value: Option<U256>,
    #[serde(rename = "type", default)]
    pub typ: String,
    #[serde(default)]
    pub logs: Vec<RawTraceLog>,
    #[serde(default)]
    pub calls: Vec<RawCall>,
}

/// Parsed 4byte-tracer entry. The node keys these by the full
/// `selector-argsize` string; the same selector observed with two argument
/// sizes is deliberately two entries (and counts twice).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FourByteEntry {
    pub selector: [u8; 4],
    pub call_size: usize,
    pub times: u64,
}

/// Complete raw trace of one transaction
#[derive(Debug, Clone)]
pub struct TxTrace {
    pub hash: TxHash,
    pub four_byte: Vec<FourByteEntry>,
    pub call_tree: RawCall,
}

/// Walks node traces and turns them into decoded call frames
pub struct Tracer {
    transport: Arc<RpcTransport>,
    finder: Arc<AbiFinder>,
    own_addresses: Vec<Address>,
    decoded_calls: DashMap<String, Vec<DecodedCall>>,
    trace_to_json: bool,
}

impl Tracer {
    pub fn new(
        transport: Arc<RpcTransport>,
        finder: Arc<AbiFinder>,
        own_addresses: Vec<Address>,
        trace_to_json: bool,
    ) -> Self {
        Self {
            transport,
            finder,
            own_addresses,
            decoded_calls: DashMap::new(),
            trace_to_json,
        }
    }

    /// Fetch both tracers, decode every frame and retain the result keyed
    /// by transaction hash. Returns the decoded frames, root first.
    pub async fn trace_transaction(&self, hash: TxHash) -> PilotResult<Vec<DecodedCall>> {
        let trace = self.fetch_trace(hash).await?;
        let mut decoded = self.decode_trace(&trace)?;
        decoded.extend(self.missing_calls(&trace));

        for frame in &decoded {
            let call = format!("{} -> {}", frame.from_name, frame.to_name);
            let gas = format!("{}/{}", frame.gas_used, frame.gas_limit);
            debug!(
                call = %call,
                method = %frame.method,
                gas = %gas,
                comment = %frame.comment,
                "Decoded call frame"
            );
        }

        let key = format!("{hash:#x}");
        self.decoded_calls.insert(key.clone(), decoded.clone());
        if self.trace_to_json {
            if let Err(e) = self.spill_to_json(&key, &decoded) {
                warn!(tx = %key, error = %e, "Failed to save decoded calls as JSON");
            }
        }
        Ok(decoded)
    }

    /// Previously decoded frames for a transaction, if any
    pub fn decoded_frames(&self, hash: TxHash) -> Option<Vec<DecodedCall>> {
        self.decoded_calls.get(&format!("{hash:#x}")).map(|v| v.clone())
    }

    async fn fetch_trace(&self, hash: TxHash) -> PilotResult<TxTrace> {
        let four_byte_raw: HashMap<String, u64> = self
            .transport
            .provider()
            .request(
                "debug_traceTransaction",
                (hash, json!({ "tracer": "4byteTracer" })),
            )
            .await?;
        let four_byte = parse_four_byte(&four_byte_raw)?;
        if four_byte.is_empty() {
            warn!(tx = ?hash, "No method signatures found in tracing data");
        }

        let call_tree: RawCall = self
            .transport
            .provider()
            .request(
                "debug_traceTransaction",
                (
                    hash,
                    json!({ "tracer": "callTracer", "tracerConfig": { "withLog": true } }),
                ),
            )
            .await?;

        Ok(TxTrace {
            hash,
            four_byte,
            call_tree,
        })
    }

    /// Decode the whole frame tree depth-first. A root frame that fails to
    /// decode fails the trace; a failing sub-frame degrades to a
    /// placeholder so the rest of the tree still comes through.
    fn decode_trace(&self, trace: &TxTrace) -> PilotResult<Vec<DecodedCall>> {
        let frames = flatten_tree(&trace.call_tree);
        let mut decoded = Vec::with_capacity(frames.len());

        for (i, frame) in frames.iter().enumerate() {
            match decode_call(&self.finder, &self.own_addresses, frame) {
                Ok(call) => decoded.push(call),
                Err(e) if i == 0 => {
                    debug!(error = %e, "Failed to decode main call");
                    return Err(e);
                }
                Err(e) => {
                    debug!(error = %e, from = ?frame.from, to = ?frame.to, "Failed to decode sub call");
                    decoded.push(failed_frame(frame));
                }
            }
        }
        Ok(decoded)
    }

    /// Cross-reference the 4byte counts against the call tree and
    /// synthesise placeholders for selectors the tree never showed.
    fn missing_calls(&self, trace: &TxTrace) -> Vec<DecodedCall> {
        let frames = flatten_tree(&trace.call_tree);
        let expected: u64 = trace.four_byte.iter().map(|e| e.times).sum();
        if expected <= frames.len() as u64 {
            return Vec::new();
        }
        debug!(
            traced = frames.len(),
            expected,
            "Call count and 4byte signature count do not match, some calls were not traced"
        );

        let mut missing = Vec::new();
        for entry in &trace.four_byte {
            let seen = frames
                .iter()
                .any(|frame| selector_of(&frame.input) == Some(entry.selector));
            if seen {
                continue;
            }

            let selector_hex = hex::encode(entry.selector);
            match self.finder.find_by_method(None, entry.selector) {
                Ok(result) => {
                    let mut comment = COMMENT_MISSING_CALL_TRACE.to_string();
                    if result.duplicate_count > 0 {
                        comment = format!(
                            "{comment}; potentially inaccurate - method present in {} other contracts",
                            result.duplicate_count
                        );
                    }
                    let to_address = self
                        .finder
                        .map()
                        .address_of(&result.contract_name)
                        .map(|a| format!("{a:#x}"))
                        .unwrap_or_else(|| UNKNOWN.to_string());
                    missing.push(DecodedCall {
                        from_address: UNKNOWN.to_string(),
                        to_address,
                        from_name: UNKNOWN.to_string(),
                        to_name: result.contract_name,
                        selector: selector_hex,
                        method: crate::abi::store::function_signature(&result.function),
                        inputs: warning_map(),
                        outputs: warning_map(),
                        comment,
                        ..Default::default()
                    });
                }
                Err(_) => {
                    debug!(
                        selector = %selector_hex,
                        "Method not found in any ABI instance, unable to provide more tracing information"
                    );
                    missing.push(DecodedCall {
                        from_address: UNKNOWN.to_string(),
                        to_address: UNKNOWN.to_string(),
                        from_name: UNKNOWN.to_string(),
                        to_name: UNKNOWN.to_string(),
                        selector: selector_hex,
                        method: NO_DATA.to_string(),
                        inputs: warning_map(),
                        outputs: warning_map(),
                        events: vec![DecodedLog {
                            signature: NO_DATA.to_string(),
                            data: warning_map(),
                            ..Default::default()
                        }],
                        comment: COMMENT_MISSING_CALL_TRACE.to_string(),
                        ..Default::default()
                    });
                }
            }
        }
        missing
    }

    /// Write every retained frame list as `traces/<txhash>.json`
    pub fn save_decoded_calls_as_json(&self, dir: &Path) -> PilotResult<Vec<PathBuf>> {
        let mut written = Vec::new();
        for entry in self.decoded_calls.iter() {
            written.push(write_json(dir, entry.key(), entry.value())?);
        }
        Ok(written)
    }

    fn spill_to_json(&self, key: &str, frames: &[DecodedCall]) -> PilotResult<PathBuf> {
        write_json(Path::new(TRACES_DIR), key, frames)
    }
}

/// Depth-first flattening of the call tree, root frame first
pub fn flatten_tree(root: &RawCall) -> Vec<&RawCall> {
    let mut frames = vec![root];
    let mut i = 0;
    while i < frames.len() {
        let current = frames[i];
        let insert_at = i + 1;
        for (offset, child) in current.calls.iter().enumerate() {
            frames.insert(insert_at + offset, child);
        }
        i += 1;
    }
    frames
}

/// Parse the node's `"0xselector-argsize" → count` map, keeping one entry
/// per distinct key so duplicate selectors with different argument sizes
/// each count.
pub fn parse_four_byte(raw: &HashMap<String, u64>) -> PilotResult<Vec<FourByteEntry>> {
    let mut entries = Vec::with_capacity(raw.len());
    for (key, times) in raw {
        let (selector_part, size_part) = key
            .trim_start_matches("0x")
            .split_once('-')
            .ok_or_else(|| {
                PilotError::Internal(format!("malformed 4byte tracer key: {key:?}"))
            })?;
        let bytes = hex::decode(selector_part)
            .map_err(|e| PilotError::Internal(format!("bad selector in 4byte key {key:?}: {e}")))?;
        if bytes.len() != 4 {
            return Err(PilotError::Internal(format!(
                "selector in 4byte key {key:?} is not 4 bytes"
            )));
        }
        let call_size: usize = size_part
            .parse()
            .map_err(|e| PilotError::Internal(format!("bad call size in 4byte key {key:?}: {e}")))?;
        let mut selector = [0u8; 4];
        selector.copy_from_slice(&bytes);
        entries.push(FourByteEntry {
            selector,
            call_size,
            times: *times,
        });
    }
    entries.sort_by_key(|e| (e.selector, e.call_size));
    Ok(entries)
}

fn warning_map() -> BTreeMap<String, serde_json::Value> {
    let mut map = BTreeMap::new();
    map.insert("warning".to_string(), serde_json::json!(NO_DATA));
    map
}

fn failed_frame(frame: &RawCall) -> DecodedCall {
    let mut error_map = BTreeMap::new();
    error_map.insert("error".to_string(), serde_json::json!(FAILED_TO_DECODE));
    DecodedCall {
        from_address: frame
            .from
            .map(|a| format!("{a:#x}"))
            .unwrap_or_else(|| UNKNOWN.to_string()),
        to_address: frame
            .to
            .map(|a| format!("{a:#x}"))
            .unwrap_or_else(|| UNKNOWN.to_string()),
        method: FAILED_TO_DECODE.to_string(),
        inputs: error_map.clone(),
        outputs: error_map,
        ..Default::default()
    }
}

fn write_json(dir: &Path, key: &str, frames: &[DecodedCall]) -> PilotResult<PathBuf> {
    std::fs::create_dir_all(dir)
        .map_err(|e| PilotError::Internal(format!("failed to create {dir:?}: {e}")))?;
    let path = dir.join(format!("{key}.json"));
    let json = serde_json::to_string_pretty(frames)
        .map_err(|e| PilotError::Internal(format!("failed to serialize decoded calls: {e}")))?;
    std::fs::write(&path, json)
        .map_err(|e| PilotError::Internal(format!("failed to write {path:?}: {e}")))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(input: Vec<u8>, calls: Vec<RawCall>) -> RawCall {
        RawCall {
            from: None,
            to: None,
            input: Bytes::from(input),
            output: None,
            gas: None,
            gas_used: None,
            value: None,
            typ: "CALL".to_string(),
            logs: Vec::new(),
            calls,
        }
    }

    #[test]
    fn flatten_is_depth_first_root_first() {
        let tree = call(
            vec![1, 1, 1, 1],
            vec![
                call(vec![2, 2, 2, 2], vec![call(vec![3, 3, 3, 3], vec![])]),
                call(vec![4, 4, 4, 4], vec![]),
            ],
        );
        let frames = flatten_tree(&tree);
        let first_bytes: Vec<u8> = frames.iter().map(|f| f.input[0]).collect();
        assert_eq!(first_bytes, vec![1, 2, 3, 4]);
    }

    #[test]
    fn four_byte_parsing_keeps_size_variants_separate() {
        let mut raw = HashMap::new();
        raw.insert("0xa9059cbb-64".to_string(), 2u64);
        raw.insert("0xa9059cbb-32".to_string(), 1u64);
        raw.insert("0x70a08231-32".to_string(), 1u64);

        let entries = parse_four_byte(&raw).unwrap();
        assert_eq!(entries.len(), 3);
        let total: u64 = entries.iter().map(|e| e.times).sum();
        assert_eq!(total, 4, "same selector with two arg sizes counts twice");
        let transfer_variants = entries
            .iter()
            .filter(|e| e.selector == [0xa9, 0x05, 0x9c, 0xbb])
            .count();
        assert_eq!(transfer_variants, 2);
    }

    #[test]
    fn four_byte_rejects_malformed_keys() {
        let mut raw = HashMap::new();
        raw.insert("0xa9059cbb".to_string(), 1u64);
        assert!(parse_four_byte(&raw).is_err());

        let mut raw = HashMap::new();
        raw.insert("0xzz059cbb-4".to_string(), 1u64);
        assert!(parse_four_byte(&raw).is_err());
    }

    #[test]
    fn decoded_frames_spill_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let frames = vec![DecodedCall {
            method: "transfer(address,uint256)".to_string(),
            from_name: "you".to_string(),
            to_name: "LinkToken".to_string(),
            ..Default::default()
        }];
        let path = write_json(dir.path(), "0xabc", &frames).unwrap();
        assert!(path.ends_with("0xabc.json"));

        let raw = std::fs::read_to_string(&path).unwrap();
        let parsed: Vec<DecodedCall> = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].method, "transfer(address,uint256)");
        assert_eq!(parsed[0].to_name, "LinkToken");
    }

    #[test]
    fn call_tracer_json_deserializes() {
        let json = r#"{
            "from": "0x00000000000000000000000000000000000000aa",
            "to": "0x00000000000000000000000000000000000000bb",
            "gas": "0x30d40",
            "gasUsed": "0x7530",
            "input": "0xa9059cbb",
            "output": "0x01",
            "value": "0x0",
            "type": "CALL",
            "logs": [
                {"address": "0x00000000000000000000000000000000000000bb",
                 "topics": ["0x0000000000000000000000000000000000000000000000000000000000000001"],
                 "data": "0x02"}
            ],
            "calls": [
                {"from": "0x00000000000000000000000000000000000000bb",
                 "to": "0x00000000000000000000000000000000000000cc",
                 "input": "0x70a08231",
                 "type": "STATICCALL"}
            ]
        }"#;
        let parsed: RawCall = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.gas.unwrap(), U256::from(200_000u64));
        assert_eq!(parsed.gas_used.unwrap(), U256::from(30_000u64));
        assert_eq!(parsed.logs.len(), 1);
        assert_eq!(parsed.calls.len(), 1);
        assert_eq!(parsed.calls[0].typ, "STATICCALL");
        assert!(parsed.calls[0].output.is_none());
    }
}
