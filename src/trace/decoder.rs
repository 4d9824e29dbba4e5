//! ABI-driven decoding of inputs, outputs, logs and revert payloads

use crate::abi::store::function_signature;
use crate::abi::{AbiFinder, ContractMap, ContractStore};
use crate::error::{PilotError, PilotResult};
use crate::trace::tracer::{RawCall, RawTraceLog};
use crate::trace::{DecodedCall, DecodedLog, COMMENT_MISSING_ABI, UNKNOWN, YOU};

use ethers::abi::{Abi, Function, RawLog, Token};
use ethers::types::{Address, Transaction, TransactionReceipt, U256};
use ethers::utils::keccak256;
use std::collections::BTreeMap;
use tracing::{trace, warn};

/// Selector of the canonical string revert `Error(string)`
const ERROR_STRING_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];
/// Selector of the Solidity `Panic(uint256)` builtin
const PANIC_SELECTOR: [u8; 4] = [0x4e, 0x48, 0x7b, 0x71];

/// First four bytes of the call input, when there are at least four
pub fn selector_of(input: &[u8]) -> Option<[u8; 4]> {
    if input.len() < 4 {
        return None;
    }
    let mut selector = [0u8; 4];
    selector.copy_from_slice(&input[..4]);
    Some(selector)
}

/// Human-readable name of an address: mapped contract name, `"you"` for a
/// managed key, `"unknown"` otherwise.
pub fn human_name(address: Option<Address>, map: &ContractMap, own: &[Address]) -> String {
    match address {
        Some(addr) => {
            if let Some(name) = map.name_of(addr) {
                name
            } else if own.contains(&addr) {
                YOU.to_string()
            } else {
                UNKNOWN.to_string()
            }
        }
        None => UNKNOWN.to_string(),
    }
}

fn address_string(address: Option<Address>) -> String {
    address
        .map(|a| format!("{a:#x}"))
        .unwrap_or_else(|| UNKNOWN.to_string())
}

/// Decode one raw call frame into a [`DecodedCall`].
///
/// A missing ABI or ambiguous selector is not an error: the frame comes
/// back partially filled with an explanatory comment. Failing to unpack
/// inputs or outputs against a *matched* ABI is an error; the caller
/// decides whether that is fatal.
pub fn decode_call(
    finder: &AbiFinder,
    own: &[Address],
    frame: &RawCall,
) -> PilotResult<DecodedCall> {
    let mut decoded = DecodedCall {
        from_address: address_string(frame.from),
        to_address: address_string(frame.to),
        from_name: human_name(frame.from, finder.map(), own),
        to_name: human_name(frame.to, finder.map(), own),
        value: frame.value.unwrap_or_default(),
        gas_limit: frame.gas.unwrap_or_default().as_u64(),
        gas_used: frame.gas_used.unwrap_or_default().as_u64(),
        ..Default::default()
    };

    let selector = match selector_of(&frame.input) {
        Some(selector) => selector,
        None => {
            decoded.comment = COMMENT_MISSING_ABI.to_string();
            return Ok(decoded);
        }
    };
    decoded.selector = hex::encode(selector);

    let result = match finder.find_by_method(frame.to, selector) {
        Ok(result) => result,
        Err(e) => {
            warn!(
                selector = %decoded.selector,
                contract = %decoded.to_address,
                error = %e,
                "Method not found in any ABI instance, tracing information will be partial"
            );
            decoded.comment = COMMENT_MISSING_ABI.to_string();
            return Ok(decoded);
        }
    };

    if result.duplicate_count > 0 {
        decoded.comment = format!(
            "potentially inaccurate - method present in {} other contracts",
            result.duplicate_count
        );
    }
    decoded.method = function_signature(&result.function);

    decoded.inputs = decode_inputs(&result.function, &frame.input)?;
    if let Some(output) = &frame.output {
        if !output.is_empty() {
            decoded.outputs = decode_outputs(&result.function, output)?;
        }
    }
    decoded.events = decode_trace_logs(&result.abi, &frame.logs)?;

    Ok(decoded)
}

/// Decode the top-level call of a mined transaction from its input and
/// receipt logs (no node trace involved).
pub fn decode_transaction_frame(
    finder: &AbiFinder,
    own: &[Address],
    tx: &Transaction,
    receipt: &TransactionReceipt,
) -> PilotResult<DecodedCall> {
    let frame = RawCall {
        from: Some(tx.from),
        to: tx.to,
        input: tx.input.clone(),
        output: None,
        gas: Some(tx.gas),
        gas_used: receipt.gas_used,
        value: Some(tx.value),
        typ: String::new(),
        logs: Vec::new(),
        calls: Vec::new(),
    };
    let mut decoded = decode_call(finder, own, &frame)?;

    // receipt logs replace the trace logs the frame did not have
    if decoded.comment != COMMENT_MISSING_ABI {
        if let Ok(result) = finder.find_by_method(tx.to, selector_of(&tx.input).unwrap_or_default())
        {
            let raw_logs: Vec<RawTraceLog> = receipt
                .logs
                .iter()
                .map(|log| RawTraceLog {
                    address: log.address,
                    topics: log.topics.clone(),
                    data: log.data.clone(),
                })
                .collect();
            decoded.events = decode_trace_logs(&result.abi, &raw_logs)?;
        }
    }
    Ok(decoded)
}

/// Unpack function inputs (`data` still carries the selector)
pub fn decode_inputs(
    function: &Function,
    data: &[u8],
) -> PilotResult<BTreeMap<String, serde_json::Value>> {
    let tokens = function
        .decode_input(&data[4.min(data.len())..])
        .map_err(|e| PilotError::DecodeInput(e.to_string()))?;
    Ok(named_map(&function.inputs, &tokens))
}

/// Unpack function return data
pub fn decode_outputs(
    function: &Function,
    data: &[u8],
) -> PilotResult<BTreeMap<String, serde_json::Value>> {
    let tokens = function
        .decode_output(data)
        .map_err(|e| PilotError::DecodeOutput(e.to_string()))?;
    Ok(named_map(&function.outputs, &tokens))
}

/// Match trace logs against the ABI's events and unpack them. Logs whose
/// topic0 matches no known event are skipped.
pub fn decode_trace_logs(abi: &Abi, logs: &[RawTraceLog]) -> PilotResult<Vec<DecodedLog>> {
    let mut decoded = Vec::new();
    for log in logs {
        let Some(topic0) = log.topics.first() else {
            continue;
        };
        for event in abi.events() {
            if event.signature() != *topic0 {
                continue;
            }
            trace!(event = %event.name, "Unpacking event");
            let parsed = event
                .parse_log(RawLog {
                    topics: log.topics.clone(),
                    data: log.data.to_vec(),
                })
                .map_err(|e| PilotError::DecodeLog(e.to_string()))?;

            let mut data = BTreeMap::new();
            for (i, param) in parsed.params.iter().enumerate() {
                let key = if param.name.is_empty() {
                    i.to_string()
                } else {
                    param.name.clone()
                };
                data.insert(key, token_to_value(&param.value));
            }
            decoded.push(DecodedLog {
                signature: event_signature(event),
                address: format!("{:#x}", log.address),
                topics: log.topics.iter().map(|t| format!("{t:#x}")).collect(),
                data,
            });
        }
    }
    Ok(decoded)
}

fn event_signature(event: &ethers::abi::Event) -> String {
    let params: Vec<String> = event.inputs.iter().map(|p| p.kind.to_string()).collect();
    format!("{}({})", event.name, params.join(","))
}

/// Turn a revert payload into the user-visible revert error. String
/// reverts and panics decode against the builtin signatures; anything else
/// is matched against every known custom error selector.
pub fn decode_revert(data: &[u8], store: &ContractStore) -> PilotError {
    let Some(selector) = selector_of(data) else {
        return PilotError::Reverted {
            name: UNKNOWN.to_string(),
            values: vec![format!("0x{}", hex::encode(data))],
        };
    };
    let payload = &data[4..];

    if selector == ERROR_STRING_SELECTOR {
        if let Ok(tokens) = ethers::abi::decode(&[ethers::abi::ParamType::String], payload) {
            return PilotError::Reverted {
                name: "Error".to_string(),
                values: tokens.iter().map(token_to_string).collect(),
            };
        }
    }
    if selector == PANIC_SELECTOR {
        if let Ok(tokens) = ethers::abi::decode(&[ethers::abi::ParamType::Uint(256)], payload) {
            return PilotError::Reverted {
                name: "Panic".to_string(),
                values: tokens.iter().map(token_to_string).collect(),
            };
        }
    }

    for name in store.names() {
        let Some(abi) = store.get_abi(&name) else {
            continue;
        };
        for error in abi.errors.values().flatten() {
            let params: Vec<String> = error.inputs.iter().map(|p| p.kind.to_string()).collect();
            let signature = format!("{}({})", error.name, params.join(","));
            if keccak256(signature.as_bytes())[..4] != selector {
                continue;
            }
            let kinds: Vec<ethers::abi::ParamType> =
                error.inputs.iter().map(|p| p.kind.clone()).collect();
            match ethers::abi::decode(&kinds, payload) {
                Ok(tokens) => {
                    return PilotError::Reverted {
                        name: error.name.clone(),
                        values: tokens.iter().map(token_to_string).collect(),
                    }
                }
                Err(e) => warn!(error = %e, signature, "Matched custom error selector but failed to unpack values"),
            }
        }
    }

    PilotError::Reverted {
        name: UNKNOWN.to_string(),
        values: vec![format!("0x{}", hex::encode(data))],
    }
}

/// Parameter name → value map; unnamed parameters take numeric keys
fn named_map(
    params: &[ethers::abi::Param],
    tokens: &[Token],
) -> BTreeMap<String, serde_json::Value> {
    let mut map = BTreeMap::new();
    for (i, token) in tokens.iter().enumerate() {
        let key = params
            .get(i)
            .map(|p| p.name.clone())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| i.to_string());
        map.insert(key, token_to_value(token));
    }
    map
}

/// JSON representation of a decoded ABI token. Numbers become decimal
/// strings so 256-bit values survive serialization.
pub fn token_to_value(token: &Token) -> serde_json::Value {
    use serde_json::Value;
    match token {
        Token::Address(addr) => Value::String(format!("{addr:#x}")),
        Token::FixedBytes(bytes) | Token::Bytes(bytes) => {
            Value::String(format!("0x{}", hex::encode(bytes)))
        }
        Token::Int(value) => Value::String(int_to_string(*value)),
        Token::Uint(value) => Value::String(value.to_string()),
        Token::Bool(value) => Value::Bool(*value),
        Token::String(value) => Value::String(value.clone()),
        Token::FixedArray(tokens) | Token::Array(tokens) | Token::Tuple(tokens) => {
            Value::Array(tokens.iter().map(token_to_value).collect())
        }
    }
}

fn token_to_string(token: &Token) -> String {
    match token_to_value(token) {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Two's-complement aware display of a signed ABI integer
fn int_to_string(value: U256) -> String {
    if value.bit(255) {
        let magnitude = (!value).overflowing_add(U256::one()).0;
        format!("-{magnitude}")
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::store::tests::COUNTER_ABI;
    use ethers::abi::Token;
    use ethers::types::{Bytes, H256};
    use std::sync::Arc;

    fn finder_with_counter() -> (AbiFinder, Address) {
        let store = Arc::new(ContractStore::new());
        store.add_abi_json("Counter", COUNTER_ABI).unwrap();
        let map = Arc::new(ContractMap::new());
        let counter: Address = "0x00000000000000000000000000000000000000aa".parse().unwrap();
        map.add(counter, "Counter");
        (AbiFinder::new(store, map), counter)
    }

    fn encode_increment(by: u64) -> Vec<u8> {
        let (finder, _) = finder_with_counter();
        let abi = finder.store().get_abi("Counter").unwrap();
        let function = abi.function("increment").unwrap();
        function.encode_input(&[Token::Uint(U256::from(by))]).unwrap()
    }

    #[test]
    fn selector_extraction() {
        assert_eq!(selector_of(&[1, 2, 3]), None);
        assert_eq!(selector_of(&[1, 2, 3, 4, 5]), Some([1, 2, 3, 4]));
    }

    #[test]
    fn encode_decode_round_trip() {
        let (finder, _) = finder_with_counter();
        let abi = finder.store().get_abi("Counter").unwrap();
        let function = abi.function("increment").unwrap();

        let data = encode_increment(42);
        let inputs = decode_inputs(function, &data).unwrap();
        assert_eq!(inputs.get("by").unwrap(), &serde_json::json!("42"));
    }

    #[test]
    fn unnamed_outputs_take_numeric_keys() {
        let (finder, _) = finder_with_counter();
        let abi = finder.store().get_abi("Counter").unwrap();
        let function = abi.function("increment").unwrap();

        let output = ethers::abi::encode(&[Token::Uint(U256::from(43u64))]);
        let outputs = decode_outputs(function, &output).unwrap();
        assert_eq!(outputs.get("0").unwrap(), &serde_json::json!("43"));
    }

    #[test]
    fn decode_call_resolves_names_and_values() {
        let (finder, counter) = finder_with_counter();
        let sender: Address = "0x00000000000000000000000000000000000000ee".parse().unwrap();
        let frame = RawCall {
            from: Some(sender),
            to: Some(counter),
            input: Bytes::from(encode_increment(7)),
            output: Some(Bytes::from(ethers::abi::encode(&[Token::Uint(U256::from(8u64))]))),
            gas: Some(U256::from(100_000u64)),
            gas_used: Some(U256::from(30_000u64)),
            value: Some(U256::zero()),
            typ: "CALL".to_string(),
            logs: Vec::new(),
            calls: Vec::new(),
        };

        let decoded = decode_call(&finder, &[sender], &frame).unwrap();
        assert_eq!(decoded.method, "increment(uint256)");
        assert_eq!(decoded.from_name, "you");
        assert_eq!(decoded.to_name, "Counter");
        assert_eq!(decoded.gas_limit, 100_000);
        assert_eq!(decoded.gas_used, 30_000);
        assert_eq!(decoded.inputs.get("by").unwrap(), &serde_json::json!("7"));
        assert_eq!(decoded.outputs.get("0").unwrap(), &serde_json::json!("8"));
        assert_eq!(
            decoded.selector,
            hex::encode(selector_of(&frame.input).unwrap())
        );
        assert!(decoded.comment.is_empty());
    }

    #[test]
    fn missing_abi_is_annotated_not_fatal() {
        let (finder, _) = finder_with_counter();
        let frame = RawCall {
            from: None,
            to: None,
            input: Bytes::from(vec![0xde, 0xad, 0xbe, 0xef, 0x00]),
            output: None,
            gas: None,
            gas_used: None,
            value: None,
            typ: "CALL".to_string(),
            logs: Vec::new(),
            calls: Vec::new(),
        };
        let decoded = decode_call(&finder, &[], &frame).unwrap();
        assert_eq!(decoded.comment, COMMENT_MISSING_ABI);
        assert_eq!(decoded.to_name, "unknown");
        assert!(decoded.method.is_empty());
    }

    #[test]
    fn decode_event_log() {
        let (finder, counter) = finder_with_counter();
        let abi = finder.store().get_abi("Counter").unwrap();
        let event = abi.event("Incremented").unwrap();

        // Incremented(uint256 by, uint256 indexed total)
        let mut topic_total = [0u8; 32];
        topic_total[31] = 50;
        let log = RawTraceLog {
            address: counter,
            topics: vec![event.signature(), H256::from(topic_total)],
            data: Bytes::from(ethers::abi::encode(&[Token::Uint(U256::from(5u64))])),
        };

        let decoded = decode_trace_logs(&abi, &[log]).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].signature, "Incremented(uint256,uint256)");
        assert_eq!(decoded[0].data.get("by").unwrap(), &serde_json::json!("5"));
        assert_eq!(decoded[0].data.get("total").unwrap(), &serde_json::json!("50"));
    }

    #[test]
    fn unknown_topic_is_skipped() {
        let (finder, counter) = finder_with_counter();
        let abi = finder.store().get_abi("Counter").unwrap();
        let log = RawTraceLog {
            address: counter,
            topics: vec![H256::repeat_byte(0x11)],
            data: Bytes::default(),
        };
        assert!(decode_trace_logs(&abi, &[log]).unwrap().is_empty());
    }

    #[test]
    fn string_revert_decodes() {
        let (finder, _) = finder_with_counter();
        let mut data = ERROR_STRING_SELECTOR.to_vec();
        data.extend(ethers::abi::encode(&[Token::String("nope".to_string())]));
        let err = decode_revert(&data, finder.store());
        match err {
            PilotError::Reverted { name, values } => {
                assert_eq!(name, "Error");
                assert_eq!(values, vec!["nope".to_string()]);
            }
            other => panic!("expected revert error, got {other}"),
        }
    }

    #[test]
    fn custom_error_decodes_with_name_and_values() {
        let (finder, _) = finder_with_counter();
        // TooBig(uint256 given, uint256 max)
        let selector = &keccak256(b"TooBig(uint256,uint256)")[..4];
        let mut data = selector.to_vec();
        data.extend(ethers::abi::encode(&[
            Token::Uint(U256::from(12u64)),
            Token::Uint(U256::from(21u64)),
        ]));
        let err = decode_revert(&data, finder.store());
        assert_eq!(
            err.to_string(),
            "error type: TooBig, error values: [12 21]"
        );
    }

    #[test]
    fn unknown_revert_keeps_raw_payload() {
        let (finder, _) = finder_with_counter();
        let err = decode_revert(&[0xaa, 0xbb, 0xcc, 0xdd, 0x01], finder.store());
        match err {
            PilotError::Reverted { name, values } => {
                assert_eq!(name, UNKNOWN);
                assert_eq!(values, vec!["0xaabbccdd01".to_string()]);
            }
            other => panic!("expected revert error, got {other}"),
        }
    }

    #[test]
    fn negative_int_tokens_display_signed() {
        let minus_two = (!U256::one()).overflowing_add(U256::zero()).0; // two's complement -2
        assert_eq!(token_to_string(&Token::Int(minus_two)), "-2");
        assert_eq!(token_to_string(&Token::Int(U256::from(7u64))), "7");
    }
}
