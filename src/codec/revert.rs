//! Decoding of revert payloads returned by failed EVM calls.

use alloy::primitives::{Bytes, U256};
use alloy::sol_types::{Panic, Revert, SolError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Solidity panic codes and their meaning.
const PANIC_CODES: [(u64, &str); 10] = [
    (0x00, "Generic compiler inserted panic"),
    (0x01, "Assertion failed"),
    (0x11, "Arithmetic underflow or overflow"),
    (0x12, "Division or modulo by zero"),
    (0x21, "Invalid enum value"),
    (0x22, "Invalid storage byte array encoding"),
    (0x31, "pop() on an empty array"),
    (0x32, "Array index out of bounds"),
    (0x41, "Out of memory"),
    (0x51, "Call to an uninitialized internal function"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RevertReason {
    Error { message: String },
    Panic { code: U256, message: String },
    CustomOrUnknown { raw_data: Bytes },
}

impl RevertReason {
    /// A one-line description for display.
    pub fn summary(&self) -> String {
        match self {
            RevertReason::Error { message } => format!("Error: {message}"),
            RevertReason::Panic { code, message } => format!("Panic(0x{code:x}): {message}"),
            RevertReason::CustomOrUnknown { raw_data } if raw_data.is_empty() => {
                "Reverted without data".to_string()
            }
            RevertReason::CustomOrUnknown { raw_data } => {
                format!("Custom or unknown revert: {raw_data}")
            }
        }
    }
}

pub fn panic_message(code: U256) -> String {
    PANIC_CODES
        .iter()
        .find(|(known, _)| U256::from(*known) == code)
        .map(|(_, message)| message.to_string())
        .unwrap_or_else(|| format!("Unknown panic code: 0x{code:x}"))
}

/// Classifies the return data of a reverted call.
///
/// Payloads that carry a standard selector but fail to ABI-decode are kept
/// raw rather than guessed at.
pub fn decode_revert_reason(data: &[u8]) -> RevertReason {
    let raw = || RevertReason::CustomOrUnknown {
        raw_data: Bytes::copy_from_slice(data),
    };

    let Some(selector) = data.get(..4) else {
        return raw();
    };

    if selector == Revert::SELECTOR.as_slice() {
        match Revert::abi_decode(data, true) {
            Ok(revert) => RevertReason::Error {
                message: revert.reason,
            },
            Err(e) => {
                debug!("Failed to decode Error(string) payload: {}", e);
                raw()
            }
        }
    } else if selector == Panic::SELECTOR.as_slice() {
        match Panic::abi_decode(data, true) {
            Ok(panic) => RevertReason::Panic {
                code: panic.code,
                message: panic_message(panic.code),
            },
            Err(e) => {
                debug!("Failed to decode Panic(uint256) payload: {}", e);
                raw()
            }
        }
    } else {
        raw()
    }
}

/// Pulls revert bytes out of a JSON-RPC error object.
///
/// Nodes report them either as `error.data = "0x.."` or nested as
/// `error.data.data = "0x.."`.
pub fn revert_data_from_rpc_error(error: &Value) -> Option<Bytes> {
    let data = match &error["data"] {
        Value::String(s) => s.as_str(),
        Value::Object(inner) => inner.get("data")?.as_str()?,
        _ => return None,
    };
    let hex_str = data.strip_prefix("0x").unwrap_or(data);
    hex::decode(hex_str).ok().map(Bytes::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn panic_payload(code: u8) -> Vec<u8> {
        let mut data = hex::decode("4e487b71").unwrap();
        let mut word = [0u8; 32];
        word[31] = code;
        data.extend_from_slice(&word);
        data
    }

    #[test]
    fn test_decode_error_string() {
        let data = Revert {
            reason: "Insufficient balance".to_string(),
        }
        .abi_encode();
        assert_eq!(&data[..4], &[0x08, 0xc3, 0x79, 0xa0]);
        assert_eq!(
            decode_revert_reason(&data),
            RevertReason::Error {
                message: "Insufficient balance".to_string()
            }
        );
    }

    #[test]
    fn test_decode_known_panic() {
        let reason = decode_revert_reason(&panic_payload(0x11));
        assert_eq!(
            reason,
            RevertReason::Panic {
                code: U256::from(0x11u64),
                message: "Arithmetic underflow or overflow".to_string()
            }
        );
        assert_eq!(
            reason.summary(),
            "Panic(0x11): Arithmetic underflow or overflow"
        );
    }

    #[test]
    fn test_decode_unknown_panic() {
        match decode_revert_reason(&panic_payload(0x99)) {
            RevertReason::Panic { message, .. } => {
                assert_eq!(message, "Unknown panic code: 0x99")
            }
            other => panic!("unexpected reason: {:?}", other),
        }
    }

    #[test]
    fn test_panic_table_is_complete() {
        for (code, message) in PANIC_CODES {
            assert_eq!(panic_message(U256::from(code)), message);
        }
        assert_eq!(panic_message(U256::from(0x32u64)), "Array index out of bounds");
    }

    #[test]
    fn test_custom_and_empty_data_kept_raw() {
        let custom = hex::decode("deadbeef0000").unwrap();
        assert_eq!(
            decode_revert_reason(&custom),
            RevertReason::CustomOrUnknown {
                raw_data: Bytes::from(custom.clone())
            }
        );

        let empty = decode_revert_reason(&[]);
        assert_eq!(
            empty,
            RevertReason::CustomOrUnknown {
                raw_data: Bytes::new()
            }
        );
        assert_eq!(empty.summary(), "Reverted without data");
    }

    #[test]
    fn test_truncated_error_string_falls_back_to_raw() {
        let mut data = Revert {
            reason: "this message will be cut".to_string(),
        }
        .abi_encode();
        data.truncate(40);
        assert!(matches!(
            decode_revert_reason(&data),
            RevertReason::CustomOrUnknown { .. }
        ));
    }

    #[test]
    fn test_revert_data_from_rpc_error() {
        let flat = json!({ "code": 3, "message": "execution reverted", "data": "0x4e487b71" });
        assert_eq!(
            revert_data_from_rpc_error(&flat),
            Some(Bytes::from(vec![0x4e, 0x48, 0x7b, 0x71]))
        );

        let nested = json!({ "code": -32015, "data": { "data": "0xdeadbeef" } });
        assert_eq!(
            revert_data_from_rpc_error(&nested),
            Some(Bytes::from(vec![0xde, 0xad, 0xbe, 0xef]))
        );

        assert_eq!(revert_data_from_rpc_error(&json!({ "code": -32000 })), None);
    }
}
