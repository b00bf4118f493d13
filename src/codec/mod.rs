pub mod bitcoin;
pub mod evm;
pub mod revert;
pub mod rlp;

use base64::prelude::{Engine, BASE64_STANDARD};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use bitcoin::DecodedBitcoinTransaction;
use evm::DecodedEvmTransaction;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("empty transaction input")]
    EmptyInput,
    #[error("input is neither hex nor base64: {0}")]
    InvalidEncoding(String),
    #[error("malformed RLP: {0}")]
    MalformedRlp(#[from] rlp::RlpError),
    #[error("invalid `{field}` field: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("{tx_type} transaction must have {expected} fields, found {found}")]
    FieldCount {
        tx_type: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("unsupported transaction type byte 0x{0:02x}")]
    UnsupportedTransactionType(u8),
    #[error("legacy signature v = {0} does not identify a chain (expected 27, 28 or >= 35)")]
    InvalidLegacyV(u64),
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
    #[error("malformed bitcoin transaction: {0}")]
    MalformedBitcoinTx(String),
}

impl CodecError {
    pub(crate) fn field(field: &'static str, reason: impl ToString) -> Self {
        CodecError::InvalidField {
            field,
            reason: reason.to_string(),
        }
    }
}

/// Raw transaction bytes parsed from user-supplied text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTransactionBytes(Vec<u8>);

impl RawTransactionBytes {
    /// Accepts hex (with or without `0x`) and falls back to standard base64.
    pub fn parse(text: &str) -> Result<Self, CodecError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(CodecError::EmptyInput);
        }

        let hex_part = text
            .strip_prefix("0x")
            .or_else(|| text.strip_prefix("0X"));
        if let Some(hex_part) = hex_part {
            return hex::decode(hex_part)
                .map(Self)
                .map_err(|e| CodecError::InvalidEncoding(e.to_string()));
        }

        if let Ok(bytes) = hex::decode(text) {
            return Ok(Self(bytes));
        }

        BASE64_STANDARD
            .decode(text)
            .map(Self)
            .map_err(|e| CodecError::InvalidEncoding(e.to_string()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    EvmLegacy,
    EvmAccessList,
    EvmDynamicFee,
    EvmBlob,
    Bitcoin,
}

impl TransactionKind {
    pub fn is_evm(self) -> bool {
        !matches!(self, TransactionKind::Bitcoin)
    }
}

fn looks_like_bitcoin(raw: &[u8]) -> bool {
    raw.len() >= 10 && (1..=3).contains(&raw[0]) && raw[1..4] == [0, 0, 0]
}

/// Classifies raw bytes without fully decoding them.
pub fn detect_type(raw: &[u8]) -> Result<TransactionKind, CodecError> {
    let lead = *raw.first().ok_or(CodecError::EmptyInput)?;
    // A typed envelope is followed by an RLP list prefix.
    let typed_list = raw.get(1).is_some_and(|b| *b >= 0xc0);

    match lead {
        0xc0..=0xff => Ok(TransactionKind::EvmLegacy),
        evm::ACCESS_LIST_TX_TYPE if typed_list => Ok(TransactionKind::EvmAccessList),
        evm::DYNAMIC_FEE_TX_TYPE if typed_list => Ok(TransactionKind::EvmDynamicFee),
        evm::BLOB_TX_TYPE if typed_list => Ok(TransactionKind::EvmBlob),
        _ if looks_like_bitcoin(raw) => Ok(TransactionKind::Bitcoin),
        other => Err(CodecError::UnsupportedTransactionType(other)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum DecodedTransaction {
    Evm(Box<DecodedEvmTransaction>),
    Bitcoin(DecodedBitcoinTransaction),
}

pub fn decode(raw: &[u8]) -> Result<DecodedTransaction, CodecError> {
    match detect_type(raw)? {
        TransactionKind::Bitcoin => bitcoin::decode_bitcoin(raw).map(DecodedTransaction::Bitcoin),
        _ => evm::decode_evm(raw).map(|tx| DecodedTransaction::Evm(Box::new(tx))),
    }
}

pub fn decode_evm(raw: &[u8]) -> Result<DecodedEvmTransaction, CodecError> {
    evm::decode_evm(raw)
}

fn looks_like_payload(cell: &str) -> bool {
    let cell = cell.strip_prefix("0x").unwrap_or(cell);
    cell.len() >= 16
        && cell
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '='))
}

/// Splits pasted text or `.txt`/`.csv` contents into one payload per line.
///
/// Blank lines and `#` comments are skipped. CSV rows are reduced to their
/// longest cell; rows without a payload-looking cell (headers) are dropped.
pub fn split_batch_input(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            line.split([',', ';', '\t'])
                .map(|cell| cell.trim().trim_matches('"'))
                .max_by_key(|cell| cell.len())
                .filter(|cell| looks_like_payload(cell))
                .map(str::to_string)
        })
        .collect()
}
