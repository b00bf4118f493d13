//! Raw Bitcoin transaction decoding.
//!
//! Witness stacks are not modelled: for SegWit transactions the decoder
//! checks that witness bytes are present and reads the locktime from the
//! final four bytes of the buffer. The txid is hashed over the stripped
//! (marker, flag and witness free) serialization.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::CodecError;

/// Sequence numbers below this value opt in to replace-by-fee.
pub const RBF_SEQUENCE_THRESHOLD: u32 = 0xffff_fffe;

const SEGWIT_MARKER: u8 = 0x00;
const SEGWIT_FLAG: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    /// Previous transaction hash in display (reversed) byte order.
    #[serde(with = "hex::serde")]
    pub prev_tx_hash: [u8; 32],
    pub prev_output_index: u32,
    #[serde(with = "hex::serde")]
    pub script_sig: Vec<u8>,
    pub sequence: u32,
    pub is_coinbase: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub value_satoshis: u64,
    #[serde(with = "hex::serde")]
    pub script_pub_key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedBitcoinTransaction {
    /// Double SHA-256 of the non-witness serialization, display byte order.
    pub txid: String,
    /// Same over the full serialization; only differs from `txid` for SegWit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wtxid: Option<String>,
    pub version: u32,
    pub has_witness: bool,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub locktime: u32,
}

impl DecodedBitcoinTransaction {
    pub fn signals_rbf(&self) -> bool {
        self.inputs
            .iter()
            .any(|input| input.sequence < RBF_SEQUENCE_THRESHOLD)
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].is_coinbase
    }

    /// Sum of all output values, `None` if it overflows.
    pub fn total_output_value(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, output| acc.checked_add(output.value_satoshis))
    }
}

/// Bitcoin's hash256 over the given pieces, reversed for display.
fn display_hash256<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    let mut digest = Sha256::digest(hasher.finalize());
    digest.reverse();
    hex::encode(digest)
}

fn malformed(offset: usize, what: impl std::fmt::Display) -> CodecError {
    CodecError::MalformedBitcoinTx(format!("{what} at offset {offset}"))
}

/// Reads a CompactSize integer, returning the value and the next offset.
pub fn read_varint(buf: &[u8], offset: usize) -> Result<(u64, usize), CodecError> {
    let lead = *buf
        .get(offset)
        .ok_or_else(|| malformed(offset, "missing varint"))?;

    let width = match lead {
        0xfd => 2,
        0xfe => 4,
        0xff => 8,
        value => return Ok((u64::from(value), offset + 1)),
    };

    let start = offset + 1;
    let bytes = buf
        .get(start..start + width)
        .ok_or_else(|| malformed(offset, "truncated varint"))?;
    let value = bytes
        .iter()
        .rev()
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
    Ok((value, start + width))
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8], CodecError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| malformed(self.pos, format_args!("truncated {what}")))?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u32_le(&mut self, what: &str) -> Result<u32, CodecError> {
        let bytes = self.take(4, what)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64_le(&mut self, what: &str) -> Result<u64, CodecError> {
        let mut word = [0u8; 8];
        word.copy_from_slice(self.take(8, what)?);
        Ok(u64::from_le_bytes(word))
    }

    fn varint(&mut self) -> Result<u64, CodecError> {
        let (value, next) = read_varint(self.buf, self.pos)?;
        self.pos = next;
        Ok(value)
    }

    /// A varint-declared length that must fit in what is left of the buffer.
    fn length(&mut self, what: &str) -> Result<usize, CodecError> {
        let at = self.pos;
        let value = self.varint()?;
        usize::try_from(value)
            .ok()
            .filter(|len| *len <= self.remaining())
            .ok_or_else(|| malformed(at, format_args!("{what} length {value} exceeds buffer")))
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn peek_pair(&self) -> Option<(u8, u8)> {
        match self.buf.get(self.pos..self.pos + 2) {
            Some([a, b]) => Some((*a, *b)),
            _ => None,
        }
    }
}

fn read_input(cursor: &mut Cursor<'_>) -> Result<TxInput, CodecError> {
    let mut prev_tx_hash = [0u8; 32];
    prev_tx_hash.copy_from_slice(cursor.take(32, "previous tx hash")?);
    prev_tx_hash.reverse();

    let prev_output_index = cursor.u32_le("previous output index")?;
    let script_len = cursor.length("scriptSig")?;
    let script_sig = cursor.take(script_len, "scriptSig")?.to_vec();
    let sequence = cursor.u32_le("sequence")?;

    Ok(TxInput {
        is_coinbase: prev_tx_hash.iter().all(|b| *b == 0),
        prev_tx_hash,
        prev_output_index,
        script_sig,
        sequence,
    })
}

fn read_output(cursor: &mut Cursor<'_>) -> Result<TxOutput, CodecError> {
    let value_satoshis = cursor.u64_le("output value")?;
    let script_len = cursor.length("scriptPubKey")?;
    let script_pub_key = cursor.take(script_len, "scriptPubKey")?.to_vec();
    Ok(TxOutput {
        value_satoshis,
        script_pub_key,
    })
}

pub fn decode_bitcoin(raw: &[u8]) -> Result<DecodedBitcoinTransaction, CodecError> {
    if raw.is_empty() {
        return Err(CodecError::EmptyInput);
    }
    let mut cursor = Cursor { buf: raw, pos: 0 };
    let version = cursor.u32_le("version")?;

    let has_witness = cursor.peek_pair() == Some((SEGWIT_MARKER, SEGWIT_FLAG));
    if has_witness {
        cursor.pos += 2;
    }
    let body_start = cursor.pos;

    // Each input occupies at least 41 bytes, each output at least 9.
    let input_count = cursor.varint()?;
    if input_count == 0 {
        return Err(malformed(cursor.pos, "transaction has no inputs"));
    }
    let mut inputs = Vec::with_capacity(input_count.min(cursor.remaining() as u64 / 41) as usize);
    for _ in 0..input_count {
        inputs.push(read_input(&mut cursor)?);
    }

    let output_count = cursor.varint()?;
    let mut outputs = Vec::with_capacity(output_count.min(cursor.remaining() as u64 / 9) as usize);
    for _ in 0..output_count {
        outputs.push(read_output(&mut cursor)?);
    }
    let body_end = cursor.pos;

    let locktime = if has_witness {
        // One witness item count per input, then the locktime.
        let witness_len = cursor
            .remaining()
            .checked_sub(4)
            .ok_or_else(|| malformed(cursor.pos, "truncated locktime"))?;
        if witness_len < inputs.len() {
            return Err(malformed(cursor.pos, "missing witness data"));
        }
        cursor.pos += witness_len;
        cursor.u32_le("locktime")?
    } else {
        let locktime = cursor.u32_le("locktime")?;
        if cursor.remaining() != 0 {
            return Err(malformed(
                cursor.pos,
                format_args!("{} unexpected trailing byte(s)", cursor.remaining()),
            ));
        }
        locktime
    };

    let (txid, wtxid) = if has_witness {
        let stripped = [&raw[..4], &raw[body_start..body_end], &raw[raw.len() - 4..]];
        (display_hash256(stripped), Some(display_hash256([raw])))
    } else {
        (display_hash256([raw]), None)
    };

    Ok(DecodedBitcoinTransaction {
        txid,
        wtxid,
        version,
        has_witness,
        inputs,
        outputs,
        locktime,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEGACY_TX: &str = "0100000001000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f01000000024830fdffffff0250c30000000000001976a914abababababababababababababababababababab88ac0040075af0750700160014cdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcd00000000";

    const SEGWIT_TX: &str = "02000000000101000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f0000000000ffffffff013930000000000000160014cdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcd02020102010300350c00";

    // Block 0 coinbase
    const GENESIS_COINBASE_TX: &str = "01000000010000000000000000000000000000000000000000000000000000000000000000ffffffff4d04ffff001d0104455468652054696d65732030332f4a616e2f32303039204368616e63656c6c6f72206f6e206272696e6b206f66207365636f6e64206261696c6f757420666f722062616e6b73ffffffff0100f2052a01000000434104678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5fac00000000";

    const COINBASE_TX: &str = "01000000010000000000000000000000000000000000000000000000000000000000000000ffffffff0403a0bb0dffffffff0140be4025000000001976a914abababababababababababababababababababab88ac00000000";

    fn raw(hex_str: &str) -> Vec<u8> {
        hex::decode(hex_str).unwrap()
    }

    #[test]
    fn test_varint_boundaries() {
        assert_eq!(read_varint(&[0x00], 0).unwrap(), (0, 1));
        assert_eq!(read_varint(&[0xfc], 0).unwrap(), (252, 1));
        assert_eq!(read_varint(&[0xfd, 0xfd, 0x00], 0).unwrap(), (253, 3));
        assert_eq!(read_varint(&[0xfd, 0xff, 0xff], 0).unwrap(), (65535, 3));
        assert_eq!(
            read_varint(&[0xfe, 0x00, 0x00, 0x01, 0x00], 0).unwrap(),
            (65536, 5)
        );
        assert_eq!(
            read_varint(&[0xff, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00], 0).unwrap(),
            (1 << 32, 9)
        );
        assert!(matches!(
            read_varint(&[0xfd, 0x01], 0),
            Err(CodecError::MalformedBitcoinTx(_))
        ));
    }

    #[test]
    fn test_decode_legacy_transaction() {
        let tx = decode_bitcoin(&raw(LEGACY_TX)).unwrap();
        assert_eq!(tx.version, 1);
        assert!(!tx.has_witness);
        assert_eq!(tx.inputs.len(), 1);
        assert_eq!(tx.outputs.len(), 2);

        let input = &tx.inputs[0];
        assert_eq!(
            hex::encode(input.prev_tx_hash),
            "1f1e1d1c1b1a191817161514131211100f0e0d0c0b0a09080706050403020100"
        );
        assert_eq!(input.prev_output_index, 1);
        assert_eq!(input.script_sig, vec![0x48, 0x30]);
        assert_eq!(input.sequence, 0xffff_fffd);
        assert!(!input.is_coinbase);
        assert!(tx.signals_rbf());

        assert_eq!(tx.outputs[0].value_satoshis, 50_000);
        assert_eq!(tx.outputs[0].script_pub_key.len(), 25);
        // 21M BTC in satoshis, beyond 2^53
        assert_eq!(tx.outputs[1].value_satoshis, 2_100_000_000_000_000);
        assert_eq!(tx.total_output_value(), Some(2_100_000_000_050_000));
        assert_eq!(tx.locktime, 0);
    }

    #[test]
    fn test_decode_segwit_transaction() {
        let tx = decode_bitcoin(&raw(SEGWIT_TX)).unwrap();
        assert_eq!(tx.version, 2);
        assert!(tx.has_witness);
        assert_eq!(tx.inputs.len(), 1);
        assert!(tx.inputs[0].script_sig.is_empty());
        assert!(!tx.signals_rbf());
        assert_eq!(tx.outputs[0].value_satoshis, 12_345);
        assert_eq!(tx.locktime, 800_000);
    }

    #[test]
    fn test_genesis_coinbase_txid() {
        let tx = decode_bitcoin(&raw(GENESIS_COINBASE_TX)).unwrap();
        assert_eq!(
            tx.txid,
            "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b"
        );
        assert_eq!(tx.wtxid, None);
        assert!(tx.is_coinbase());
        assert_eq!(tx.outputs[0].value_satoshis, 5_000_000_000);
    }

    #[test]
    fn test_segwit_txid_skips_witness_data() {
        let tx = decode_bitcoin(&raw(SEGWIT_TX)).unwrap();
        assert_eq!(
            tx.txid,
            "5b9c3fc2e9d1cb44ad0c7369b7a4b8a69f831b9c1e73f2622dbf0f5dd8e8bbb8"
        );
        assert_eq!(
            tx.wtxid.as_deref(),
            Some("b24113044c2a188287c28b4479626fc31ab4a3cee95c68fedd213b613cc76624")
        );

        let legacy = decode_bitcoin(&raw(LEGACY_TX)).unwrap();
        assert_eq!(
            legacy.txid,
            "addca671f6c1aaf7e69052f27917abb07c1f4be431066d25c5ab804218887b49"
        );
    }

    #[test]
    fn test_coinbase_requires_zero_prev_hash() {
        let tx = decode_bitcoin(&raw(COINBASE_TX)).unwrap();
        assert!(tx.inputs[0].is_coinbase);
        assert!(tx.is_coinbase());
        assert_eq!(tx.inputs[0].prev_output_index, 0xffff_ffff);
        assert_eq!(tx.outputs[0].value_satoshis, 625_000_000);

        let legacy = decode_bitcoin(&raw(LEGACY_TX)).unwrap();
        assert!(!legacy.is_coinbase());
    }

    #[test]
    fn test_truncated_and_trailing_bytes() {
        let bytes = raw(LEGACY_TX);
        assert!(matches!(
            decode_bitcoin(&bytes[..bytes.len() - 2]),
            Err(CodecError::MalformedBitcoinTx(_))
        ));

        let mut padded = bytes.clone();
        padded.push(0);
        assert!(matches!(
            decode_bitcoin(&padded),
            Err(CodecError::MalformedBitcoinTx(_))
        ));

        assert!(matches!(decode_bitcoin(&[]), Err(CodecError::EmptyInput)));
    }

    #[test]
    fn test_oversized_script_length_is_rejected() {
        let mut bytes = raw(LEGACY_TX);
        // scriptSig length byte sits after version, count, hash and index
        bytes[41] = 0xfc;
        assert!(matches!(
            decode_bitcoin(&bytes),
            Err(CodecError::MalformedBitcoinTx(_))
        ));
    }
}
