//! Recursive Length Prefix reader and writer.
//!
//! The reader is offset based: every call takes the source buffer and the
//! offset of an item's lead byte, and hands back the item together with the
//! offset immediately following it. Lists are returned as their raw payload
//! so callers decide how deep to descend.
//!
//! Encoding goes through `alloy::rlp`, which keeps the writer canonical.

use alloy::primitives::U256;
use alloy::rlp::{Encodable, Header};
use thiserror::Error;

/// Payloads of at most this many bytes use the single-byte length forms.
pub const SHORT_PAYLOAD_MAX: usize = 55;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RlpError {
    #[error("unexpected end of input at offset {offset}: {needed} more byte(s) required")]
    UnexpectedEnd { offset: usize, needed: usize },
    #[error("non-canonical length prefix at offset {0}")]
    NonCanonical(usize),
    #[error("length prefix at offset {0} is too large")]
    LengthOverflow(usize),
    #[error("expected a list at offset {0}")]
    ExpectedList(usize),
    #[error("expected a byte string, found a list")]
    ExpectedString,
    #[error("{0} trailing byte(s) after the top-level item")]
    TrailingBytes(usize),
    #[error("integer of {0} bytes does not fit the target width")]
    IntegerOverflow(usize),
    #[error("integer encoding has a leading zero byte")]
    LeadingZero,
}

/// A single decoded item. Lists carry their undecoded payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RlpItem<'a> {
    String(&'a [u8]),
    List(&'a [u8]),
}

impl<'a> RlpItem<'a> {
    pub fn as_bytes(&self) -> Result<&'a [u8], RlpError> {
        match self {
            RlpItem::String(payload) => Ok(payload),
            RlpItem::List(_) => Err(RlpError::ExpectedString),
        }
    }

    /// Decodes the items of a list one level deep.
    pub fn as_list(&self) -> Result<Vec<RlpItem<'a>>, RlpError> {
        match self {
            RlpItem::List(payload) => read_list(payload),
            RlpItem::String(_) => Err(RlpError::ExpectedList(0)),
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self, RlpItem::List(_))
    }
}

struct ItemHeader {
    list: bool,
    start: usize,
    len: usize,
}

fn read_length(buf: &[u8], at: usize, width: usize, lead_offset: usize) -> Result<usize, RlpError> {
    let end = at + width;
    if end > buf.len() {
        return Err(RlpError::UnexpectedEnd {
            offset: at,
            needed: end - buf.len(),
        });
    }
    if width > std::mem::size_of::<usize>() {
        return Err(RlpError::LengthOverflow(lead_offset));
    }
    if buf[at] == 0 {
        return Err(RlpError::NonCanonical(lead_offset));
    }

    let len = buf[at..end]
        .iter()
        .fold(0usize, |acc, b| (acc << 8) | usize::from(*b));
    if len <= SHORT_PAYLOAD_MAX {
        return Err(RlpError::NonCanonical(lead_offset));
    }
    Ok(len)
}

fn read_header(buf: &[u8], offset: usize) -> Result<ItemHeader, RlpError> {
    let lead = *buf.get(offset).ok_or(RlpError::UnexpectedEnd { offset, needed: 1 })?;

    let header = match lead {
        0x00..=0x7f => ItemHeader {
            list: false,
            start: offset,
            len: 1,
        },
        0x80..=0xb7 => ItemHeader {
            list: false,
            start: offset + 1,
            len: usize::from(lead - 0x80),
        },
        0xb8..=0xbf => {
            let width = usize::from(lead - 0xb7);
            let len = read_length(buf, offset + 1, width, offset)?;
            ItemHeader {
                list: false,
                start: offset + 1 + width,
                len,
            }
        }
        0xc0..=0xf7 => ItemHeader {
            list: true,
            start: offset + 1,
            len: usize::from(lead - 0xc0),
        },
        0xf8..=0xff => {
            let width = usize::from(lead - 0xf7);
            let len = read_length(buf, offset + 1, width, offset)?;
            ItemHeader {
                list: true,
                start: offset + 1 + width,
                len,
            }
        }
    };

    let end = header
        .start
        .checked_add(header.len)
        .ok_or(RlpError::LengthOverflow(offset))?;
    if end > buf.len() {
        return Err(RlpError::UnexpectedEnd {
            offset: header.start,
            needed: end - buf.len(),
        });
    }

    // A lone byte below 0x80 must be encoded as itself.
    if (0x81..=0xb7).contains(&lead) && header.len == 1 && buf[header.start] < 0x80 {
        return Err(RlpError::NonCanonical(offset));
    }

    Ok(header)
}

/// Reads the item whose lead byte sits at `offset`.
pub fn read_item(buf: &[u8], offset: usize) -> Result<(RlpItem<'_>, usize), RlpError> {
    let header = read_header(buf, offset)?;
    let end = header.start + header.len;
    let payload = &buf[header.start..end];
    let item = if header.list {
        RlpItem::List(payload)
    } else {
        RlpItem::String(payload)
    };
    Ok((item, end))
}

/// Enters a list, returning its declared payload length and where the payload starts.
pub fn parse_list_header(buf: &[u8], offset: usize) -> Result<(usize, usize), RlpError> {
    let header = read_header(buf, offset)?;
    if !header.list {
        return Err(RlpError::ExpectedList(offset));
    }
    Ok((header.len, header.start))
}

/// Splits a list payload into its top-level items.
pub fn read_list(payload: &[u8]) -> Result<Vec<RlpItem<'_>>, RlpError> {
    let mut items = Vec::new();
    let mut offset = 0;
    while offset < payload.len() {
        let (item, next) = read_item(payload, offset)?;
        items.push(item);
        offset = next;
    }
    Ok(items)
}

/// Decodes a buffer that must hold exactly one list and nothing after it.
pub fn decode_exact_list(buf: &[u8]) -> Result<Vec<RlpItem<'_>>, RlpError> {
    let (len, start) = parse_list_header(buf, 0)?;
    let end = start + len;
    if end != buf.len() {
        return Err(RlpError::TrailingBytes(buf.len() - end));
    }
    read_list(&buf[start..end])
}

fn check_integer(payload: &[u8], width: usize) -> Result<(), RlpError> {
    if payload.len() > width {
        return Err(RlpError::IntegerOverflow(payload.len()));
    }
    if payload.first() == Some(&0) {
        return Err(RlpError::LeadingZero);
    }
    Ok(())
}

/// Big-endian unsigned integer; the empty payload is zero.
pub fn decode_u64(payload: &[u8]) -> Result<u64, RlpError> {
    check_integer(payload, 8)?;
    Ok(payload.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

pub fn decode_u256(payload: &[u8]) -> Result<U256, RlpError> {
    check_integer(payload, 32)?;
    Ok(U256::from_be_slice(payload))
}

/// Appends `value` using its canonical RLP encoding.
pub fn encode_item<T: Encodable + ?Sized>(out: &mut Vec<u8>, value: &T) {
    value.encode(out);
}

/// Appends a list header followed by an already-encoded payload.
pub fn encode_list(out: &mut Vec<u8>, payload: &[u8]) {
    Header {
        list: true,
        payload_length: payload.len(),
    }
    .encode(out);
    out.extend_from_slice(payload);
}
