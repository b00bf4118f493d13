//! EVM transaction envelopes: legacy, EIP-2930, EIP-1559 and EIP-4844.
//!
//! Legacy transactions are a bare RLP list. Typed transactions (EIP-2718)
//! are a single type byte followed by an RLP list whose field order is fixed
//! per type.

use alloy::primitives::{keccak256, Address, Bytes, Parity, Signature, B256, U256};
use serde::{Deserialize, Serialize};

use super::rlp::{self, RlpItem};
use super::CodecError;

pub const ACCESS_LIST_TX_TYPE: u8 = 0x01;
pub const DYNAMIC_FEE_TX_TYPE: u8 = 0x02;
pub const BLOB_TX_TYPE: u8 = 0x03;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvmTxType {
    Legacy,
    AccessList,
    DynamicFee,
    Blob,
}

impl EvmTxType {
    /// The EIP-2718 type byte, `None` for untyped legacy envelopes.
    pub fn type_byte(self) -> Option<u8> {
        match self {
            EvmTxType::Legacy => None,
            EvmTxType::AccessList => Some(ACCESS_LIST_TX_TYPE),
            EvmTxType::DynamicFee => Some(DYNAMIC_FEE_TX_TYPE),
            EvmTxType::Blob => Some(BLOB_TX_TYPE),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EvmTxType::Legacy => "legacy",
            EvmTxType::AccessList => "EIP-2930",
            EvmTxType::DynamicFee => "EIP-1559",
            EvmTxType::Blob => "EIP-4844",
        }
    }

    fn field_count(self) -> usize {
        match self {
            EvmTxType::Legacy => 9,
            EvmTxType::AccessList => 11,
            EvmTxType::DynamicFee => 12,
            EvmTxType::Blob => 14,
        }
    }
}

/// How the chain id of a transaction was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainIdSource {
    /// Carried as an explicit field of a typed transaction.
    Explicit,
    /// Derived from a legacy `v >= 35`.
    Eip155,
    /// Legacy `v` of 27 or 28 binds no chain; mainnet is a guess.
    AssumedMainnet,
}

/// Exactly one pricing model applies, determined by the transaction type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum GasPricing {
    Legacy {
        gas_price: U256,
    },
    DynamicFee {
        max_priority_fee_per_gas: U256,
        max_fee_per_gas: U256,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessListEntry {
    pub address: Address,
    pub storage_keys: Vec<B256>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobFields {
    pub max_fee_per_blob_gas: U256,
    pub blob_versioned_hashes: Vec<B256>,
    /// Number of blobs in the network wrapper, if the raw bytes carried one.
    pub sidecar_blobs: Option<usize>,
}

/// The raw `(v, r, s)` triple. For typed transactions `v` is the y-parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureParts {
    pub v: u64,
    pub r: U256,
    pub s: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedEvmTransaction {
    pub tx_type: EvmTxType,
    pub chain_id: u64,
    pub chain_id_source: ChainIdSource,
    pub nonce: u64,
    pub gas: GasPricing,
    pub gas_limit: u64,
    /// `None` means contract creation.
    pub to: Option<Address>,
    pub value: U256,
    pub data: Bytes,
    pub access_list: Vec<AccessListEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob: Option<BlobFields>,
    pub signature: SignatureParts,
}

/// Derives the chain id from a legacy signature `v` per EIP-155.
pub fn recover_legacy_chain_id(v: u64) -> Result<(u64, ChainIdSource), CodecError> {
    match v {
        27 | 28 => Ok((1, ChainIdSource::AssumedMainnet)),
        v if v >= 35 => Ok(((v - 35) / 2, ChainIdSource::Eip155)),
        other => Err(CodecError::InvalidLegacyV(other)),
    }
}

struct Fields<'a> {
    items: Vec<RlpItem<'a>>,
}

impl<'a> Fields<'a> {
    fn new(items: Vec<RlpItem<'a>>, tx_type: EvmTxType) -> Result<Self, CodecError> {
        if items.len() != tx_type.field_count() {
            return Err(CodecError::FieldCount {
                tx_type: tx_type.name(),
                expected: tx_type.field_count(),
                found: items.len(),
            });
        }
        Ok(Self { items })
    }

    fn bytes(&self, index: usize, field: &'static str) -> Result<&'a [u8], CodecError> {
        self.items[index]
            .as_bytes()
            .map_err(|e| CodecError::field(field, e))
    }

    fn u64(&self, index: usize, field: &'static str) -> Result<u64, CodecError> {
        rlp::decode_u64(self.bytes(index, field)?).map_err(|e| CodecError::field(field, e))
    }

    fn u256(&self, index: usize, field: &'static str) -> Result<U256, CodecError> {
        rlp::decode_u256(self.bytes(index, field)?).map_err(|e| CodecError::field(field, e))
    }

    fn to(&self, index: usize) -> Result<Option<Address>, CodecError> {
        match self.bytes(index, "to")? {
            [] => Ok(None),
            bytes if bytes.len() == 20 => Ok(Some(Address::from_slice(bytes))),
            bytes => Err(CodecError::field(
                "to",
                format!("expected 20 bytes, found {}", bytes.len()),
            )),
        }
    }

    fn hashes(&self, index: usize, field: &'static str) -> Result<Vec<B256>, CodecError> {
        let items = self.items[index]
            .as_list()
            .map_err(|e| CodecError::field(field, e))?;
        items.iter().map(|item| word(item, field)).collect()
    }

    fn access_list(&self, index: usize) -> Result<Vec<AccessListEntry>, CodecError> {
        const FIELD: &str = "accessList";
        let entries = self.items[index]
            .as_list()
            .map_err(|e| CodecError::field(FIELD, e))?;

        entries
            .iter()
            .map(|entry| {
                let parts = entry.as_list().map_err(|e| CodecError::field(FIELD, e))?;
                let [address, keys] = parts.as_slice() else {
                    return Err(CodecError::field(
                        FIELD,
                        format!("entry has {} parts, expected 2", parts.len()),
                    ));
                };
                let address = address.as_bytes().map_err(|e| CodecError::field(FIELD, e))?;
                if address.len() != 20 {
                    return Err(CodecError::field(FIELD, "entry address is not 20 bytes"));
                }
                let storage_keys = keys
                    .as_list()
                    .map_err(|e| CodecError::field(FIELD, e))?
                    .iter()
                    .map(|key| word(key, FIELD))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(AccessListEntry {
                    address: Address::from_slice(address),
                    storage_keys,
                })
            })
            .collect()
    }

    fn y_parity(&self, index: usize) -> Result<u64, CodecError> {
        match self.u64(index, "yParity")? {
            parity @ (0 | 1) => Ok(parity),
            other => Err(CodecError::field(
                "yParity",
                format!("must be 0 or 1, found {other}"),
            )),
        }
    }

    fn signature(&self, first: usize, v: u64) -> Result<SignatureParts, CodecError> {
        Ok(SignatureParts {
            v,
            r: self.u256(first, "r")?,
            s: self.u256(first + 1, "s")?,
        })
    }
}

fn word(item: &RlpItem<'_>, field: &'static str) -> Result<B256, CodecError> {
    let bytes = item.as_bytes().map_err(|e| CodecError::field(field, e))?;
    if bytes.len() != 32 {
        return Err(CodecError::field(
            field,
            format!("expected a 32-byte word, found {} bytes", bytes.len()),
        ));
    }
    Ok(B256::from_slice(bytes))
}

/// Decodes a raw EVM transaction, typed or legacy.
pub fn decode_evm(raw: &[u8]) -> Result<DecodedEvmTransaction, CodecError> {
    let lead = *raw.first().ok_or(CodecError::EmptyInput)?;
    match lead {
        0xc0..=0xff => decode_legacy(raw),
        ACCESS_LIST_TX_TYPE => decode_typed(EvmTxType::AccessList, &raw[1..]),
        DYNAMIC_FEE_TX_TYPE => decode_typed(EvmTxType::DynamicFee, &raw[1..]),
        BLOB_TX_TYPE => decode_blob(&raw[1..]),
        other => Err(CodecError::UnsupportedTransactionType(other)),
    }
}

fn decode_legacy(raw: &[u8]) -> Result<DecodedEvmTransaction, CodecError> {
    let fields = Fields::new(rlp::decode_exact_list(raw)?, EvmTxType::Legacy)?;

    let v = fields.u64(6, "v")?;
    let (chain_id, chain_id_source) = recover_legacy_chain_id(v)?;

    Ok(DecodedEvmTransaction {
        tx_type: EvmTxType::Legacy,
        chain_id,
        chain_id_source,
        nonce: fields.u64(0, "nonce")?,
        gas: GasPricing::Legacy {
            gas_price: fields.u256(1, "gasPrice")?,
        },
        gas_limit: fields.u64(2, "gasLimit")?,
        to: fields.to(3)?,
        value: fields.u256(4, "value")?,
        data: Bytes::copy_from_slice(fields.bytes(5, "data")?),
        access_list: Vec::new(),
        blob: None,
        signature: fields.signature(7, v)?,
    })
}

fn decode_typed(tx_type: EvmTxType, payload: &[u8]) -> Result<DecodedEvmTransaction, CodecError> {
    let fields = Fields::new(rlp::decode_exact_list(payload)?, tx_type)?;

    // 2930 has a single gasPrice where 1559 has the fee-cap pair.
    let (gas, rest) = match tx_type {
        EvmTxType::AccessList => (
            GasPricing::Legacy {
                gas_price: fields.u256(2, "gasPrice")?,
            },
            3,
        ),
        _ => (
            GasPricing::DynamicFee {
                max_priority_fee_per_gas: fields.u256(2, "maxPriorityFeePerGas")?,
                max_fee_per_gas: fields.u256(3, "maxFeePerGas")?,
            },
            4,
        ),
    };

    // accessList sits at rest + 4, the signature follows it
    let v = fields.y_parity(rest + 5)?;
    Ok(DecodedEvmTransaction {
        tx_type,
        chain_id: fields.u64(0, "chainId")?,
        chain_id_source: ChainIdSource::Explicit,
        nonce: fields.u64(1, "nonce")?,
        gas,
        gas_limit: fields.u64(rest, "gasLimit")?,
        to: fields.to(rest + 1)?,
        value: fields.u256(rest + 2, "value")?,
        data: Bytes::copy_from_slice(fields.bytes(rest + 3, "data")?),
        access_list: fields.access_list(rest + 4)?,
        blob: None,
        signature: fields.signature(rest + 6, v)?,
    })
}

fn decode_blob(payload: &[u8]) -> Result<DecodedEvmTransaction, CodecError> {
    let outer = rlp::decode_exact_list(payload)?;

    // Network form: [tx_payload, blobs, commitments, proofs]
    let wrapped = outer.first().is_some_and(RlpItem::is_list);
    let (items, sidecar_blobs) = if wrapped {
        if outer.len() != 4 {
            return Err(CodecError::field(
                "sidecar",
                format!("expected 4 wrapper items, found {}", outer.len()),
            ));
        }
        let blobs = outer[1]
            .as_list()
            .map_err(|e| CodecError::field("blobs", e))?
            .len();
        (outer[0].as_list()?, Some(blobs))
    } else {
        (outer, None)
    };

    let fields = Fields::new(items, EvmTxType::Blob)?;
    let to = fields.to(5)?;
    if to.is_none() {
        return Err(CodecError::field(
            "to",
            "blob transactions cannot create contracts",
        ));
    }

    let v = fields.y_parity(11)?;
    Ok(DecodedEvmTransaction {
        tx_type: EvmTxType::Blob,
        chain_id: fields.u64(0, "chainId")?,
        chain_id_source: ChainIdSource::Explicit,
        nonce: fields.u64(1, "nonce")?,
        gas: GasPricing::DynamicFee {
            max_priority_fee_per_gas: fields.u256(2, "maxPriorityFeePerGas")?,
            max_fee_per_gas: fields.u256(3, "maxFeePerGas")?,
        },
        gas_limit: fields.u64(4, "gasLimit")?,
        to,
        value: fields.u256(6, "value")?,
        data: Bytes::copy_from_slice(fields.bytes(7, "data")?),
        access_list: fields.access_list(8)?,
        blob: Some(BlobFields {
            max_fee_per_blob_gas: fields.u256(9, "maxFeePerBlobGas")?,
            blob_versioned_hashes: fields.hashes(10, "blobVersionedHashes")?,
            sidecar_blobs,
        }),
        signature: fields.signature(12, v)?,
    })
}

impl DecodedEvmTransaction {
    pub fn gas_price(&self) -> Option<U256> {
        match self.gas {
            GasPricing::Legacy { gas_price } => Some(gas_price),
            GasPricing::DynamicFee { .. } => None,
        }
    }

    pub fn max_fee_per_gas(&self) -> Option<U256> {
        match self.gas {
            GasPricing::DynamicFee {
                max_fee_per_gas, ..
            } => Some(max_fee_per_gas),
            GasPricing::Legacy { .. } => None,
        }
    }

    pub fn max_priority_fee_per_gas(&self) -> Option<U256> {
        match self.gas {
            GasPricing::DynamicFee {
                max_priority_fee_per_gas,
                ..
            } => Some(max_priority_fee_per_gas),
            GasPricing::Legacy { .. } => None,
        }
    }

    pub fn is_contract_creation(&self) -> bool {
        self.to.is_none()
    }

    /// Keccak-256 of the canonical envelope.
    pub fn tx_hash(&self) -> B256 {
        keccak256(encode_evm(self))
    }

    /// The hash the sender signed.
    pub fn signing_hash(&self) -> B256 {
        let mut payload = Vec::new();
        self.encode_body(&mut payload);
        match self.tx_type {
            EvmTxType::Legacy => {
                if self.chain_id_source == ChainIdSource::Eip155 {
                    rlp::encode_item(&mut payload, &self.chain_id);
                    rlp::encode_item(&mut payload, &0u8);
                    rlp::encode_item(&mut payload, &0u8);
                }
                let mut out = Vec::new();
                rlp::encode_list(&mut out, &payload);
                keccak256(out)
            }
            typed => {
                let mut out = Vec::with_capacity(payload.len() + 4);
                out.extend(typed.type_byte());
                rlp::encode_list(&mut out, &payload);
                keccak256(out)
            }
        }
    }

    fn y_parity(&self) -> bool {
        let v = self.signature.v;
        match self.chain_id_source {
            ChainIdSource::AssumedMainnet => v == 28,
            ChainIdSource::Eip155 => (v - 35) % 2 == 1,
            ChainIdSource::Explicit => v == 1,
        }
    }

    /// Recovers the sender address from the signature.
    pub fn recover_sender(&self) -> Result<Address, CodecError> {
        let signature = Signature::new(
            self.signature.r,
            self.signature.s,
            Parity::Parity(self.y_parity()),
        );
        signature
            .recover_address_from_prehash(&self.signing_hash())
            .map_err(|e| CodecError::InvalidSignature(e.to_string()))
    }

    /// Every field except the signature, in canonical order.
    fn encode_body(&self, out: &mut Vec<u8>) {
        if self.tx_type != EvmTxType::Legacy {
            rlp::encode_item(out, &self.chain_id);
        }
        rlp::encode_item(out, &self.nonce);
        match self.gas {
            GasPricing::Legacy { gas_price } => rlp::encode_item(out, &gas_price),
            GasPricing::DynamicFee {
                max_priority_fee_per_gas,
                max_fee_per_gas,
            } => {
                rlp::encode_item(out, &max_priority_fee_per_gas);
                rlp::encode_item(out, &max_fee_per_gas);
            }
        }
        rlp::encode_item(out, &self.gas_limit);
        match &self.to {
            Some(address) => rlp::encode_item(out, address),
            None => rlp::encode_item(out, &[0u8; 0][..]),
        }
        rlp::encode_item(out, &self.value);
        rlp::encode_item(out, &self.data[..]);

        if self.tx_type == EvmTxType::Legacy {
            return;
        }
        encode_access_list(out, &self.access_list);

        if let Some(blob) = &self.blob {
            rlp::encode_item(out, &blob.max_fee_per_blob_gas);
            let mut hashes = Vec::new();
            for hash in &blob.blob_versioned_hashes {
                rlp::encode_item(&mut hashes, hash);
            }
            rlp::encode_list(out, &hashes);
        }
    }
}

fn encode_access_list(out: &mut Vec<u8>, access_list: &[AccessListEntry]) {
    let mut entries = Vec::new();
    for entry in access_list {
        let mut keys = Vec::new();
        for key in &entry.storage_keys {
            rlp::encode_item(&mut keys, key);
        }
        let mut pair = Vec::new();
        rlp::encode_item(&mut pair, &entry.address);
        rlp::encode_list(&mut pair, &keys);
        rlp::encode_list(&mut entries, &pair);
    }
    rlp::encode_list(out, &entries);
}

/// Re-encodes a decoded transaction into its canonical signed envelope.
///
/// Blob transactions decoded from the network form come back without their
/// sidecar.
pub fn encode_evm(tx: &DecodedEvmTransaction) -> Vec<u8> {
    let mut payload = Vec::new();
    tx.encode_body(&mut payload);
    rlp::encode_item(&mut payload, &tx.signature.v);
    rlp::encode_item(&mut payload, &tx.signature.r);
    rlp::encode_item(&mut payload, &tx.signature.s);

    let mut out = Vec::with_capacity(payload.len() + 4);
    out.extend(tx.tx_type.type_byte());
    rlp::encode_list(&mut out, &payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    const EIP1559_TX: &str = "02f86d01832e559d808477359400825208945fbdb2315678afecb367f032d93f642f64180aa3840de0b6b380c001a01111111111111111111111111111111111111111111111111111111111111111a02222222222222222222222222222222222222222222222222222222222222222";

    const EIP2930_TX: &str = "01f8c601078504a817c80082c350945fbdb2315678afecb367f032d93f642f64180aa38084a9059cbbf85bf85994de0b295669a9fd93d5f28d9ec85e40f4cb697baef842a00000000000000000000000000000000000000000000000000000000000000003a0000000000000000000000000000000000000000000000000000000000000000780a01111111111111111111111111111111111111111111111111111111111111111a02222222222222222222222222222222222222222222222222222222222222222";

    const EIP4844_TX: &str = "03f88501030164825208945fbdb2315678afecb367f032d93f642f64180aa38080c005e1a0010000000000000000000000000000000000000000000000000000000000000080a01111111111111111111111111111111111111111111111111111111111111111a02222222222222222222222222222222222222222222222222222222222222222";

    const EIP4844_NETWORK_TX: &str = "03f8f1f88501030164825208945fbdb2315678afecb367f032d93f642f64180aa38080c005e1a0010000000000000000000000000000000000000000000000000000000000000080a01111111111111111111111111111111111111111111111111111111111111111a02222222222222222222222222222222222222222222222222222222222222222c584aaaaaaaaf1b0bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbf1b0cccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccc";

    // EIP-155 reference transaction, signed with key 0x4646...46.
    const EIP155_TX: &str = "f86c098504a817c800825208943535353535353535353535353535353535353535880de0b6b3a76400008025a028ef61340bd939bc2195fe537567866003e1a15d3c71ff63e1590620aa636276a067cbe9d8997f761aecb703304b3800ccf555c9f3dc64214b297fb1966a3b6d83";

    // Signed with the same 0x4646...46 key as the EIP-155 vector.
    const SIGNED_EIP1559_TX: &str = "02f87201078459682f008506fc23ac00825208945fbdb2315678afecb367f032d93f642f64180aa3872386f26fc1000080c001a09377c312145a5afb911bf9e8c067bcf6094c533603687850df502b61290bbf5ea042f2fb6d3f059d7a59ae51e1d51c75d554e36b2625fc8e8a29755698af471db9";

    const SIGNED_EIP2930_TX: &str = "01f8c601088504a817c80082c350945fbdb2315678afecb367f032d93f642f64180aa38084a9059cbbf85bf85994de0b295669a9fd93d5f28d9ec85e40f4cb697baef842a00000000000000000000000000000000000000000000000000000000000000003a0000000000000000000000000000000000000000000000000000000000000000780a04dcefd784255412d621e854b784bd29b9001d1a62c842a6af3651e60d08eefd4a0659e7c3dbc5c43f623214768ba4f1935e9fa975f41fd0bb68893de48494ed08d";

    const SIGNER: &str = "0x9d8A62f656a8d1615C1294fd71e9CFb3E4855A4F";

    const LEGACY_CREATE_TX: &str = "f8518001830186a080808560806040521ba01111111111111111111111111111111111111111111111111111111111111111a02222222222222222222222222222222222222222222222222222222222222222";

    fn raw(hex_str: &str) -> Vec<u8> {
        hex::decode(hex_str).unwrap()
    }

    #[test]
    fn test_decode_eip1559() {
        let tx = decode_evm(&raw(EIP1559_TX)).unwrap();
        assert_eq!(tx.tx_type, EvmTxType::DynamicFee);
        assert_eq!(tx.chain_id, 1);
        assert_eq!(tx.chain_id_source, ChainIdSource::Explicit);
        assert_eq!(tx.nonce, 0x2e559d);
        assert_eq!(tx.max_priority_fee_per_gas(), Some(U256::ZERO));
        assert_eq!(tx.max_fee_per_gas(), Some(U256::from(2_000_000_000u64)));
        assert_eq!(tx.gas_price(), None);
        assert_eq!(tx.gas_limit, 21_000);
        assert_eq!(
            tx.to,
            Some(Address::from_str("0x5fbdb2315678afecb367f032d93f642f64180aa3").unwrap())
        );
        assert_eq!(tx.value, U256::from(0x0de0b6b3u64));
        assert!(tx.data.is_empty());
        assert!(tx.access_list.is_empty());
        assert_eq!(tx.signature.v, 1);
        assert_eq!(tx.signature.r, U256::from_be_bytes([0x11; 32]));
    }

    #[test]
    fn test_eip1559_round_trip() {
        let bytes = raw(EIP1559_TX);
        let tx = decode_evm(&bytes).unwrap();
        assert_eq!(encode_evm(&tx), bytes);
        assert_eq!(tx.tx_hash(), keccak256(&bytes));
        assert_eq!(decode_evm(&bytes).unwrap(), tx);
    }

    #[test]
    fn test_signed_eip1559_hashes_and_sender() {
        let bytes = raw(SIGNED_EIP1559_TX);
        let tx = decode_evm(&bytes).unwrap();
        assert_eq!(tx.nonce, 7);
        assert_eq!(tx.max_priority_fee_per_gas(), Some(U256::from(1_500_000_000u64)));
        assert_eq!(tx.max_fee_per_gas(), Some(U256::from(30_000_000_000u64)));
        assert_eq!(tx.value, U256::from(10_000_000_000_000_000u64));
        assert_eq!(tx.signature.v, 1);
        assert_eq!(
            tx.signing_hash(),
            B256::from_str("0x8f362b85b1668d5e1c56c1df569fc0707a008875d8cb3ecdd2af36ae68c78d9d")
                .unwrap()
        );
        assert_eq!(
            tx.tx_hash(),
            B256::from_str("0x84a541f69abf0bbef636b93186c3f6339a5fcb4e98f3d917ff91298b17405180")
                .unwrap()
        );
        assert_eq!(tx.recover_sender().unwrap(), Address::from_str(SIGNER).unwrap());
    }

    #[test]
    fn test_signed_eip2930_hashes_and_sender() {
        let bytes = raw(SIGNED_EIP2930_TX);
        let tx = decode_evm(&bytes).unwrap();
        assert_eq!(tx.tx_type, EvmTxType::AccessList);
        assert_eq!(tx.nonce, 8);
        assert_eq!(tx.access_list[0].storage_keys.len(), 2);
        assert_eq!(tx.signature.v, 0);
        assert_eq!(
            tx.signing_hash(),
            B256::from_str("0xe9d1e70c39db8acf2b760660ff936ffce063319704c5a064df9c292f50a5620f")
                .unwrap()
        );
        assert_eq!(
            tx.tx_hash(),
            B256::from_str("0x87291bbb982f651532db76960a2067ea0c6fb930f427e39d78f0eebe59680c2c")
                .unwrap()
        );
        assert_eq!(tx.recover_sender().unwrap(), Address::from_str(SIGNER).unwrap());

        // a different signer shows up if any signed field changes
        let mut tampered = tx.clone();
        tampered.nonce += 1;
        assert_ne!(tampered.recover_sender().ok(), Some(Address::from_str(SIGNER).unwrap()));
    }

    #[test]
    fn test_decode_eip2930_with_access_list() {
        let bytes = raw(EIP2930_TX);
        let tx = decode_evm(&bytes).unwrap();
        assert_eq!(tx.tx_type, EvmTxType::AccessList);
        assert_eq!(tx.nonce, 7);
        assert_eq!(tx.gas_price(), Some(U256::from(20_000_000_000u64)));
        assert_eq!(tx.max_fee_per_gas(), None);
        assert_eq!(tx.gas_limit, 50_000);
        assert_eq!(tx.data.as_ref(), &[0xa9, 0x05, 0x9c, 0xbb]);
        assert_eq!(tx.access_list.len(), 1);
        assert_eq!(
            tx.access_list[0].address,
            Address::from_str("0xde0b295669a9fd93d5f28d9ec85e40f4cb697bae").unwrap()
        );
        assert_eq!(
            tx.access_list[0].storage_keys,
            vec![B256::with_last_byte(3), B256::with_last_byte(7)]
        );
        assert_eq!(tx.signature.v, 0);
        assert_eq!(encode_evm(&tx), bytes);
    }

    #[test]
    fn test_decode_blob_fields() {
        let bytes = raw(EIP4844_TX);
        let tx = decode_evm(&bytes).unwrap();
        assert_eq!(tx.tx_type, EvmTxType::Blob);
        let blob = tx.blob.as_ref().unwrap();
        assert_eq!(blob.max_fee_per_blob_gas, U256::from(5u64));
        let mut hash = [0u8; 32];
        hash[0] = 1;
        assert_eq!(blob.blob_versioned_hashes, vec![B256::from(hash)]);
        assert_eq!(blob.sidecar_blobs, None);
        assert_eq!(encode_evm(&tx), bytes);
    }

    #[test]
    fn test_decode_blob_network_form() {
        let tx = decode_evm(&raw(EIP4844_NETWORK_TX)).unwrap();
        assert_eq!(tx.blob.as_ref().unwrap().sidecar_blobs, Some(1));
        // the sidecar is dropped on re-encoding
        assert_eq!(encode_evm(&tx), raw(EIP4844_TX));
    }

    #[test]
    fn test_decode_eip155_reference_transaction() {
        let bytes = raw(EIP155_TX);
        let tx = decode_evm(&bytes).unwrap();
        assert_eq!(tx.tx_type, EvmTxType::Legacy);
        assert_eq!(tx.chain_id, 1);
        assert_eq!(tx.chain_id_source, ChainIdSource::Eip155);
        assert_eq!(tx.nonce, 9);
        assert_eq!(tx.gas_price(), Some(U256::from(20_000_000_000u64)));
        assert_eq!(
            tx.value,
            U256::from(1_000_000_000_000_000_000u64)
        );
        assert_eq!(tx.signature.v, 37);
        assert_eq!(
            tx.signing_hash(),
            B256::from_str("0xdaf5a779ae972f972197303d7b574746c7ef83eadac0f2791ad23db92e4c8e53")
                .unwrap()
        );
        assert_eq!(
            tx.recover_sender().unwrap(),
            Address::from_str("0x9d8A62f656a8d1615C1294fd71e9CFb3E4855A4F").unwrap()
        );
        assert_eq!(encode_evm(&tx), bytes);
    }

    #[test]
    fn test_legacy_contract_creation() {
        let tx = decode_evm(&raw(LEGACY_CREATE_TX)).unwrap();
        assert!(tx.is_contract_creation());
        assert_eq!(tx.to, None);
        assert_eq!(tx.chain_id, 1);
        assert_eq!(tx.chain_id_source, ChainIdSource::AssumedMainnet);
        assert_eq!(tx.data.as_ref(), &[0x60, 0x80, 0x60, 0x40, 0x52]);
    }

    #[test]
    fn test_legacy_chain_id_law() {
        for v in [27u64, 28] {
            assert_eq!(
                recover_legacy_chain_id(v).unwrap(),
                (1, ChainIdSource::AssumedMainnet)
            );
        }
        for v in [35u64, 36, 37, 38, 309, 310] {
            assert_eq!(recover_legacy_chain_id(v).unwrap().0, (v - 35) / 2);
        }
        assert_eq!(recover_legacy_chain_id(310).unwrap().0, 137);
        for v in 29u64..=34 {
            assert!(matches!(
                recover_legacy_chain_id(v),
                Err(CodecError::InvalidLegacyV(bad)) if bad == v
            ));
        }
        assert!(recover_legacy_chain_id(0).is_err());
    }

    #[test]
    fn test_unknown_type_byte() {
        assert!(matches!(
            decode_evm(&[0x04, 0xc0]),
            Err(CodecError::UnsupportedTransactionType(0x04))
        ));
        assert!(matches!(decode_evm(&[]), Err(CodecError::EmptyInput)));
    }

    #[test]
    fn test_truncated_transaction_is_rejected() {
        let bytes = raw(EIP1559_TX);
        let truncated = &bytes[..bytes.len() - 10];
        assert!(matches!(
            decode_evm(truncated),
            Err(CodecError::MalformedRlp(_))
        ));
    }

    #[test]
    fn test_wrong_field_count() {
        // typed 1559 envelope holding a single field
        assert!(matches!(
            decode_evm(&[0x02, 0xc1, 0x01]),
            Err(CodecError::FieldCount {
                expected: 12,
                found: 1,
                ..
            })
        ));
    }
}
