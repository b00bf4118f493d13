//! Wire formats for each chain family the broadcaster can reach.

use base64::prelude::{Engine, BASE64_STANDARD};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::codec::{self, CodecError, DecodedTransaction, RawTransactionBytes};
use crate::config::EndpointConfig;

const BASE58_ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ChainFamily {
    Evm,
    Bitcoin,
    Solana,
    Xrp,
    Stellar,
}

impl FromStr for ChainFamily {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "evm" | "ethereum" | "eth" => Ok(ChainFamily::Evm),
            "bitcoin" | "btc" => Ok(ChainFamily::Bitcoin),
            "solana" | "sol" => Ok(ChainFamily::Solana),
            "xrp" | "ripple" => Ok(ChainFamily::Xrp),
            "stellar" | "xlm" => Ok(ChainFamily::Stellar),
            other => Err(anyhow::anyhow!(
                "Unknown chain family: '{}'. Expected one of: evm, bitcoin, solana, xrp, stellar",
                other
            )),
        }
    }
}

impl fmt::Display for ChainFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChainFamily::Evm => "evm",
            ChainFamily::Bitcoin => "bitcoin",
            ChainFamily::Solana => "solana",
            ChainFamily::Xrp => "xrp",
            ChainFamily::Stellar => "stellar",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BitcoinProvider {
    Mempool,
    BlockCypher,
    BitcoinCom,
}

impl FromStr for BitcoinProvider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mempool" | "mempool.space" => Ok(BitcoinProvider::Mempool),
            "blockcypher" => Ok(BitcoinProvider::BlockCypher),
            "bitcoin.com" | "bitcoincom" | "bitcoin_com" => Ok(BitcoinProvider::BitcoinCom),
            other => Err(anyhow::anyhow!(
                "Unknown bitcoin provider: '{}'. Expected mempool, blockcypher or bitcoin.com",
                other
            )),
        }
    }
}

/// Text encoding of a non-EVM payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadEncoding {
    Hex,
    Base58,
    Base64,
}

impl PayloadEncoding {
    pub fn as_str(self) -> &'static str {
        match self {
            PayloadEncoding::Hex => "hex",
            PayloadEncoding::Base58 => "base58",
            PayloadEncoding::Base64 => "base64",
        }
    }
}

/// Hex wins over base58 when a string fits both alphabets.
pub fn detect_payload_encoding(payload: &str) -> PayloadEncoding {
    if payload.starts_with("0x") || payload.starts_with("0X") {
        return PayloadEncoding::Hex;
    }
    if payload.len() % 2 == 0 && payload.chars().all(|c| c.is_ascii_hexdigit()) {
        return PayloadEncoding::Hex;
    }
    if payload.chars().all(|c| BASE58_ALPHABET.contains(c)) {
        return PayloadEncoding::Base58;
    }
    PayloadEncoding::Base64
}

/// Where one batch is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub family: ChainFamily,
    pub url: String,
    pub bitcoin_provider: BitcoinProvider,
}

impl Destination {
    /// Picks the endpoint for `family`. EVM sends go to `evm_rpc_url`.
    pub fn resolve(
        family: ChainFamily,
        endpoints: &EndpointConfig,
        evm_rpc_url: Option<&str>,
    ) -> anyhow::Result<Self> {
        let bitcoin_provider: BitcoinProvider = endpoints.bitcoin_provider.parse()?;
        let url = match family {
            ChainFamily::Evm => evm_rpc_url
                .ok_or_else(|| anyhow::anyhow!("EVM broadcast requires an RPC endpoint"))?
                .to_string(),
            ChainFamily::Bitcoin => match bitcoin_provider {
                BitcoinProvider::Mempool => endpoints.mempool_api_url.clone(),
                BitcoinProvider::BlockCypher => endpoints.blockcypher_api_url.clone(),
                BitcoinProvider::BitcoinCom => endpoints.bitcoin_com_api_url.clone(),
            },
            ChainFamily::Solana => endpoints.solana_rpc_url.clone(),
            ChainFamily::Xrp => endpoints.xrp_rpc_url.clone(),
            ChainFamily::Stellar => endpoints.stellar_horizon_url.clone(),
        };

        Ok(Self {
            family,
            url: url.trim_end_matches('/').to_string(),
            bitcoin_provider,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Json(Value),
    Text(String),
    Form(Vec<(String, String)>),
}

/// A fully built POST, ready for a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    pub url: String,
    pub body: RequestBody,
    /// Hash computed locally from the payload, for EVM and Bitcoin.
    pub expected_tx_hash: Option<String>,
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("{family} payload is not a {expected} transaction")]
    WrongFamily {
        family: ChainFamily,
        expected: &'static str,
    },
    #[error("invalid {encoding} payload: {reason}")]
    Encoding {
        encoding: &'static str,
        reason: String,
    },
}

fn json_rpc(method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": method,
        "params": params,
    })
}

fn strip_hex_prefix(payload: &str) -> &str {
    payload
        .strip_prefix("0x")
        .or_else(|| payload.strip_prefix("0X"))
        .unwrap_or(payload)
}

fn hex_payload(payload: &str) -> Result<Vec<u8>, PayloadError> {
    hex::decode(strip_hex_prefix(payload)).map_err(|e| PayloadError::Encoding {
        encoding: "hex",
        reason: e.to_string(),
    })
}

/// EVM and Bitcoin payloads are decoded first so malformed bytes never leave
/// the process.
/// Returns the payload as bare hex plus its locally computed hash.
fn decoded_hex(family: ChainFamily, payload: &str) -> Result<(String, String), PayloadError> {
    let raw = RawTransactionBytes::parse(payload)?;
    let tx_hash = match (family, codec::decode(raw.as_bytes())?) {
        (ChainFamily::Evm, DecodedTransaction::Evm(tx)) => tx.tx_hash().to_string(),
        (ChainFamily::Bitcoin, DecodedTransaction::Bitcoin(tx)) => tx.txid,
        _ => {
            return Err(PayloadError::WrongFamily {
                family,
                expected: if family == ChainFamily::Evm { "EVM" } else { "bitcoin" },
            })
        }
    };
    Ok((hex::encode(raw.as_bytes()), tx_hash))
}

pub fn build_request(
    destination: &Destination,
    payload: &str,
) -> Result<OutboundRequest, PayloadError> {
    let payload = payload.trim();
    let base = &destination.url;

    let mut expected_tx_hash = None;
    let (url, body) = match destination.family {
        ChainFamily::Evm => {
            let (raw_hex, tx_hash) = decoded_hex(ChainFamily::Evm, payload)?;
            expected_tx_hash = Some(tx_hash);
            let body = json_rpc("eth_sendRawTransaction", json!([format!("0x{raw_hex}")]));
            (base.clone(), RequestBody::Json(body))
        }
        ChainFamily::Bitcoin => {
            let (raw_hex, txid) = decoded_hex(ChainFamily::Bitcoin, payload)?;
            expected_tx_hash = Some(txid);
            match destination.bitcoin_provider {
                BitcoinProvider::Mempool => (format!("{base}/tx"), RequestBody::Text(raw_hex)),
                BitcoinProvider::BlockCypher => (
                    format!("{base}/txs/push"),
                    RequestBody::Json(json!({ "tx": raw_hex })),
                ),
                BitcoinProvider::BitcoinCom => (
                    format!("{base}/rawtransactions/sendRawTransaction"),
                    RequestBody::Json(json!({ "hexes": [raw_hex] })),
                ),
            }
        }
        ChainFamily::Solana => {
            let (encoded, encoding) = match detect_payload_encoding(payload) {
                PayloadEncoding::Hex => (
                    BASE64_STANDARD.encode(hex_payload(payload)?),
                    PayloadEncoding::Base64,
                ),
                other => (payload.to_string(), other),
            };
            let body = json_rpc(
                "sendTransaction",
                json!([encoded, { "encoding": encoding.as_str() }]),
            );
            (base.clone(), RequestBody::Json(body))
        }
        ChainFamily::Xrp => {
            let blob = hex::encode_upper(hex_payload(payload)?);
            let body = json!({
                "method": "submit",
                "params": [{ "tx_blob": blob }],
            });
            (base.clone(), RequestBody::Json(body))
        }
        ChainFamily::Stellar => {
            let envelope = match detect_payload_encoding(payload) {
                PayloadEncoding::Hex => BASE64_STANDARD.encode(hex_payload(payload)?),
                _ => {
                    BASE64_STANDARD
                        .decode(payload)
                        .map_err(|e| PayloadError::Encoding {
                            encoding: "base64",
                            reason: e.to_string(),
                        })?;
                    payload.to_string()
                }
            };
            (
                format!("{base}/transactions"),
                RequestBody::Form(vec![("tx".to_string(), envelope)]),
            )
        }
    };

    Ok(OutboundRequest {
        url,
        body,
        expected_tx_hash,
    })
}

fn json_rpc_error_message(error: &Value) -> String {
    let message = error["message"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string());
    match error.get("data") {
        Some(Value::String(data)) => format!("{message}: {data}"),
        _ => message,
    }
}

fn non_empty_body(status: u16, body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        format!("HTTP {status}")
    } else {
        body.to_string()
    }
}

/// Extracts the transaction hash from a reply, or the failure message.
pub fn parse_reply(destination: &Destination, status: u16, body: &str) -> Result<String, String> {
    let ok_status = (200..300).contains(&status);
    let parsed: Option<Value> = serde_json::from_str(body).ok();

    match destination.family {
        ChainFamily::Evm | ChainFamily::Solana => {
            let reply = parsed.ok_or_else(|| non_empty_body(status, body))?;
            if let Some(error) = reply.get("error").filter(|e| !e.is_null()) {
                return Err(json_rpc_error_message(error));
            }
            match reply["result"].as_str() {
                Some(hash) if ok_status => Ok(hash.to_string()),
                _ => Err(non_empty_body(status, body)),
            }
        }
        ChainFamily::Bitcoin => match destination.bitcoin_provider {
            BitcoinProvider::Mempool => {
                let text = body.trim();
                let looks_like_txid =
                    text.len() == 64 && text.chars().all(|c| c.is_ascii_hexdigit());
                if ok_status && looks_like_txid {
                    Ok(text.to_string())
                } else {
                    Err(non_empty_body(status, body))
                }
            }
            BitcoinProvider::BlockCypher => {
                let reply = parsed.ok_or_else(|| non_empty_body(status, body))?;
                if let Some(error) = reply["error"].as_str() {
                    return Err(error.to_string());
                }
                match reply["tx"]["hash"].as_str() {
                    Some(hash) if ok_status => Ok(hash.to_string()),
                    _ => Err(non_empty_body(status, body)),
                }
            }
            BitcoinProvider::BitcoinCom => {
                let reply = parsed.ok_or_else(|| non_empty_body(status, body))?;
                if let Some(error) = reply["error"].as_str() {
                    return Err(error.to_string());
                }
                match reply[0].as_str().or_else(|| reply.as_str()) {
                    Some(hash) if ok_status => Ok(hash.to_string()),
                    _ => Err(non_empty_body(status, body)),
                }
            }
        },
        ChainFamily::Xrp => {
            let reply = parsed.ok_or_else(|| non_empty_body(status, body))?;
            let result = &reply["result"];
            let engine_result = result["engine_result"].as_str().unwrap_or_default();
            // tes* applied, terQUEUED held for a later ledger.
            if ok_status && (engine_result.starts_with("tes") || engine_result == "terQUEUED") {
                return result["tx_json"]["hash"]
                    .as_str()
                    .map(str::to_string)
                    .ok_or_else(|| "XRP reply is missing tx_json.hash".to_string());
            }
            let message = result["engine_result_message"]
                .as_str()
                .or_else(|| result["error_message"].as_str())
                .or_else(|| result["error"].as_str());
            Err(match (engine_result, message) {
                ("", Some(message)) => message.to_string(),
                ("", None) => non_empty_body(status, body),
                (code, Some(message)) => format!("{code}: {message}"),
                (code, None) => code.to_string(),
            })
        }
        ChainFamily::Stellar => {
            let reply = parsed.ok_or_else(|| non_empty_body(status, body))?;
            if ok_status {
                if let Some(hash) = reply["hash"].as_str() {
                    return Ok(hash.to_string());
                }
            }
            let codes = &reply["extras"]["result_codes"];
            let title = reply["title"].as_str().unwrap_or("Transaction Failed");
            Err(match codes["transaction"].as_str() {
                Some(code) => {
                    let operations: Vec<&str> = codes["operations"]
                        .as_array()
                        .map(|ops| ops.iter().filter_map(Value::as_str).collect())
                        .unwrap_or_default();
                    if operations.is_empty() {
                        format!("{title}: {code}")
                    } else {
                        format!("{title}: {code} ({})", operations.join(", "))
                    }
                }
                None => reply["detail"]
                    .as_str()
                    .map(|detail| format!("{title}: {detail}"))
                    .unwrap_or_else(|| non_empty_body(status, body)),
            })
        }
    }
}
