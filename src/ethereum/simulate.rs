//! Dry-runs a signed EVM transaction against a node without broadcasting it.

use alloy::{
    primitives::{Address, Bytes, B256},
    providers::{Provider, RootProvider},
    transports::{
        http::{Client, Http},
        RpcError as AlloyRpcError, TransportErrorKind,
    },
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::codec::evm::{DecodedEvmTransaction, GasPricing};
use crate::codec::revert::{decode_revert_reason, revert_data_from_rpc_error, RevertReason};
use crate::codec::{self, RawTransactionBytes};
use crate::config::{Config, NetworkConfig};
use crate::ethereum::provider::ProviderManager;
use crate::ethereum::utils::interpret_rpc_error;

const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("{0}")]
    Transport(String),
    #[error("{message} (code {code})")]
    Rpc {
        code: i64,
        message: String,
        /// The whole JSON-RPC error object, `data` included.
        error: Value,
    },
}

impl RpcError {
    /// The node does not offer this method, as opposed to the call failing.
    pub fn is_method_unavailable(&self) -> bool {
        match self {
            RpcError::Rpc { code, message, .. } => {
                let message = message.to_ascii_lowercase();
                *code == METHOD_NOT_FOUND
                    || message.contains("method not found")
                    || message.contains("does not exist")
                    || message.contains("not supported")
                    || message.contains("not available")
            }
            RpcError::Transport(_) => false,
        }
    }
}

impl From<AlloyRpcError<TransportErrorKind>> for RpcError {
    fn from(error: AlloyRpcError<TransportErrorKind>) -> Self {
        match error {
            AlloyRpcError::ErrorResp(payload) => RpcError::Rpc {
                code: payload.code,
                message: payload.message.to_string(),
                error: serde_json::to_value(&payload).unwrap_or(Value::Null),
            },
            other => RpcError::Transport(other.to_string()),
        }
    }
}

/// Raw JSON-RPC access to one node.
#[async_trait]
pub trait RpcClient: Send + Sync {
    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError>;
}

#[async_trait]
impl RpcClient for RootProvider<Http<Client>> {
    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        self.raw_request::<Value, Value>(method.to_string().into(), params)
            .await
            .map_err(RpcError::from)
    }
}

/// Looks up the RPC client for a configured network.
pub trait RpcEndpoints: Send + Sync {
    fn client(&self, network: &str) -> Result<&dyn RpcClient>;
}

impl RpcEndpoints for ProviderManager {
    fn client(&self, network: &str) -> Result<&dyn RpcClient> {
        let provider: &dyn RpcClient = self.get_provider(Some(network))?;
        Ok(provider)
    }
}

/// Builds the call object shared by `eth_call`, `eth_estimateGas` and the
/// tracers.
pub fn call_object(tx: &DecodedEvmTransaction, from: Address) -> Value {
    let mut call = Map::new();
    call.insert("from".into(), json!(from));
    if let Some(to) = tx.to {
        call.insert("to".into(), json!(to));
    }
    call.insert("gas".into(), json!(format!("{:#x}", tx.gas_limit)));
    call.insert("value".into(), json!(format!("{:#x}", tx.value)));
    call.insert("data".into(), json!(tx.data));
    call.insert("nonce".into(), json!(format!("{:#x}", tx.nonce)));

    match tx.gas {
        GasPricing::Legacy { gas_price } => {
            call.insert("gasPrice".into(), json!(format!("{:#x}", gas_price)));
        }
        GasPricing::DynamicFee {
            max_priority_fee_per_gas,
            max_fee_per_gas,
        } => {
            call.insert(
                "maxPriorityFeePerGas".into(),
                json!(format!("{:#x}", max_priority_fee_per_gas)),
            );
            call.insert("maxFeePerGas".into(), json!(format!("{:#x}", max_fee_per_gas)));
        }
    }

    if !tx.access_list.is_empty() {
        let entries: Vec<Value> = tx
            .access_list
            .iter()
            .map(|entry| json!({ "address": entry.address, "storageKeys": entry.storage_keys }))
            .collect();
        call.insert("accessList".into(), Value::Array(entries));
    }

    if let Some(blob) = &tx.blob {
        call.insert(
            "maxFeePerBlobGas".into(),
            json!(format!("{:#x}", blob.max_fee_per_blob_gas)),
        );
        call.insert(
            "blobVersionedHashes".into(),
            json!(blob.blob_versioned_hashes),
        );
    }

    Value::Object(call)
}

/// Picks the network to simulate on. An explicit name wins, then the one
/// whose chain id matches, then the default.
pub fn resolve_network<'a>(
    config: &'a Config,
    requested: Option<&str>,
    chain_id: u64,
) -> Result<(&'a str, &'a NetworkConfig)> {
    if let Some(name) = requested {
        return config
            .networks
            .get_key_value(name)
            .map(|(name, network)| (name.as_str(), network))
            .ok_or_else(|| anyhow!("Network '{}' not configured", name));
    }
    if let Some((name, network)) = config.network_for_chain(chain_id) {
        return Ok((name.as_str(), network));
    }
    config
        .networks
        .get_key_value(&config.default_network)
        .map(|(name, network)| (name.as_str(), network))
        .ok_or_else(|| anyhow!("Default network '{}' not configured", config.default_network))
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SimulationRequest {
    pub raw_transaction: String,
    pub from: Option<Address>,
    /// Block tag or hex number; `latest` when absent.
    pub block: Option<String>,
    pub network: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationResult {
    pub network: String,
    pub chain_id: u64,
    pub from: Address,
    pub tx_hash: B256,
    pub success: bool,
    pub gas_estimate: Option<u64>,
    pub return_data: Option<Bytes>,
    pub revert: Option<RevertReason>,
    pub error: Option<String>,
    pub trace_method: Option<String>,
    pub trace: Option<Value>,
    /// A tracer that exists but failed, as opposed to one the node lacks.
    pub trace_error: Option<String>,
    pub notes: Vec<String>,
}

/// Splits an `eth_call` failure into a revert or an infrastructure error.
fn revert_from_call_error(error: &RpcError) -> Option<RevertReason> {
    let RpcError::Rpc { message, error, .. } = error else {
        return None;
    };
    match revert_data_from_rpc_error(error) {
        Some(data) => Some(decode_revert_reason(&data)),
        None if message.to_ascii_lowercase().contains("revert") => {
            Some(decode_revert_reason(&[]))
        }
        None => None,
    }
}

fn parse_quantity(value: &Value) -> Option<u64> {
    let text = value.as_str()?;
    u64::from_str_radix(text.strip_prefix("0x").unwrap_or(text), 16).ok()
}

pub struct Simulator {
    endpoints: Arc<dyn RpcEndpoints>,
    config: Config,
}

impl Simulator {
    pub fn new(endpoints: Arc<dyn RpcEndpoints>, config: Config) -> Self {
        Self { endpoints, config }
    }

    async fn request(
        &self,
        client: &dyn RpcClient,
        method: &str,
        params: Value,
    ) -> Result<Value, RpcError> {
        let timeout = Duration::from_secs(self.config.simulation.request_timeout_secs);
        debug!("JSON-RPC {}", method);
        tokio::time::timeout(timeout, client.request(method, params))
            .await
            .map_err(|_| RpcError::Transport(format!("{method} timed out after {timeout:?}")))?
    }

    pub async fn simulate(&self, request: &SimulationRequest) -> Result<SimulationResult> {
        let raw = RawTransactionBytes::parse(&request.raw_transaction)?;
        let tx = codec::decode_evm(raw.as_bytes())?;

        let from = match request.from {
            Some(from) => from,
            None => tx.recover_sender()?,
        };

        let mut notes = Vec::new();
        let (network_name, network) =
            resolve_network(&self.config, request.network.as_deref(), tx.chain_id)?;
        if network.chain_id != tx.chain_id {
            notes.push(format!(
                "Transaction is for chain {} but simulating on '{}' (chain {})",
                tx.chain_id, network_name, network.chain_id
            ));
        }
        info!(
            "Simulating {} transaction from {} on {}",
            tx.tx_type.name(),
            from,
            network_name
        );

        let client = self.endpoints.client(network_name)?;
        let call = call_object(&tx, from);
        let block = request.block.clone().unwrap_or_else(|| "latest".to_string());

        let gas_estimate = match self.request(client, "eth_estimateGas", json!([call])).await {
            Ok(value) => parse_quantity(&value),
            Err(e) => {
                debug!("eth_estimateGas failed: {}", e);
                notes.push(format!("Gas estimation failed: {}", e));
                None
            }
        };

        let (success, return_data, revert, error) =
            match self.request(client, "eth_call", json!([call, block])).await {
                Ok(value) => {
                    let data = value
                        .as_str()
                        .and_then(|s| hex::decode(s.strip_prefix("0x").unwrap_or(s)).ok())
                        .map(Bytes::from);
                    (true, data, None, None)
                }
                Err(e) => match revert_from_call_error(&e) {
                    Some(reason) => {
                        info!("Simulation reverted: {}", reason.summary());
                        (false, None, Some(reason), Some(e.to_string()))
                    }
                    None => {
                        return Err(anyhow!(
                            "eth_call failed on {}: {}",
                            network_name,
                            interpret_rpc_error(&e.to_string())
                        ))
                    }
                },
            };

        let (trace_method, trace, trace_error) = if self.config.simulation.trace {
            self.trace(client, &call, &block, &mut notes).await
        } else {
            (None, None, None)
        };

        Ok(SimulationResult {
            network: network_name.to_string(),
            chain_id: tx.chain_id,
            from,
            tx_hash: tx.tx_hash(),
            success,
            gas_estimate,
            return_data,
            revert,
            error,
            trace_method,
            trace,
            trace_error,
            notes,
        })
    }

    /// `debug_traceCall` with the call tracer, then parity-style `trace_call`.
    ///
    /// Only a node that lacks a tracer moves on to the next one; a tracer
    /// that fails is reported in `trace_error`.
    async fn trace(
        &self,
        client: &dyn RpcClient,
        call: &Value,
        block: &str,
        notes: &mut Vec<String>,
    ) -> (Option<String>, Option<Value>, Option<String>) {
        let attempts = [
            ("debug_traceCall", json!([call, block, { "tracer": "callTracer" }])),
            ("trace_call", json!([call, ["trace"], block])),
        ];

        let mut missing = Vec::new();
        for (method, params) in attempts {
            match self.request(client, method, params).await {
                Ok(trace) => return (Some(method.to_string()), Some(trace), None),
                Err(e) if e.is_method_unavailable() => {
                    debug!("{} unavailable: {}", method, e);
                    missing.push(format!("{method}: {e}"));
                }
                Err(e) => {
                    warn!("{} failed: {}", method, e);
                    return (
                        Some(method.to_string()),
                        None,
                        Some(interpret_rpc_error(&e.to_string())),
                    );
                }
            }
        }

        notes.push(format!("Tracing unavailable ({})", missing.join("; ")));
        (None, None, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;
    use std::collections::HashMap;
    use std::sync::Mutex;

    const EIP155_TX: &str = "0xf86c098504a817c800825208943535353535353535353535353535353535353535880de0b6b3a76400008025a028ef61340bd939bc2195fe537567866003e1a15d3c71ff63e1590620aa636276a067cbe9d8997f761aecb703304b3800ccf555c9f3dc64214b297fb1966a3b6d83";

    /// Answers by method name and records the methods called.
    struct FakeNode {
        replies: HashMap<&'static str, Result<Value, (i64, &'static str, Value)>>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeNode {
        fn new(replies: Vec<(&'static str, Result<Value, (i64, &'static str, Value)>)>) -> Arc<Self> {
            Arc::new(Self {
                replies: replies.into_iter().collect(),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RpcClient for FakeNode {
        async fn request(&self, method: &str, _params: Value) -> Result<Value, RpcError> {
            self.calls.lock().unwrap().push(method.to_string());
            match self.replies.get(method) {
                Some(Ok(value)) => Ok(value.clone()),
                Some(Err((code, message, data))) => Err(rpc_error(*code, message, data.clone())),
                None => Err(rpc_error(
                    METHOD_NOT_FOUND,
                    "the method does not exist/is not available",
                    Value::Null,
                )),
            }
        }
    }

    impl RpcEndpoints for FakeNode {
        fn client(&self, _network: &str) -> Result<&dyn RpcClient> {
            let node: &dyn RpcClient = self;
            Ok(node)
        }
    }

    fn rpc_error(code: i64, message: &str, data: Value) -> RpcError {
        RpcError::Rpc {
            code,
            message: message.to_string(),
            error: json!({ "code": code, "message": message, "data": data }),
        }
    }

    fn request() -> SimulationRequest {
        SimulationRequest {
            raw_transaction: EIP155_TX.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_call_object_for_legacy_transaction() {
        let raw = RawTransactionBytes::parse(EIP155_TX).unwrap();
        let tx = codec::decode_evm(raw.as_bytes()).unwrap();
        let from = address!("9d8A62f656a8d1615C1294fd71e9CFb3E4855A4F");

        let call = call_object(&tx, from);
        assert_eq!(call["gas"], "0x5208");
        assert_eq!(call["gasPrice"], "0x4a817c800");
        assert_eq!(call["value"], "0xde0b6b3a7640000");
        assert_eq!(call["nonce"], "0x9");
        assert_eq!(call["data"], "0x");
        assert!(call.get("maxFeePerGas").is_none());
        assert!(call.get("accessList").is_none());
        assert_eq!(
            call["to"].as_str().unwrap().to_ascii_lowercase(),
            "0x3535353535353535353535353535353535353535"
        );
    }

    #[test]
    fn test_resolve_network() {
        let config = Config::default();
        assert_eq!(resolve_network(&config, None, 8453).unwrap().0, "base");
        assert_eq!(resolve_network(&config, None, 999).unwrap().0, "ethereum");
        assert_eq!(
            resolve_network(&config, Some("polygon"), 1).unwrap().0,
            "polygon"
        );
        assert!(resolve_network(&config, Some("nowhere"), 1).is_err());
    }

    #[test]
    fn test_method_unavailable_detection() {
        assert!(rpc_error(METHOD_NOT_FOUND, "Method not found", Value::Null).is_method_unavailable());
        assert!(rpc_error(-32000, "debug namespace is not supported", Value::Null)
            .is_method_unavailable());
        assert!(!rpc_error(3, "execution reverted", json!("0x")).is_method_unavailable());
        assert!(!RpcError::Transport("connection refused".to_string()).is_method_unavailable());
    }

    #[test]
    fn test_provider_manager_serves_configured_networks() {
        let manager = ProviderManager::new(&Config::default()).unwrap();
        assert!(manager.client("base").is_ok());
        assert!(manager.client("nowhere").is_err());
    }

    #[tokio::test]
    async fn test_successful_simulation_with_trace_fallback() {
        let node = FakeNode::new(vec![
            ("eth_estimateGas", Ok(json!("0x5208"))),
            ("eth_call", Ok(json!("0x"))),
            ("trace_call", Ok(json!({ "trace": [] }))),
        ]);
        let simulator = Simulator::new(node.clone(), Config::default());

        let outcome = simulator.simulate(&request()).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.network, "ethereum");
        assert_eq!(
            outcome.from,
            address!("9d8A62f656a8d1615C1294fd71e9CFb3E4855A4F")
        );
        assert_eq!(outcome.gas_estimate, Some(21_000));
        assert_eq!(outcome.trace_method.as_deref(), Some("trace_call"));
        assert!(outcome.trace_error.is_none());
        assert!(outcome.revert.is_none());
        assert_eq!(
            node.calls(),
            vec!["eth_estimateGas", "eth_call", "debug_traceCall", "trace_call"]
        );
    }

    #[tokio::test]
    async fn test_failing_tracer_is_reported_without_fallback() {
        let node = FakeNode::new(vec![
            ("eth_estimateGas", Ok(json!("0x5208"))),
            ("eth_call", Ok(json!("0x"))),
            ("debug_traceCall", Err((-32000, "request timed out", Value::Null))),
            ("trace_call", Ok(json!({ "trace": [] }))),
        ]);
        let simulator = Simulator::new(node.clone(), Config::default());

        let outcome = simulator.simulate(&request()).await.unwrap();
        assert!(outcome.success);
        assert!(outcome.trace.is_none());
        assert_eq!(outcome.trace_method.as_deref(), Some("debug_traceCall"));
        assert!(outcome
            .trace_error
            .as_deref()
            .unwrap()
            .starts_with("Network error"));
        assert!(outcome.notes.is_empty());
        assert!(!node.calls().contains(&"trace_call".to_string()));
    }

    #[tokio::test]
    async fn test_revert_is_decoded() {
        let panic_data = format!("0x4e487b71{:064x}", 0x11);
        let node = FakeNode::new(vec![(
            "eth_call",
            Err((3, "execution reverted", json!(panic_data))),
        )]);
        let simulator = Simulator::new(node, Config::default());

        let outcome = simulator.simulate(&request()).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(
            outcome.revert.unwrap().summary(),
            "Panic(0x11): Arithmetic underflow or overflow"
        );
        assert!(outcome.trace.is_none());
        // gas estimation failed and both tracers are missing
        assert_eq!(outcome.notes.len(), 2);
    }

    #[tokio::test]
    async fn test_infrastructure_error_fails_simulation() {
        let node = FakeNode::new(vec![(
            "eth_call",
            Err((-32005, "rate limit exceeded", Value::Null)),
        )]);
        let simulator = Simulator::new(node, Config::default());

        let err = simulator.simulate(&request()).await.unwrap_err();
        assert!(err.to_string().contains("Rate limit error"));
    }

    #[tokio::test]
    async fn test_from_override_skips_recovery() {
        let node = FakeNode::new(vec![("eth_call", Ok(json!("0x01")))]);
        let mut config = Config::default();
        config.simulation.trace = false;
        let simulator = Simulator::new(node.clone(), config);

        let sender = address!("00000000000000000000000000000000000000aa");
        let outcome = simulator
            .simulate(&SimulationRequest {
                from: Some(sender),
                ..request()
            })
            .await
            .unwrap();
        assert_eq!(outcome.from, sender);
        assert_eq!(outcome.return_data, Some(Bytes::from(vec![0x01])));
        assert!(!node.calls().iter().any(|method| method.contains("trace")));
    }

    #[tokio::test]
    async fn test_rejects_bitcoin_input() {
        let simulator = Simulator::new(FakeNode::new(vec![]), Config::default());
        let outcome = simulator
            .simulate(&SimulationRequest {
                raw_transaction: "0xdeadbeef".to_string(),
                ..Default::default()
            })
            .await;
        assert!(outcome.is_err());
    }
}
