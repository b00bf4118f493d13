use anyhow::{anyhow, Result};
use rmcp::{
    model::{ServerCapabilities, ServerInfo},
    tool,
    transport::stdio,
    ServerHandler, ServiceExt,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::{
    abort::{AbortHandle, AbortSignal},
    broadcast::{
        chains::{ChainFamily, Destination},
        retry::RetryPolicy,
        BroadcastResult, Dispatcher,
    },
    codec::{
        self,
        evm::ChainIdSource,
        revert::decode_revert_reason,
        DecodedTransaction, RawTransactionBytes,
    },
    config::Config,
    ethereum::{
        game::{BossKillSource, GameSession},
        provider::ProviderManager,
        simulate::{resolve_network, SimulationRequest, Simulator},
        utils::{normalize_block, validate_address, validate_network},
    },
    lookup::{BitcoinStatusClient, LookupOutcome},
};

/// Abort handle of the broadcast or lookup currently running, if any.
type RunningSlot = Arc<StdMutex<Option<AbortHandle>>>;

/// Owns a claimed [`RunningSlot`] and frees it on drop, including when the
/// tool call is cancelled mid-flight.
struct SlotGuard(RunningSlot);

impl SlotGuard {
    fn claim(slot: &RunningSlot, operation: &str) -> Result<(Self, AbortSignal)> {
        let mut running = slot
            .lock()
            .map_err(|_| anyhow!("{} state is poisoned", operation))?;
        if running.is_some() {
            return Err(anyhow!("A {} is already running. Stop it first.", operation));
        }
        let (handle, signal) = AbortHandle::new();
        *running = Some(handle);
        Ok((Self(Arc::clone(slot)), signal))
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Ok(mut running) = self.0.lock() {
            running.take();
        }
    }
}

/// Signals whatever holds the slot; `false` when nothing is running.
fn abort_running(slot: &RunningSlot) -> bool {
    match slot.lock() {
        Ok(running) => running.as_ref().map(AbortHandle::abort).is_some(),
        Err(_) => false,
    }
}

/// The last broadcast batch, kept for `retry_failed_broadcasts`.
struct BroadcastBatch {
    destination: Destination,
    payloads: Vec<String>,
    results: Vec<BroadcastResult>,
}

#[derive(Clone)]
pub struct RawTxMcpServer {
    config: Arc<Config>,
    provider_manager: Arc<ProviderManager>,
    simulator: Arc<Simulator>,
    dispatcher: Arc<Dispatcher>,
    status_client: Arc<BitcoinStatusClient>,
    running_broadcast: RunningSlot,
    running_lookup: RunningSlot,
    last_batch: Arc<Mutex<Option<BroadcastBatch>>>,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
struct RawTransactionRequest {
    /// Signed transaction as hex (with or without 0x) or base64
    raw_transaction: String,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
struct RevertDataRequest {
    /// Return data of the failed call, hex encoded
    data: String,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
struct SimulateRequest {
    raw_transaction: String,
    /// Overrides the sender recovered from the signature
    from: Option<String>,
    /// Block tag or number, defaults to latest
    block: Option<String>,
    network: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
struct BroadcastRequest {
    /// evm, bitcoin, solana, xrp or stellar
    family: ChainFamily,
    /// One signed payload per entry
    payloads: Option<Vec<String>>,
    /// Pasted text or CSV, one payload per line
    text: Option<String>,
    /// Path to a .txt or .csv file with one payload per line
    file: Option<String>,
    /// EVM network name; inferred from the first payload's chain id when absent
    network: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
struct BitcoinLookupRequest {
    txids: Option<Vec<String>>,
    /// Pasted text or CSV, one txid per line
    text: Option<String>,
    file: Option<String>,
    concurrency: Option<usize>,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
struct PlayerStateRequest {
    player: String,
    contract: Option<String>,
    network: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
struct BossKillsRequest {
    from_block: u64,
    /// Defaults to the latest block
    to_block: Option<u64>,
    contract: Option<String>,
    network: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
struct WatchBossKillsRequest {
    /// Defaults to the block after the current head
    from_block: Option<u64>,
    /// How long to listen, capped at 300 seconds
    duration_secs: u64,
    /// Stop after this many events
    max_events: Option<usize>,
    contract: Option<String>,
    network: Option<String>,
}

/// Decoded fields plus the derived hashes and sender, as shown to callers.
pub fn decode_summary(text: &str) -> Result<Value> {
    let raw = RawTransactionBytes::parse(text)?;
    let kind = codec::detect_type(raw.as_bytes())?;

    let summary = match codec::decode(raw.as_bytes())? {
        DecodedTransaction::Evm(tx) => {
            let sender = tx.recover_sender();
            let mut notes = Vec::new();
            if tx.chain_id_source == ChainIdSource::AssumedMainnet {
                notes.push("Pre-EIP-155 signature: no chain id is signed, chain 1 is assumed");
            }
            if tx.blob.as_ref().is_some_and(|b| b.sidecar_blobs.is_some()) {
                notes.push("Network form: blob sidecar is counted but not decoded");
            }
            json!({
                "kind": kind,
                "tx_type": tx.tx_type.name(),
                "tx_hash": tx.tx_hash(),
                "signing_hash": tx.signing_hash(),
                "sender": sender.as_ref().ok(),
                "sender_error": sender.as_ref().err().map(ToString::to_string),
                "contract_creation": tx.is_contract_creation(),
                "transaction": tx,
                "notes": notes,
            })
        }
        DecodedTransaction::Bitcoin(tx) => {
            let mut notes = Vec::new();
            if tx.has_witness {
                notes.push("Witness data is skipped and not decoded");
            }
            json!({
                "kind": kind,
                "txid": tx.txid,
                "wtxid": tx.wtxid,
                "signals_rbf": tx.signals_rbf(),
                "is_coinbase": tx.is_coinbase(),
                "total_output_value": tx.total_output_value(),
                "transaction": tx,
                "notes": notes,
            })
        }
    };
    Ok(summary)
}

/// Gathers items from an explicit list, pasted text and a file, in that order.
async fn collect_items(
    items: Option<Vec<String>>,
    text: Option<String>,
    file: Option<String>,
) -> Result<Vec<String>> {
    let mut collected: Vec<String> = items
        .unwrap_or_default()
        .into_iter()
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect();

    if let Some(text) = text {
        collected.extend(codec::split_batch_input(&text));
    }

    if let Some(path) = file {
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow!("Failed to read {}: {}", path, e))?;
        collected.extend(codec::split_batch_input(&contents));
    }

    if collected.is_empty() {
        return Err(anyhow!("No input provided"));
    }
    Ok(collected)
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "Failed to serialize result".to_string())
}

fn batch_report(destination: &Destination, results: &[BroadcastResult]) -> Value {
    json!({
        "family": destination.family,
        "endpoint": destination.url,
        "total": results.len(),
        "succeeded": results.iter().filter(|r| r.success).count(),
        "failed": results.iter().filter(|r| !r.success && !r.cancelled).count(),
        "cancelled": results.iter().filter(|r| r.cancelled).count(),
        "results": results,
    })
}

impl RawTxMcpServer {
    pub fn new(config: Config) -> Result<Self> {
        let provider_manager = Arc::new(ProviderManager::new(&config)?);

        let simulator = Arc::new(Simulator::new(provider_manager.clone(), config.clone()));
        let dispatcher = Arc::new(Dispatcher::from_config(&config.broadcast)?);
        let status_client = Arc::new(BitcoinStatusClient::new(
            &config.lookup.mempool_api_url,
            Duration::from_secs(config.broadcast.request_timeout_secs),
            RetryPolicy::from_config(&config.broadcast),
        )?);

        Ok(Self {
            config: Arc::new(config),
            provider_manager,
            simulator,
            dispatcher,
            status_client,
            running_broadcast: RunningSlot::default(),
            running_lookup: RunningSlot::default(),
            last_batch: Arc::new(Mutex::new(None)),
        })
    }

    pub async fn run(&self) -> Result<()> {
        info!("Starting rawtx MCP Server");

        let service = self.clone().serve(stdio()).await?;

        info!("rawtx MCP Server started successfully");
        let _ = service.waiting().await;
        Ok(())
    }

    fn check_network(&self, network: Option<&str>) -> Result<()> {
        match network {
            Some(network) => {
                validate_network(network, &self.provider_manager.get_available_networks())
            }
            None => Ok(()),
        }
    }

    fn evm_rpc_url(&self, network: Option<&str>, first_payload: &str) -> Result<String> {
        self.check_network(network)?;
        let chain_id = RawTransactionBytes::parse(first_payload)
            .ok()
            .and_then(|raw| codec::decode_evm(raw.as_bytes()).ok())
            .map(|tx| tx.chain_id)
            .unwrap_or_default();
        let (name, network) = resolve_network(&self.config, network, chain_id)?;
        info!("Broadcasting EVM payloads through network '{}'", name);
        Ok(network.rpc_url.clone())
    }

    async fn open_game(
        &self,
        contract: Option<String>,
        network: Option<String>,
    ) -> Result<GameSession> {
        let contract = contract
            .or_else(|| self.config.game.contract_address.clone())
            .ok_or_else(|| {
                anyhow!("No game contract given. Pass `contract` or set CONTRACT_ADDRESS")
            })?;
        let contract = validate_address(&contract)?;
        let network = network.or_else(|| self.config.game.network.clone());
        self.check_network(network.as_deref())?;

        GameSession::open(&self.provider_manager, network.as_deref(), contract).await
    }

    async fn broadcast(&self, request: BroadcastRequest) -> Result<Value> {
        if !self.config.security.allow_broadcast {
            return Err(anyhow!(
                "Broadcasting is disabled. Use --allow-broadcast or set security.allow_broadcast to enable it."
            ));
        }

        let payloads = collect_items(request.payloads, request.text, request.file).await?;
        let evm_rpc_url = match request.family {
            ChainFamily::Evm => Some(self.evm_rpc_url(request.network.as_deref(), &payloads[0])?),
            _ => None,
        };
        let destination = Destination::resolve(
            request.family,
            &self.config.broadcast.endpoints,
            evm_rpc_url.as_deref(),
        )?;

        let (guard, signal) = SlotGuard::claim(&self.running_broadcast, "broadcast")?;

        info!(
            "Broadcasting {} payload(s) to {} via {}",
            payloads.len(),
            destination.family,
            destination.url
        );
        let results = self
            .dispatcher
            .broadcast_batch(&destination, &payloads, &signal)
            .await;
        drop(guard);

        let report = batch_report(&destination, &results);
        *self.last_batch.lock().await = Some(BroadcastBatch {
            destination,
            payloads,
            results,
        });
        Ok(report)
    }

    async fn retry_failed(&self) -> Result<Value> {
        if !self.config.security.allow_broadcast {
            return Err(anyhow!("Broadcasting is disabled."));
        }

        let mut last_batch = self.last_batch.lock().await;
        let batch = last_batch
            .as_mut()
            .ok_or_else(|| anyhow!("No previous broadcast to retry"))?;

        let (guard, signal) = SlotGuard::claim(&self.running_broadcast, "broadcast")?;

        batch.results = self
            .dispatcher
            .retry_failed(&batch.destination, &batch.payloads, &batch.results, &signal)
            .await;
        drop(guard);

        Ok(batch_report(&batch.destination, &batch.results))
    }

    async fn check_bitcoin(&self, request: BitcoinLookupRequest) -> Result<Vec<LookupOutcome>> {
        let txids = collect_items(request.txids, request.text, request.file).await?;
        let concurrency = request
            .concurrency
            .unwrap_or(self.config.lookup.concurrency)
            .max(1);

        let (_guard, signal) = SlotGuard::claim(&self.running_lookup, "lookup")?;

        let outcomes = Arc::clone(&self.status_client)
            .check_all(txids, concurrency, signal)
            .await;
        Ok(outcomes)
    }

    async fn watch_boss_kills_inner(&self, request: WatchBossKillsRequest) -> Result<Value> {
        let session = self.open_game(request.contract, request.network).await?;
        let from_block = match request.from_block {
            Some(block) => block,
            None => session.latest_block().await? + 1,
        };
        let duration = Duration::from_secs(request.duration_secs.min(300));
        let max_events = request.max_events.unwrap_or(usize::MAX);

        let (handle, signal) = AbortHandle::new();
        let mut subscription = session.subscribe_boss_kills(
            from_block,
            Duration::from_secs(self.config.game.poll_interval_secs.max(1)),
            signal,
        );

        let mut kills = Vec::new();
        let mut errors = Vec::new();
        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);
        while kills.len() < max_events {
            tokio::select! {
                _ = &mut deadline => break,
                next = subscription.next() => match next {
                    Some(Ok(kill)) => kills.push(kill),
                    Some(Err(e)) => errors.push(e.to_string()),
                    None => break,
                },
            }
        }
        handle.abort();
        session.close();

        Ok(json!({
            "from_block": from_block,
            "events": kills,
            "errors": errors,
        }))
    }
}

#[tool(tool_box)]
impl RawTxMcpServer {
    #[tool(description = "Decode a signed EVM (legacy, EIP-2930, EIP-1559, EIP-4844) or Bitcoin raw transaction")]
    async fn decode_transaction(&self, #[tool(aggr)] request: RawTransactionRequest) -> String {
        match decode_summary(&request.raw_transaction) {
            Ok(summary) => to_json(&summary),
            Err(e) => {
                error!("Failed to decode transaction: {}", e);
                format!("Error: {}", e)
            }
        }
    }

    #[tool(description = "Detect the type of a raw transaction without fully decoding it")]
    async fn detect_transaction_type(
        &self,
        #[tool(aggr)] request: RawTransactionRequest,
    ) -> String {
        let detected = RawTransactionBytes::parse(&request.raw_transaction)
            .and_then(|raw| codec::detect_type(raw.as_bytes()));
        match detected {
            Ok(kind) => to_json(&json!({ "kind": kind, "evm": kind.is_evm() })),
            Err(e) => {
                error!("Failed to detect transaction type: {}", e);
                format!("Error: {}", e)
            }
        }
    }

    #[tool(description = "Decode the return data of a reverted call into Error(string), Panic(uint256) or raw bytes")]
    async fn decode_revert_reason(&self, #[tool(aggr)] request: RevertDataRequest) -> String {
        let data = request.data.trim();
        match hex::decode(data.strip_prefix("0x").unwrap_or(data)) {
            Ok(bytes) => {
                let reason = decode_revert_reason(&bytes);
                to_json(&json!({ "summary": reason.summary(), "reason": reason }))
            }
            Err(e) => {
                error!("Invalid revert data: {}", e);
                format!("Error: revert data must be hex: {}", e)
            }
        }
    }

    #[tool(description = "Simulate a signed EVM transaction with eth_estimateGas, eth_call and a call trace, without broadcasting it")]
    async fn simulate_transaction(&self, #[tool(aggr)] request: SimulateRequest) -> String {
        let prepared = (|| -> Result<SimulationRequest> {
            self.check_network(request.network.as_deref())?;
            Ok(SimulationRequest {
                raw_transaction: request.raw_transaction.clone(),
                from: request.from.as_deref().map(validate_address).transpose()?,
                block: request.block.as_deref().map(normalize_block).transpose()?,
                network: request.network.clone(),
            })
        })();

        let outcome = match prepared {
            Ok(simulation) => self.simulator.simulate(&simulation).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(result) => to_json(&result),
            Err(e) => {
                error!("Failed to simulate transaction: {}", e);
                format!("Error: {}", e)
            }
        }
    }

    #[tool(description = "Broadcast signed transactions in order with retries and rate limiting (requires --allow-broadcast)")]
    async fn broadcast_transactions(&self, #[tool(aggr)] request: BroadcastRequest) -> String {
        match self.broadcast(request).await {
            Ok(report) => to_json(&report),
            Err(e) => {
                error!("Failed to broadcast transactions: {}", e);
                format!("Error: {}", e)
            }
        }
    }

    #[tool(description = "Re-send the failed items of the last broadcast batch")]
    async fn retry_failed_broadcasts(&self) -> String {
        match self.retry_failed().await {
            Ok(report) => to_json(&report),
            Err(e) => {
                error!("Failed to retry broadcasts: {}", e);
                format!("Error: {}", e)
            }
        }
    }

    #[tool(description = "Stop the running broadcast batch and bitcoin status lookup, keeping finished results")]
    async fn stop_broadcast(&self) -> String {
        let mut stopped = Vec::new();
        if abort_running(&self.running_broadcast) {
            stopped.push("broadcast");
        }
        if abort_running(&self.running_lookup) {
            stopped.push("lookup");
        }

        if stopped.is_empty() {
            "Nothing is running".to_string()
        } else {
            warn!("Stop requested for: {}", stopped.join(", "));
            format!("Stopping: {}", stopped.join(", "))
        }
    }

    #[tool(description = "Check confirmation status, fee, coinbase and RBF signalling of bitcoin transactions by txid")]
    async fn check_bitcoin_transactions(
        &self,
        #[tool(aggr)] request: BitcoinLookupRequest,
    ) -> String {
        match self.check_bitcoin(request).await {
            Ok(outcomes) => to_json(&outcomes),
            Err(e) => {
                error!("Failed to check bitcoin transactions: {}", e);
                format!("Error: {}", e)
            }
        }
    }

    #[tool(description = "Read a player's inventory and boosts plus the game's rake fee and kill count")]
    async fn get_player_state(&self, #[tool(aggr)] request: PlayerStateRequest) -> String {
        let outcome = async {
            let player = validate_address(&request.player)?;
            let session = self.open_game(request.contract, request.network).await?;
            let state = session.player_state(player).await?;
            let rake_fee = session.rake_fee().await?;
            let total_bosses_killed = session.total_bosses_killed().await?;
            let contract = session.contract();
            let network = session.network().to_string();
            session.close();
            Ok::<_, anyhow::Error>(json!({
                "contract": contract,
                "network": network,
                "player_state": state,
                "rake_fee": rake_fee,
                "total_bosses_killed": total_bosses_killed,
            }))
        }
        .await;

        match outcome {
            Ok(report) => to_json(&report),
            Err(e) => {
                error!("Failed to read player state: {}", e);
                format!("Error: {}", e)
            }
        }
    }

    #[tool(description = "List BossKilled events emitted by the game contract in a block range")]
    async fn get_boss_kills(&self, #[tool(aggr)] request: BossKillsRequest) -> String {
        let outcome = async {
            let session = self.open_game(request.contract, request.network).await?;
            let to_block = match request.to_block {
                Some(block) => block,
                None => session.latest_block().await?,
            };
            if to_block < request.from_block {
                return Err(anyhow!(
                    "to_block {} is before from_block {}",
                    to_block,
                    request.from_block
                ));
            }
            let kills = session.boss_kills(request.from_block, to_block).await?;
            session.close();
            Ok::<_, anyhow::Error>(kills)
        }
        .await;

        match outcome {
            Ok(kills) => to_json(&kills),
            Err(e) => {
                error!("Failed to get boss kills: {}", e);
                format!("Error: {}", e)
            }
        }
    }

    #[tool(description = "Listen for new BossKilled events for a bounded time")]
    async fn watch_boss_kills(&self, #[tool(aggr)] request: WatchBossKillsRequest) -> String {
        match self.watch_boss_kills_inner(request).await {
            Ok(report) => to_json(&report),
            Err(e) => {
                error!("Failed to watch boss kills: {}", e);
                format!("Error: {}", e)
            }
        }
    }
}

#[tool(tool_box)]
impl ServerHandler for RawTxMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some("MCP server for raw blockchain transactions. Decodes EVM and Bitcoin payloads, decodes revert reasons, simulates EVM transactions, broadcasts batches to EVM, Bitcoin, Solana, XRP and Stellar endpoints with retries, checks bitcoin confirmations, and reads the boss game contract.".into()),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}
