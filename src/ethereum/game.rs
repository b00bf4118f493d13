//! Read-only session over the deployed boss game contract.

use alloy::{
    primitives::{Address, Bytes, LogData, B256, U256},
    providers::{Provider, RootProvider},
    rpc::types::{Filter, TransactionRequest},
    sol,
    sol_types::{SolCall, SolEvent},
    transports::http::{Client, Http},
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::abort::AbortSignal;
use crate::ethereum::provider::ProviderManager;

sol! {
    interface BossGame {
        struct Item {
            uint8 tier;
            uint256 id;
        }

        function getInventory(address player) external view returns (Item[] memory);
        function getTotalBoosts(address player) external view returns (uint16 rarityBps, uint16 successBps);
        function RAKE_FEE() external view returns (uint256);
        function totalBossesKilled() external view returns (uint256);

        event BossKilled(address player, uint8 tier, uint256 itemId, uint256 baseRoll, uint8 baseTier, bool upgraded);
    }
}

/// Buffered events per subscription before the poller waits on the reader.
const SUBSCRIPTION_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub tier: u8,
    pub id: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerState {
    pub player: Address,
    pub inventory: Vec<InventoryItem>,
    pub rarity_bps: u16,
    pub success_bps: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BossKill {
    pub player: Address,
    pub tier: u8,
    pub item_id: U256,
    pub base_roll: U256,
    pub base_tier: u8,
    pub upgraded: bool,
    pub block_number: Option<u64>,
    pub transaction_hash: Option<B256>,
}

pub fn decode_boss_kill(
    data: &LogData,
    block_number: Option<u64>,
    transaction_hash: Option<B256>,
) -> Result<BossKill> {
    let event = BossGame::BossKilled::decode_log_data(data, true)
        .map_err(|e| anyhow!("Failed to decode BossKilled event: {}", e))?;
    Ok(BossKill {
        player: event.player,
        tier: event.tier,
        item_id: event.itemId,
        base_roll: event.baseRoll,
        base_tier: event.baseTier,
        upgraded: event.upgraded,
        block_number,
        transaction_hash,
    })
}

/// Anything that can report boss kills by block range.
#[async_trait]
pub trait BossKillSource: Send + Sync {
    async fn latest_block(&self) -> Result<u64>;
    async fn boss_kills(&self, from_block: u64, to_block: u64) -> Result<Vec<BossKill>>;
}

/// A contract handle bound to one provider for its whole lifetime.
#[derive(Debug, Clone)]
pub struct GameSession {
    provider: RootProvider<Http<Client>>,
    network: String,
    contract: Address,
}

impl GameSession {
    /// Binds to `contract` on `network` after checking code is deployed there.
    pub async fn open(
        provider_manager: &ProviderManager,
        network: Option<&str>,
        contract: Address,
    ) -> Result<Self> {
        let network_name = network
            .map(str::to_string)
            .unwrap_or_else(|| provider_manager.default_network().to_string());
        let provider = provider_manager.get_provider(Some(&network_name))?.clone();

        let code = provider.get_code_at(contract).await.map_err(|e| {
            anyhow!(
                "Failed to check game contract {} on {}: {}",
                contract,
                network_name,
                crate::ethereum::utils::interpret_rpc_error(&e.to_string())
            )
        })?;
        if code.is_empty() {
            return Err(anyhow!(
                "No contract deployed at {} on {}",
                contract,
                network_name
            ));
        }

        info!("Opened game session for {} on {}", contract, network_name);
        Ok(Self {
            provider,
            network: network_name,
            contract,
        })
    }

    pub fn close(self) {
        debug!("Closed game session for {} on {}", self.contract, self.network);
    }

    pub fn contract(&self) -> Address {
        self.contract
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    async fn call<C: SolCall>(&self, call: C) -> Result<C::Return> {
        let request = TransactionRequest::default()
            .to(self.contract)
            .input(Bytes::from(call.abi_encode()).into());
        let output = self.provider.call(&request).await.map_err(|e| {
            anyhow!(
                "{} failed: {}",
                C::SIGNATURE,
                crate::ethereum::utils::interpret_rpc_error(&e.to_string())
            )
        })?;
        C::abi_decode_returns(&output, true)
            .map_err(|e| anyhow!("Failed to decode {} result: {}", C::SIGNATURE, e))
    }

    pub async fn inventory(&self, player: Address) -> Result<Vec<InventoryItem>> {
        let items = self.call(BossGame::getInventoryCall { player }).await?._0;
        Ok(items
            .into_iter()
            .map(|item| InventoryItem {
                tier: item.tier,
                id: item.id,
            })
            .collect())
    }

    /// `(rarity_bps, success_bps)`.
    pub async fn total_boosts(&self, player: Address) -> Result<(u16, u16)> {
        let boosts = self.call(BossGame::getTotalBoostsCall { player }).await?;
        Ok((boosts.rarityBps, boosts.successBps))
    }

    pub async fn rake_fee(&self) -> Result<U256> {
        Ok(self.call(BossGame::RAKE_FEECall {}).await?._0)
    }

    pub async fn total_bosses_killed(&self) -> Result<U256> {
        Ok(self.call(BossGame::totalBossesKilledCall {}).await?._0)
    }

    pub async fn player_state(&self, player: Address) -> Result<PlayerState> {
        let inventory = self.inventory(player).await?;
        let (rarity_bps, success_bps) = self.total_boosts(player).await?;
        Ok(PlayerState {
            player,
            inventory,
            rarity_bps,
            success_bps,
        })
    }

    /// Polls for new kills from `from_block` until aborted or dropped.
    pub fn subscribe_boss_kills(
        &self,
        from_block: u64,
        poll_interval: Duration,
        abort: AbortSignal,
    ) -> BossKillSubscription {
        BossKillSubscription::spawn(Arc::new(self.clone()), from_block, poll_interval, abort)
    }
}

#[async_trait]
impl BossKillSource for GameSession {
    async fn latest_block(&self) -> Result<u64> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| anyhow!("Failed to get latest block: {}", e))
    }

    async fn boss_kills(&self, from_block: u64, to_block: u64) -> Result<Vec<BossKill>> {
        let filter = Filter::new()
            .address(self.contract)
            .event_signature(BossGame::BossKilled::SIGNATURE_HASH)
            .from_block(from_block)
            .to_block(to_block);

        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(|e| anyhow!("Failed to fetch BossKilled logs: {}", e))?;

        logs.iter()
            .map(|log| decode_boss_kill(log.data(), log.block_number, log.transaction_hash))
            .collect()
    }
}

/// A lazy stream of boss kills fed by a background poller.
pub struct BossKillSubscription {
    receiver: mpsc::Receiver<Result<BossKill>>,
    task: JoinHandle<()>,
}

impl BossKillSubscription {
    pub fn spawn(
        source: Arc<dyn BossKillSource>,
        from_block: u64,
        poll_interval: Duration,
        abort: AbortSignal,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let task = tokio::spawn(poll_boss_kills(
            source,
            from_block,
            poll_interval,
            abort,
            sender,
        ));
        Self { receiver, task }
    }

    /// The next kill, or `None` once the subscription has ended.
    pub async fn next(&mut self) -> Option<Result<BossKill>> {
        self.receiver.recv().await
    }
}

impl Drop for BossKillSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Kills from `next_block` up to the head, and the block to resume at.
async fn poll_once(source: &dyn BossKillSource, next_block: u64) -> Result<(Vec<BossKill>, u64)> {
    let latest = source.latest_block().await?;
    if latest < next_block {
        return Ok((Vec::new(), next_block));
    }
    let kills = source.boss_kills(next_block, latest).await?;
    Ok((kills, latest + 1))
}

async fn poll_boss_kills(
    source: Arc<dyn BossKillSource>,
    mut next_block: u64,
    poll_interval: Duration,
    abort: AbortSignal,
    sender: mpsc::Sender<Result<BossKill>>,
) {
    loop {
        if abort.is_aborted() {
            break;
        }

        let outcome = tokio::select! {
            biased;
            _ = abort.aborted() => break,
            outcome = poll_once(source.as_ref(), next_block) => outcome,
        };

        match outcome {
            Ok((kills, resume_at)) => {
                next_block = resume_at;
                for kill in kills {
                    if sender.send(Ok(kill)).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                warn!("BossKilled poll failed: {}", e);
                if sender.send(Err(e)).await.is_err() {
                    return;
                }
            }
        }

        tokio::select! {
            biased;
            _ = abort.aborted() => break,
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
    debug!("BossKilled subscription stopped at block {}", next_block);
}
