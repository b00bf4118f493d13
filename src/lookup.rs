//! Concurrent batch lookups against REST explorers.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::abort::AbortSignal;
use crate::broadcast::retry::RetryPolicy;
use crate::codec::bitcoin::RBF_SEQUENCE_THRESHOLD;

/// Runs `worker` over `items` on `concurrency` tasks sharing one cursor.
///
/// Results come back in input order. Items not finished when `abort`
/// fires are `None`; finished ones are kept.
pub async fn run_batch<T, R, F, Fut>(
    items: Vec<T>,
    concurrency: usize,
    abort: AbortSignal,
    worker: F,
) -> Vec<Option<R>>
where
    T: Clone + Send + Sync + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
{
    let total = items.len();
    let items = Arc::new(items);
    let cursor = Arc::new(AtomicUsize::new(0));
    let worker = Arc::new(worker);
    let workers = concurrency.clamp(1, total.max(1));

    let mut handles = Vec::with_capacity(workers);
    for worker_id in 0..workers {
        let items = Arc::clone(&items);
        let cursor = Arc::clone(&cursor);
        let worker = Arc::clone(&worker);
        let abort = abort.clone();

        handles.push(tokio::spawn(async move {
            let mut finished = Vec::new();
            while !abort.is_aborted() {
                let index = cursor.fetch_add(1, Ordering::SeqCst);
                let Some(item) = items.get(index).cloned() else {
                    break;
                };
                let result = tokio::select! {
                    biased;
                    _ = abort.aborted() => break,
                    result = worker(item) => result,
                };
                finished.push((index, result));
            }
            debug!("Lookup worker {} finished {} item(s)", worker_id, finished.len());
            finished
        }));
    }

    let mut results: Vec<Option<R>> = (0..total).map(|_| None).collect();
    for handle in handles {
        match handle.await {
            Ok(finished) => {
                for (index, result) in finished {
                    results[index] = Some(result);
                }
            }
            Err(e) => warn!("Lookup worker stopped unexpectedly: {}", e),
        }
    }
    results
}

/// Confirmation state of one bitcoin transaction as reported by mempool.space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitcoinTxStatus {
    pub txid: String,
    pub confirmed: bool,
    pub block_height: Option<u64>,
    pub fee: Option<u64>,
    /// Explorer-reported flag, not derived from the raw inputs.
    pub is_coinbase: bool,
    pub signals_rbf: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LookupOutcome {
    Found(BitcoinTxStatus),
    Failed { txid: String, error: String },
    Cancelled { txid: String },
}

pub fn validate_txid(txid: &str) -> Result<()> {
    if txid.len() != 64 || !txid.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(anyhow!(
            "Invalid txid: '{}'. Expected 64 hexadecimal characters",
            txid
        ));
    }
    Ok(())
}

/// Reads the fields we report from a `GET /tx/{txid}` body.
pub fn status_from_mempool(txid: &str, body: &Value) -> Result<BitcoinTxStatus> {
    let vin = body["vin"]
        .as_array()
        .ok_or_else(|| anyhow!("Malformed explorer reply for {}: missing vin", txid))?;

    let is_coinbase = vin
        .first()
        .and_then(|input| input["is_coinbase"].as_bool())
        .unwrap_or(false);
    let signals_rbf = vin.iter().any(|input| {
        input["sequence"]
            .as_u64()
            .is_some_and(|sequence| sequence < u64::from(RBF_SEQUENCE_THRESHOLD))
    });

    let status = &body["status"];
    Ok(BitcoinTxStatus {
        txid: body["txid"].as_str().unwrap_or(txid).to_string(),
        confirmed: status["confirmed"].as_bool().unwrap_or(false),
        block_height: status["block_height"].as_u64(),
        fee: body["fee"].as_u64(),
        is_coinbase,
        signals_rbf,
    })
}

pub struct BitcoinStatusClient {
    client: reqwest::Client,
    base_url: String,
    policy: RetryPolicy,
}

impl BitcoinStatusClient {
    pub fn new(base_url: &str, timeout: Duration, policy: RetryPolicy) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow!("Failed to build HTTP client: {}", e))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            policy,
        })
    }

    /// Fetches one transaction, retrying rate limits and server errors.
    pub async fn fetch(&self, txid: &str) -> Result<BitcoinTxStatus> {
        validate_txid(txid)?;
        let url = format!("{}/tx/{}", self.base_url, txid);

        let mut attempt = 0;
        loop {
            attempt += 1;
            let failure = match self.client.get(&url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let body: Value = response
                            .json()
                            .await
                            .map_err(|e| anyhow!("Invalid explorer reply for {}: {}", txid, e))?;
                        return status_from_mempool(txid, &body);
                    }
                    if status.as_u16() == 404 {
                        return Err(anyhow!("Transaction {} not found", txid));
                    }
                    if status.as_u16() != 429 && !status.is_server_error() {
                        let text = response.text().await.unwrap_or_default();
                        return Err(anyhow!("Explorer returned HTTP {}: {}", status, text.trim()));
                    }
                    format!("HTTP {}", status)
                }
                Err(e) => e.to_string(),
            };

            if attempt > self.policy.max_retries {
                return Err(anyhow!(
                    "Lookup of {} failed after {} attempts: {}",
                    txid,
                    attempt,
                    failure
                ));
            }
            let delay = self.policy.delay_for(attempt);
            debug!("Lookup of {} failed ({}), retrying in {:?}", txid, failure, delay);
            tokio::time::sleep(delay).await;
        }
    }

    /// Looks up every txid with `concurrency` workers.
    pub async fn check_all(
        self: Arc<Self>,
        txids: Vec<String>,
        concurrency: usize,
        abort: AbortSignal,
    ) -> Vec<LookupOutcome> {
        info!(
            "Checking {} bitcoin transaction(s) with {} worker(s)",
            txids.len(),
            concurrency
        );
        let client = Arc::clone(&self);
        let results = run_batch(txids.clone(), concurrency, abort, move |txid: String| {
            let client = Arc::clone(&client);
            async move {
                match client.fetch(&txid).await {
                    Ok(status) => LookupOutcome::Found(status),
                    Err(e) => LookupOutcome::Failed {
                        txid,
                        error: e.to_string(),
                    },
                }
            }
        })
        .await;

        results
            .into_iter()
            .zip(txids)
            .map(|(result, txid)| result.unwrap_or(LookupOutcome::Cancelled { txid }))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abort::AbortHandle;
    use serde_json::json;

    #[tokio::test]
    async fn test_results_keep_input_order() {
        let items: Vec<u64> = (0..20).collect();
        let results = run_batch(items, 4, AbortSignal::never(), |n: u64| async move {
            // Later items finish first.
            tokio::time::sleep(Duration::from_millis(20 - n)).await;
            n * 10
        })
        .await;

        let expected: Vec<Option<u64>> = (0..20).map(|n| Some(n * 10)).collect();
        assert_eq!(results, expected);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let results = run_batch((0..12).collect::<Vec<u32>>(), 3, AbortSignal::never(), {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            move |_| {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                }
            }
        })
        .await;

        assert!(results.iter().all(Option::is_some));
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let results = run_batch(Vec::<u8>::new(), 8, AbortSignal::never(), |n| async move { n })
            .await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_abort_keeps_finished_results() {
        let (handle, signal) = AbortHandle::new();
        let handle = Arc::new(handle);

        let results = run_batch((0..10).collect::<Vec<u32>>(), 1, signal, {
            let handle = Arc::clone(&handle);
            move |n| {
                let handle = Arc::clone(&handle);
                async move {
                    if n == 2 {
                        handle.abort();
                        std::future::pending::<()>().await;
                    }
                    n
                }
            }
        })
        .await;

        assert_eq!(results[0], Some(0));
        assert_eq!(results[1], Some(1));
        assert!(results[2..].iter().all(Option::is_none));
    }

    #[test]
    fn test_validate_txid() {
        assert!(validate_txid(&"ab".repeat(32)).is_ok());
        assert!(validate_txid("abcd").is_err());
        assert!(validate_txid(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn test_status_from_mempool_reply() {
        let txid = "cd".repeat(32);
        let body = json!({
            "txid": txid,
            "fee": 1410,
            "vin": [
                { "txid": "ab".repeat(32), "vout": 0, "is_coinbase": false, "sequence": 4294967293u64 },
                { "txid": "ef".repeat(32), "vout": 1, "is_coinbase": false, "sequence": 4294967295u64 }
            ],
            "status": { "confirmed": true, "block_height": 840000, "block_hash": "00" }
        });

        let status = status_from_mempool(&txid, &body).unwrap();
        assert!(status.confirmed);
        assert_eq!(status.block_height, Some(840_000));
        assert_eq!(status.fee, Some(1410));
        assert!(status.signals_rbf);
        assert!(!status.is_coinbase);
    }

    #[test]
    fn test_unconfirmed_coinbase_reply() {
        let txid = "00".repeat(32);
        let body = json!({
            "vin": [{ "is_coinbase": true, "sequence": 4294967295u64 }],
            "status": { "confirmed": false }
        });

        let status = status_from_mempool(&txid, &body).unwrap();
        assert_eq!(status.txid, txid);
        assert!(!status.confirmed);
        assert_eq!(status.block_height, None);
        assert!(status.is_coinbase);
        assert!(!status.signals_rbf);

        assert!(status_from_mempool(&txid, &json!({ "status": {} })).is_err());
    }
}
