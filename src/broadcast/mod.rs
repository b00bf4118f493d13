pub mod chains;
pub mod retry;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::abort::AbortSignal;
use crate::config::BroadcastConfig;
use chains::{Destination, OutboundRequest, RequestBody};
use retry::{classify, FailureClass, RetryPolicy};

/// Inline error messages are cut to this many characters.
pub const DISPLAY_ERROR_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

/// Failures below HTTP: no status, no body.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("network error: {0}")]
    Network(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(&self, request: &OutboundRequest) -> Result<HttpReply, TransportError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow!("Failed to build HTTP client: {}", e))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, request: &OutboundRequest) -> Result<HttpReply, TransportError> {
        let builder = self.client.post(&request.url);
        let builder = match &request.body {
            RequestBody::Json(body) => builder.json(body),
            RequestBody::Text(body) => builder
                .header(reqwest::header::CONTENT_TYPE, "text/plain")
                .body(body.clone()),
            RequestBody::Form(fields) => builder.form(fields),
        };

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(e.to_string())
            } else {
                TransportError::Network(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Ok(HttpReply { status, body })
    }
}

/// Outcome of one payload in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastResult {
    pub index: usize,
    pub success: bool,
    /// Hash reported by the endpoint.
    pub tx_hash: Option<String>,
    /// Hash computed from the payload before sending, where the codec knows how.
    pub expected_tx_hash: Option<String>,
    /// Truncated for inline display.
    pub error: Option<String>,
    pub full_error: Option<String>,
    pub retryable: bool,
    pub http_status: Option<u16>,
    pub attempts: u32,
    pub exhausted_retries: bool,
    /// Stopped before completing. Never set on a success.
    pub cancelled: bool,
}

impl BroadcastResult {
    fn succeeded(index: usize, tx_hash: String, http_status: u16, attempts: u32) -> Self {
        Self {
            index,
            success: true,
            tx_hash: Some(tx_hash),
            expected_tx_hash: None,
            error: None,
            full_error: None,
            retryable: false,
            http_status: Some(http_status),
            attempts,
            exhausted_retries: false,
            cancelled: false,
        }
    }

    fn failed(index: usize, message: String, http_status: Option<u16>, attempts: u32) -> Self {
        Self {
            index,
            success: false,
            tx_hash: None,
            expected_tx_hash: None,
            error: Some(truncate_message(&message, DISPLAY_ERROR_LIMIT)),
            full_error: Some(message),
            retryable: false,
            http_status,
            attempts,
            exhausted_retries: false,
            cancelled: false,
        }
    }

    fn cancelled(index: usize, attempts: u32) -> Self {
        Self {
            cancelled: true,
            retryable: true,
            ..Self::failed(index, "Broadcast stopped".to_string(), None, attempts)
        }
    }
}

/// First `limit` characters followed by `...` when the message is longer.
pub fn truncate_message(message: &str, limit: usize) -> String {
    match message.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}...", &message[..cut]),
        None => message.to_string(),
    }
}

pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    send_interval: Duration,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy, send_interval: Duration) -> Self {
        Self {
            transport,
            policy,
            send_interval,
        }
    }

    pub fn from_config(config: &BroadcastConfig) -> Result<Self> {
        let transport = HttpTransport::new(Duration::from_secs(config.request_timeout_secs))?;
        Ok(Self::new(
            Arc::new(transport),
            RetryPolicy::from_config(config),
            retry::send_interval(config.transactions_per_minute),
        ))
    }

    /// Sends one payload, retrying transient failures with backoff.
    pub async fn broadcast_one(
        &self,
        destination: &Destination,
        index: usize,
        payload: &str,
        abort: &AbortSignal,
    ) -> BroadcastResult {
        if abort.is_aborted() {
            return BroadcastResult::cancelled(index, 0);
        }

        let request = match chains::build_request(destination, payload) {
            Ok(request) => request,
            Err(e) => {
                warn!("Rejected payload #{} before sending: {}", index, e);
                return BroadcastResult::failed(index, e.to_string(), None, 0);
            }
        };

        let mut result = self.send_with_retries(destination, index, &request, abort).await;
        if let (Some(expected), Some(reported)) = (&request.expected_tx_hash, &result.tx_hash) {
            let bare = |hash: &str| hash.trim_start_matches("0x").to_ascii_lowercase();
            if bare(expected) != bare(reported) {
                warn!(
                    "Payload #{} was accepted as {} but hashes locally to {}",
                    index, reported, expected
                );
            }
        }
        result.expected_tx_hash = request.expected_tx_hash;
        result
    }

    async fn send_with_retries(
        &self,
        destination: &Destination,
        index: usize,
        request: &OutboundRequest,
        abort: &AbortSignal,
    ) -> BroadcastResult {
        let max_attempts = self.policy.max_retries.saturating_add(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            debug!(
                "Sending payload #{} to {} ({}), attempt {}/{}",
                index, destination.family, request.url, attempt, max_attempts
            );

            let outcome = tokio::select! {
                biased;
                _ = abort.aborted() => return BroadcastResult::cancelled(index, attempt),
                outcome = self.transport.post(request) => outcome,
            };

            let (message, status, class) = match outcome {
                Ok(reply) => match chains::parse_reply(destination, reply.status, &reply.body) {
                    Ok(tx_hash) => {
                        info!("Payload #{} accepted: {}", index, tx_hash);
                        return BroadcastResult::succeeded(index, tx_hash, reply.status, attempt);
                    }
                    Err(message) => {
                        let class = classify(Some(reply.status), &message);
                        (message, Some(reply.status), class)
                    }
                },
                // Nothing reached the node, so resending is always safe.
                Err(e) => (e.to_string(), None, FailureClass::Retryable),
            };

            if class == FailureClass::Permanent {
                warn!("Payload #{} failed permanently: {}", index, message);
                return BroadcastResult::failed(index, message, status, attempt);
            }

            if attempt >= max_attempts {
                warn!(
                    "Payload #{} still failing after {} attempts: {}",
                    index, attempt, message
                );
                return BroadcastResult {
                    retryable: true,
                    exhausted_retries: true,
                    ..BroadcastResult::failed(index, message, status, attempt)
                };
            }

            let delay = self.policy.delay_for(attempt);
            debug!(
                "Payload #{} hit a retryable error ({}), retrying in {:?}",
                index, message, delay
            );
            tokio::select! {
                biased;
                _ = abort.aborted() => return BroadcastResult::cancelled(index, attempt),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Sends payloads one at a time in input order, spaced by the rate limit.
    ///
    /// A failed item never stops the batch. After an abort, every item not
    /// yet finished is reported as cancelled and finished ones are kept.
    pub async fn broadcast_batch(
        &self,
        destination: &Destination,
        payloads: &[String],
        abort: &AbortSignal,
    ) -> Vec<BroadcastResult> {
        let indexed: Vec<(usize, &str)> = payloads
            .iter()
            .enumerate()
            .map(|(index, payload)| (index, payload.as_str()))
            .collect();
        self.send_in_order(destination, &indexed, abort).await
    }

    /// Re-sends every item that did not succeed, keeping earlier successes.
    pub async fn retry_failed(
        &self,
        destination: &Destination,
        payloads: &[String],
        previous: &[BroadcastResult],
        abort: &AbortSignal,
    ) -> Vec<BroadcastResult> {
        let pending: Vec<(usize, &str)> = previous
            .iter()
            .filter(|result| !result.success)
            .filter_map(|result| {
                payloads
                    .get(result.index)
                    .map(|payload| (result.index, payload.as_str()))
            })
            .collect();
        info!("Retrying {} failed payload(s)", pending.len());

        let mut merged: Vec<BroadcastResult> = previous.to_vec();
        for fresh in self.send_in_order(destination, &pending, abort).await {
            if let Some(slot) = merged.iter_mut().find(|r| r.index == fresh.index) {
                *slot = fresh;
            }
        }
        merged
    }

    async fn send_in_order(
        &self,
        destination: &Destination,
        items: &[(usize, &str)],
        abort: &AbortSignal,
    ) -> Vec<BroadcastResult> {
        let mut results = Vec::with_capacity(items.len());

        for (position, (index, payload)) in items.iter().enumerate() {
            if position > 0 && !self.send_interval.is_zero() && !abort.is_aborted() {
                tokio::select! {
                    biased;
                    _ = abort.aborted() => {}
                    _ = tokio::time::sleep(self.send_interval) => {}
                }
            }

            if abort.is_aborted() {
                results.push(BroadcastResult::cancelled(*index, 0));
                continue;
            }

            results.push(self.broadcast_one(destination, *index, payload, abort).await);
        }

        let succeeded = results.iter().filter(|r| r.success).count();
        info!(
            "Broadcast finished: {}/{} succeeded on {}",
            succeeded,
            results.len(),
            destination.family
        );
        results
    }
}
