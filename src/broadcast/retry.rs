use rand::Rng;
use regex::RegexSet;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;

use crate::config::BroadcastConfig;

/// Upper bound for a single backoff sleep.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Failures that resending the same bytes can never fix. Checked first.
pub const PERMANENT_FAILURE_PATTERNS: &[&str] = &[
    r"nonce too (low|high)",
    r"invalid nonce|bad nonce|tx_bad_seq|tefPAST_SEQ",
    r"already known|already imported|already in (the )?(mempool|block ?chain)|txn-already-known",
    r"insufficient (funds|balance)|tx_insufficient_balance|tecUNFUNDED",
    r"invalid (signature|sender)|bad signature|signature verification failed",
    r"(replacement )?transaction underpriced|fee too low|min relay fee not met",
    r"intrinsic gas too low|exceeds block gas limit|gas limit reached",
    r"invalid chain ?id|chain ?id mismatch|only replay-protected",
    r"missing inputs|missingorspent|txn-mempool-conflict|bad-txns",
    r"mandatory-script-verify-flag|non-mandatory-script-verify-flag|\bdust\b",
    r"(rlp|decode|deserializ\w*|parse) (error|failed)|failed to (decode|deserialize)",
    r"invalid (transaction|tx|raw transaction)|malformed",
    r"blockhash not found|tefMAX_LEDGER|(?-i:\btem[A-Z_]+\b)",
];

/// Transient failures worth another attempt.
pub const RETRYABLE_PATTERNS: &[&str] = &[
    r"rate ?limit|too many requests|\b429\b",
    r"timed? ?out|timeout|etimedout",
    r"temporar(y|ily) unavailable|service unavailable|\b50[234]\b",
    r"bad gateway|gateway time-?out|internal server error",
    r"connection (reset|refused|closed|aborted)|econnreset|network error",
    r"header not found|try again|overloaded|server busy|terQUEUED",
];

fn permanent_set() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| {
        RegexSet::new(PERMANENT_FAILURE_PATTERNS.iter().map(|p| format!("(?i){p}")))
            .expect("permanent failure patterns are valid")
    })
}

fn retryable_set() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| {
        RegexSet::new(RETRYABLE_PATTERNS.iter().map(|p| format!("(?i){p}")))
            .expect("retryable patterns are valid")
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Retryable,
    Permanent,
}

/// Classifies a failed send from its HTTP status and error text.
///
/// HTTP 429 is always retryable. Otherwise the permanent table wins over
/// everything, including 5xx statuses. Unrecognised messages are permanent.
pub fn classify(status: Option<u16>, message: &str) -> FailureClass {
    if status == Some(429) {
        return FailureClass::Retryable;
    }
    if permanent_set().is_match(message) {
        return FailureClass::Permanent;
    }
    if status.is_some_and(|s| (500..600).contains(&s)) || retryable_set().is_match(message) {
        return FailureClass::Retryable;
    }
    FailureClass::Permanent
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_jitter: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &BroadcastConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_jitter: Duration::from_millis(config.max_jitter_ms),
        }
    }

    /// `base * 2^(attempt - 1)`, before jitter and the cap.
    pub fn exponential_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Sleep before retrying after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter_ms = match u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX) {
            0 => 0,
            max => rand::thread_rng().gen_range(0..=max),
        };
        self.exponential_delay(attempt)
            .saturating_add(Duration::from_millis(jitter_ms))
            .min(MAX_BACKOFF)
    }
}

/// Spacing between sequential sends for a transactions-per-minute budget.
pub fn send_interval(transactions_per_minute: Option<u32>) -> Duration {
    match transactions_per_minute {
        Some(tpm) if tpm > 0 => Duration::from_millis(60_000 / u64::from(tpm)),
        _ => Duration::ZERO,
    }
}
