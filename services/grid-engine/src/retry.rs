//! Exchange error classification and retry backoff
//!
//! Formula: min(max, base * 2^(attempt-1)) +/- jitter, floored by the
//! venue's retry-after hint.

use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::executor::{ExchangeError, OrderRequest};

/// Retry taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClass {
    Transient,
    RateLimit,
    Auth,
    BadRequest,
    InsufficientFunds,
    Unknown,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Transient | ErrorClass::RateLimit)
    }

    /// Stable code written to a bot's `last_error` when this class is fatal
    pub fn code(self) -> &'static str {
        match self {
            ErrorClass::Transient => "EXCHANGE_TRANSIENT",
            ErrorClass::RateLimit => "EXCHANGE_RATE_LIMIT",
            ErrorClass::Auth => "EXCHANGE_AUTH",
            ErrorClass::BadRequest => "EXCHANGE_BAD_REQUEST",
            ErrorClass::InsufficientFunds => "INSUFFICIENT_FUNDS",
            ErrorClass::Unknown => "EXCHANGE_UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub class: ErrorClass,
    pub retry_after_ms: Option<u64>,
}

impl Classification {
    fn of(class: ErrorClass) -> Self {
        Self {
            class,
            retry_after_ms: None,
        }
    }
}

const RATE_LIMIT_SIGNS: &[&str] = &[
    "rate limit",
    "ratelimit",
    "too many requests",
    "too many orders",
];
const TIMEOUT_SIGNS: &[&str] = &["timeout", "timed out", "etimedout", "deadline exceeded"];
const NETWORK_SIGNS: &[&str] = &[
    "econnreset",
    "connection reset",
    "econnrefused",
    "connection refused",
    "enotfound",
    "eai_again",
    "dns",
    "socket hang up",
    "broken pipe",
    "service unavailable",
    "bad gateway",
];
const AUTH_SIGNS: &[&str] = &[
    "signature",
    "permission",
    "unauthorized",
    "forbidden",
    "api key",
    "api-key",
    "invalid key",
];
const FUNDS_SIGNS: &[&str] = &["insufficient", "not enough balance"];
const BAD_REQUEST_SIGNS: &[&str] = &[
    "precision",
    "invalid parameter",
    "invalid quantity",
    "invalid price",
    "min notional",
    "lot size",
    "bad request",
];

// HTTP-style status codes, compared against the venue `code` field only.
// Messages carry amounts and offsets that would otherwise match.
const RATE_LIMIT_CODES: &[&str] = &["429"];
const NETWORK_CODES: &[&str] = &["502", "503", "504"];
const AUTH_CODES: &[&str] = &["401", "403"];
const BAD_REQUEST_CODES: &[&str] = &["400"];

fn matches_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

fn code_is(code: &str, codes: &[&str]) -> bool {
    codes.contains(&code)
}

/// Map an executor error onto the retry taxonomy
pub fn classify(err: &ExchangeError) -> Classification {
    match err {
        ExchangeError::Timeout(_) | ExchangeError::Network(_) => {
            Classification::of(ErrorClass::Transient)
        }
        ExchangeError::Server { status, .. } if *status >= 500 => {
            Classification::of(ErrorClass::Transient)
        }
        ExchangeError::Server { status: 429, .. } => Classification::of(ErrorClass::RateLimit),
        ExchangeError::Server { message, .. } => classify_text(None, message, None),
        ExchangeError::RateLimited { retry_after_ms, .. } => Classification {
            class: ErrorClass::RateLimit,
            retry_after_ms: *retry_after_ms,
        },
        ExchangeError::Auth(_) => Classification::of(ErrorClass::Auth),
        ExchangeError::BadRequest(_) | ExchangeError::OrderNotFound(_) => {
            Classification::of(ErrorClass::BadRequest)
        }
        ExchangeError::InsufficientFunds(_) => Classification::of(ErrorClass::InsufficientFunds),
        ExchangeError::Venue {
            code,
            message,
            retryable,
            retry_after_ms,
        } => {
            if retry_after_ms.is_some() {
                return Classification {
                    class: ErrorClass::RateLimit,
                    retry_after_ms: *retry_after_ms,
                };
            }
            if *retryable == Some(true) {
                return Classification::of(ErrorClass::Transient);
            }
            classify_text(code.as_deref(), message, *retryable)
        }
    }
}

fn classify_text(code: Option<&str>, message: &str, retryable: Option<bool>) -> Classification {
    let code = code.map(str::trim).unwrap_or_default();
    let text = format!("{} {}", code, message).to_lowercase();
    let may_retry = retryable != Some(false);

    // Non-retryable signatures first, so a retryable word in the message
    // cannot turn a funds or auth failure into a retry loop
    if matches_any(&text, FUNDS_SIGNS) {
        return Classification::of(ErrorClass::InsufficientFunds);
    }
    if code_is(code, AUTH_CODES) || matches_any(&text, AUTH_SIGNS) {
        return Classification::of(ErrorClass::Auth);
    }
    if may_retry && (code_is(code, RATE_LIMIT_CODES) || matches_any(&text, RATE_LIMIT_SIGNS)) {
        return Classification::of(ErrorClass::RateLimit);
    }
    if may_retry
        && (code_is(code, NETWORK_CODES)
            || matches_any(&text, TIMEOUT_SIGNS)
            || matches_any(&text, NETWORK_SIGNS))
    {
        return Classification::of(ErrorClass::Transient);
    }
    if code_is(code, BAD_REQUEST_CODES) || matches_any(&text, BAD_REQUEST_SIGNS) {
        return Classification::of(ErrorClass::BadRequest);
    }
    Classification::of(ErrorClass::Unknown)
}

/// Backoff parameters
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct BackoffPolicy {
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
    /// Total jitter band as a fraction of the delay; the delay moves by at
    /// most half of it in either direction
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
    /// Attempts per intent before the failure becomes fatal
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: default_base_ms(),
            max_ms: default_max_ms(),
            jitter_ratio: default_jitter_ratio(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_base_ms() -> u64 {
    1_000
}

fn default_max_ms() -> u64 {
    30_000
}

fn default_jitter_ratio() -> f64 {
    0.2
}

fn default_max_attempts() -> u32 {
    5
}

/// Delay before retry number `attempt` (1-based)
pub fn compute_backoff<R: Rng + ?Sized>(
    policy: &BackoffPolicy,
    attempt: u32,
    retry_after_ms: Option<u64>,
    rng: &mut R,
) -> Duration {
    let attempt = attempt.max(1);
    let factor = 2u64.checked_pow(attempt - 1).unwrap_or(u64::MAX);
    let exp = policy.base_ms.saturating_mul(factor).min(policy.max_ms);

    let ratio = if policy.jitter_ratio.is_finite() {
        policy.jitter_ratio.max(0.0)
    } else {
        0.0
    };
    let band = exp as f64 * ratio / 2.0;
    let jitter = if band > 0.0 {
        rng.gen_range(-band..=band)
    } else {
        0.0
    };
    let jittered = (exp as f64 + jitter).max(0.0).round() as u64;

    let floored = match retry_after_ms {
        Some(hint) => jittered.max(hint),
        None => jittered,
    };
    Duration::from_millis(floored)
}

/// An intent waiting for another attempt
#[derive(Debug, Clone)]
pub struct PendingIntent {
    pub intent_seq: i64,
    pub request: OrderRequest,
    /// Grid anchor once the order lands
    pub anchor_price: Decimal,
    /// Attempts made so far
    pub attempts: u32,
    pub ready_at: Instant,
    pub last_error: String,
}

/// In-memory retry state per bot. Lost on restart; after a restart
/// the deterministic client order id prevents duplicate orders.
#[derive(Debug, Default)]
pub struct RetryBook {
    pending: HashMap<Uuid, PendingIntent>,
}

impl RetryBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, bot_id: Uuid, intent: PendingIntent) {
        debug!(
            bot_id = %bot_id,
            client_order_id = %intent.request.client_order_id,
            attempts = intent.attempts,
            "Scheduled retry"
        );
        self.pending.insert(bot_id, intent);
    }

    pub fn get(&self, bot_id: &Uuid) -> Option<&PendingIntent> {
        self.pending.get(bot_id)
    }

    /// Remove and return the pending intent when its backoff has elapsed
    pub fn take_due(&mut self, bot_id: &Uuid, now: Instant) -> Option<PendingIntent> {
        match self.pending.get(bot_id) {
            Some(p) if p.ready_at <= now => self.pending.remove(bot_id),
            _ => None,
        }
    }

    pub fn clear(&mut self, bot_id: &Uuid) -> Option<PendingIntent> {
        self.pending.remove(bot_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
