//! Fixed-window request counting.
//!
//! Each identity gets one counter per window. The counter's expiry is set on
//! its first increment, so stale windows clean themselves up.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::debug;

use super::{KeyValueStore, StoreError};
use crate::config::RateLimitPolicy;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RateLimitError {
    #[error("Rate limit exceeded: {limit} requests per {}s", .window.as_secs())]
    Limited {
        limit: u64,
        window: Duration,
        retry_after: Duration,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Who a request is counted against
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// A validated API key
    Token(String),
    /// Caller address
    Ip(String),
}

impl Identity {
    /// Counter id; tokens are shortened so the full secret never reaches the store key
    pub fn id(&self) -> String {
        match self {
            Identity::Token(token) => {
                format!("simple-token:{}", token.get(3..13).unwrap_or(token))
            }
            Identity::Ip(ip) => format!("ip:{}", ip),
        }
    }
}

/// Outcome of one counted request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_after: Duration,
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Start of the window containing `now_secs`, and seconds until it ends
pub fn window_bounds(now_secs: u64, window: Duration) -> (u64, u64) {
    let size = window.as_secs().max(1);
    let start = now_secs - now_secs % size;
    (start, start + size - now_secs)
}

pub fn counter_key(identity: &Identity, window_start: u64) -> String {
    format!("ratelimit:{}:{}", identity.id(), window_start)
}

pub fn decide(count: i64, policy: &RateLimitPolicy, reset_after: Duration) -> RateLimitDecision {
    let count = count.max(0) as u64;
    RateLimitDecision {
        allowed: count <= policy.limit,
        limit: policy.limit,
        remaining: policy.limit.saturating_sub(count),
        reset_after,
    }
}

// ============================================================================
// SBIO: I/O wrapper
// ============================================================================

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn KeyValueStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Count one request and report whether it fits the budget
    pub async fn check(
        &self,
        identity: &Identity,
        policy: &RateLimitPolicy,
    ) -> Result<RateLimitDecision, StoreError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let (start, remaining_secs) = window_bounds(now, policy.window);
        let key = counter_key(identity, start);

        let count = self.store.incr(&key).await?;
        if count == 1 {
            self.store.expire(&key, policy.window).await?;
        }

        let decision = decide(count, policy, Duration::from_secs(remaining_secs));
        debug!(
            identity = %identity.id(),
            count,
            allowed = decision.allowed,
            "Rate limit check"
        );
        Ok(decision)
    }

    /// Like [`check`](Self::check), but an exhausted budget is an error
    pub async fn enforce(
        &self,
        identity: &Identity,
        policy: &RateLimitPolicy,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let decision = self.check(identity, policy).await?;
        if !decision.allowed {
            return Err(RateLimitError::Limited {
                limit: policy.limit,
                window: policy.window,
                retry_after: decision.reset_after,
            });
        }
        Ok(decision)
    }
}
