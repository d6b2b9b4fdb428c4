//! Key-value storage behind API keys and rate limiting.
//!
//! One trait, three backends (direct Redis, Upstash-style REST, in-memory),
//! selected once at startup by [`connect_store`].

pub mod fallback;
pub mod keys;
pub mod memory;
pub mod rate_limit;
pub mod redis_backend;
pub mod rest;

pub use fallback::FallbackStore;
pub use keys::{mask_key, ApiKeyManager, ApiKeyRecord, KeyClaims, KeyError};
pub use memory::MemoryStore;
pub use rate_limit::{Identity, RateLimitDecision, RateLimitError, RateLimiter};
pub use redis_backend::RedisStore;
pub use rest::RestStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::config::StoreSettings;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Store connection failed: {0}")]
    Connection(String),

    #[error("Store command failed: {0}")]
    Command(String),

    #[error("Value at '{0}' is not an integer")]
    NotAnInteger(String),

    #[error("Unexpected store response: {0}")]
    Protocol(String),

    #[error("Failed to persist store: {0}")]
    Persist(String),
}

// ============================================================================
// SBIO: Trait for abstraction (allows mocking in tests)
// ============================================================================

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Short backend name: `redis`, `rest` or `memory`
    fn backend(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Atomically add one, creating the key at 1
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    /// Returns false when the key does not exist
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Keys matching a glob pattern (`*`, `?`)
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    /// Returns false when the key did not exist
    async fn del(&self, key: &str) -> Result<bool, StoreError>;
}

/// Pick the backend: Redis, then REST, then in-memory.
///
/// With both Redis and REST configured, REST backs up every Redis operation.
pub async fn connect_store(settings: &StoreSettings) -> Result<Arc<dyn KeyValueStore>, StoreError> {
    let rest = settings
        .rest_credentials()
        .map(|(domain, token)| Arc::new(RestStore::new(domain, token)) as Arc<dyn KeyValueStore>);

    if let Some(url) = &settings.redis_url {
        let redis: Arc<dyn KeyValueStore> = Arc::new(RedisStore::open(url)?);
        return Ok(match rest {
            Some(rest) => {
                info!("Using Redis store with REST fallback");
                Arc::new(FallbackStore::new(redis, rest))
            }
            None => {
                info!("Using Redis store");
                redis
            }
        });
    }

    if let Some(rest) = rest {
        info!("Using REST store");
        return Ok(rest);
    }

    info!(persist = ?settings.persist_path, "Using in-memory store");
    let memory = match &settings.persist_path {
        Some(path) => MemoryStore::with_persistence(path.clone()).await?,
        None => MemoryStore::new(),
    };
    Ok(Arc::new(memory))
}
