//! Direct Redis backend.
//!
//! The connection is opened on first use, so a store can be constructed even
//! while the server is unreachable; failures surface per operation.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{AsyncCommands, Client};
use tokio::sync::OnceCell;
use tracing::debug;

use super::{KeyValueStore, StoreError};

pub struct RedisStore {
    client: Client,
    conn: OnceCell<ConnectionManager>,
}

impl RedisStore {
    /// Parse the URL; no connection is made yet
    pub fn open(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            conn: OnceCell::new(),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                debug!("Connecting to Redis");
                let config = ConnectionManagerConfig::new().set_number_of_retries(1);
                ConnectionManager::new_with_config(self.client.clone(), config).await
            })
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(conn.clone())
    }
}

fn command_error(e: redis::RedisError) -> StoreError {
    StoreError::Command(e.to_string())
}

/// Whole seconds, at least one
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl KeyValueStore for RedisStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection().await?;
        conn.get(key).await.map_err(command_error)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        match ttl {
            Some(ttl) => conn.set_ex(key, value, ttl_secs(ttl)).await,
            None => conn.set(key, value).await,
        }
        .map_err(command_error)
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.connection().await?;
        conn.incr(key, 1i64).await.map_err(|e| match e.kind() {
            redis::ErrorKind::TypeError | redis::ErrorKind::ResponseError => {
                StoreError::NotAnInteger(key.to_string())
            }
            _ => command_error(e),
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        conn.expire(key, ttl_secs(ttl) as i64)
            .await
            .map_err(command_error)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection().await?;
        let mut keys: Vec<String> = conn.keys(pattern).await.map_err(command_error)?;
        keys.sort();
        Ok(keys)
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let removed: i64 = conn.del(key).await.map_err(command_error)?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_secs_rounds_up_to_one() {
        assert_eq!(ttl_secs(Duration::from_millis(10)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(60)), 60);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_connection_error() {
        let store = RedisStore::open("redis://127.0.0.1:1/").unwrap();
        let err = store.get("anything").await.unwrap_err();
        assert!(matches!(err, StoreError::Connection(_)));
    }
}
