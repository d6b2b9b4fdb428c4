use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::{KeyValueStore, StoreError};

/// Routes every operation to `primary`, retrying once on `secondary` when
/// the primary fails
pub struct FallbackStore {
    primary: Arc<dyn KeyValueStore>,
    secondary: Arc<dyn KeyValueStore>,
}

impl FallbackStore {
    pub fn new(primary: Arc<dyn KeyValueStore>, secondary: Arc<dyn KeyValueStore>) -> Self {
        Self { primary, secondary }
    }

    async fn with_fallback<'a, T, F, Fut>(&'a self, op: &str, call: F) -> Result<T, StoreError>
    where
        F: Fn(&'a dyn KeyValueStore) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        match call(self.primary.as_ref()).await {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!(
                    op,
                    primary = self.primary.backend(),
                    secondary = self.secondary.backend(),
                    error = %e,
                    "Primary store failed, falling back"
                );
                call(self.secondary.as_ref()).await
            }
        }
    }
}

#[async_trait]
impl KeyValueStore for FallbackStore {
    fn backend(&self) -> &'static str {
        self.primary.backend()
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_fallback("get", |s| s.get(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.with_fallback("set", |s| s.set(key, value, ttl)).await
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        self.with_fallback("incr", |s| s.incr(key)).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.with_fallback("expire", |s| s.expire(key, ttl)).await
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        self.with_fallback("keys", |s| s.keys(pattern)).await
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        self.with_fallback("del", |s| s.del(key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    /// Fails every operation
    struct DownStore;

    #[async_trait]
    impl KeyValueStore for DownStore {
        fn backend(&self) -> &'static str {
            "redis"
        }
        async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Connection("refused".to_string()))
        }
        async fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> Result<(), StoreError> {
            Err(StoreError::Connection("refused".to_string()))
        }
        async fn incr(&self, _key: &str) -> Result<i64, StoreError> {
            Err(StoreError::Connection("refused".to_string()))
        }
        async fn expire(&self, _key: &str, _ttl: Duration) -> Result<bool, StoreError> {
            Err(StoreError::Connection("refused".to_string()))
        }
        async fn keys(&self, _pattern: &str) -> Result<Vec<String>, StoreError> {
            Err(StoreError::Connection("refused".to_string()))
        }
        async fn del(&self, _key: &str) -> Result<bool, StoreError> {
            Err(StoreError::Connection("refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_falls_back_when_primary_is_down() {
        let secondary = Arc::new(MemoryStore::new());
        let store = FallbackStore::new(Arc::new(DownStore), secondary.clone());

        store.set("k", "v", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(store.incr("n").await.unwrap(), 1);
        assert_eq!(secondary.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(store.backend(), "redis");
    }

    #[tokio::test]
    async fn test_primary_used_when_healthy() {
        let primary = Arc::new(MemoryStore::new());
        let secondary = Arc::new(MemoryStore::new());
        let store = FallbackStore::new(primary.clone(), secondary.clone());

        store.set("k", "v", None).await.unwrap();
        assert!(primary.get("k").await.unwrap().is_some());
        assert!(secondary.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_secondary_error_surfaces() {
        let store = FallbackStore::new(Arc::new(DownStore), Arc::new(DownStore));
        assert!(matches!(store.get("k").await, Err(StoreError::Connection(_))));
    }
}
