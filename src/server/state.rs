use std::sync::Arc;

use crate::config::RelaySettings;
use crate::relay::{ChatRelay, RelayError};
use crate::store::{ApiKeyManager, KeyValueStore, RateLimiter};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub keys: ApiKeyManager,
    pub limiter: RateLimiter,
    pub relay: ChatRelay,
    pub settings: Arc<RelaySettings>,
}

impl AppState {
    pub fn new(store: Arc<dyn KeyValueStore>, settings: RelaySettings) -> Result<Self, RelayError> {
        Ok(Self {
            keys: ApiKeyManager::new(store.clone()),
            limiter: RateLimiter::new(store),
            relay: ChatRelay::new(&settings)?,
            settings: Arc::new(settings),
        })
    }

    /// Name of the key store backend in use
    pub fn backend(&self) -> &'static str {
        self.keys.store().backend()
    }
}
