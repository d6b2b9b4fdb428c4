//! API key issuance, lookup and revocation.
//!
//! Two entries per key: `apikey:<token>` holds the owning user id and
//! `user-keys:<user>:<token>` holds the creation time, so a user's keys can
//! be listed by prefix.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use super::{KeyValueStore, StoreError};
use crate::config::RateLimitPolicy;

pub const KEY_PREFIX: &str = "sk-";
pub const API_KEY_PREFIX: &str = "apikey:";
pub const USER_KEYS_PREFIX: &str = "user-keys:";
pub const DEFAULT_USER: &str = "default-user";

/// Random bytes per token; rendered as twice as many hex chars
const TOKEN_BYTES: usize = 24;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum KeyError {
    #[error("Missing API key")]
    Missing,

    #[error("Invalid API key format")]
    InvalidFormat,

    #[error("Invalid user id '{0}'")]
    InvalidUser(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// An issued key
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyRecord {
    pub key: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

/// Per-key metadata reported by the listing endpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyClaims {
    pub limit: u64,
    pub timeframe: u64,
    pub iat: i64,
    pub jti: String,
}

impl ApiKeyRecord {
    pub fn claims(&self, policy: &RateLimitPolicy) -> KeyClaims {
        KeyClaims {
            limit: policy.limit,
            timeframe: policy.window.as_secs(),
            iat: self.created_at.timestamp(),
            jti: self.key.get(3..10).unwrap_or_default().to_string(),
        }
    }
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// `sk-` followed by 48 lowercase hex characters
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{}{}", KEY_PREFIX, hex::encode(bytes))
}

pub fn has_key_format(token: &str) -> bool {
    token.starts_with(KEY_PREFIX) && token.len() > KEY_PREFIX.len()
}

/// Loggable form of a secret: its first 8 characters
pub fn mask_key(token: &str) -> String {
    let visible: String = token.chars().take(8).collect();
    format!("{}...", visible)
}

/// Characters that would let a user id reach into another user's index
const RESERVED_USER_CHARS: [char; 6] = [':', '*', '?', '[', ']', '\\'];

fn user_or_default(user_id: Option<&str>) -> Result<&str, KeyError> {
    let user_id = user_id
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .unwrap_or(DEFAULT_USER);
    if user_id.contains(RESERVED_USER_CHARS) {
        return Err(KeyError::InvalidUser(user_id.to_string()));
    }
    Ok(user_id)
}

fn index_key(user_id: &str, token: &str) -> String {
    format!("{}{}:{}", USER_KEYS_PREFIX, user_id, token)
}

// ============================================================================
// SBIO: I/O wrapper
// ============================================================================

#[derive(Clone)]
pub struct ApiKeyManager {
    store: Arc<dyn KeyValueStore>,
}

impl ApiKeyManager {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    /// Create a key for `user_id` (or the default user)
    pub async fn issue(&self, user_id: Option<&str>) -> Result<ApiKeyRecord, KeyError> {
        let user_id = user_or_default(user_id)?;
        let key = generate_token();
        let created_at = Utc::now();

        self.store
            .set(&format!("{}{}", API_KEY_PREFIX, key), user_id, None)
            .await?;
        self.store
            .set(&index_key(user_id, &key), &created_at.to_rfc3339(), None)
            .await?;

        info!(user_id, key = %mask_key(&key), "API key issued");
        Ok(ApiKeyRecord {
            key,
            user_id: user_id.to_string(),
            created_at,
        })
    }

    /// Owning user of a token; `None` when unknown
    pub async fn lookup(&self, token: &str) -> Result<Option<String>, KeyError> {
        if !has_key_format(token) {
            return Err(KeyError::InvalidFormat);
        }
        Ok(self.store.get(&format!("{}{}", API_KEY_PREFIX, token)).await?)
    }

    /// All keys of a user, oldest first
    pub async fn list(&self, user_id: Option<&str>) -> Result<Vec<ApiKeyRecord>, KeyError> {
        let user_id = user_or_default(user_id)?;
        let prefix = index_key(user_id, "");
        let index_keys = self.store.keys(&format!("{}*", prefix)).await?;

        let mut records = Vec::with_capacity(index_keys.len());
        for index in index_keys {
            let Some(key) = index
                .strip_prefix(&prefix)
                .filter(|k| has_key_format(k) && !k.contains(':'))
            else {
                continue;
            };
            let Some(stamp) = self.store.get(&index).await? else {
                continue;
            };
            let created_at = match DateTime::parse_from_rfc3339(&stamp) {
                Ok(t) => t.with_timezone(&Utc),
                Err(e) => {
                    warn!(key = %mask_key(key), error = %e, "Skipping key with bad timestamp");
                    continue;
                }
            };
            records.push(ApiKeyRecord {
                key: key.to_string(),
                user_id: user_id.to_string(),
                created_at,
            });
        }

        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    /// Remove both entries of a key. Unknown keys are not an error.
    pub async fn revoke(&self, token: &str, user_id: Option<&str>) -> Result<(), KeyError> {
        if token.is_empty() {
            return Err(KeyError::Missing);
        }
        if !has_key_format(token) {
            return Err(KeyError::InvalidFormat);
        }

        let lookup_key = format!("{}{}", API_KEY_PREFIX, token);
        let owner = self.store.get(&lookup_key).await?;
        let user_id = match owner.as_deref() {
            Some(owner) => owner,
            None => user_or_default(user_id)?,
        };

        self.store.del(&lookup_key).await?;
        self.store.del(&index_key(user_id, token)).await?;

        info!(user_id, key = %mask_key(token), "API key revoked");
        Ok(())
    }
}
