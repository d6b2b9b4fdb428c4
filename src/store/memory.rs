//! In-memory backend for development.
//!
//! Values may carry a TTL. Non-expiring values can be persisted to a JSON
//! file so keys survive restarts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use regex::Regex;
use tracing::{debug, warn};

use super::{KeyValueStore, StoreError};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    persist_path: Option<PathBuf>,
}

/// Default persistence file under the user's local data directory
pub fn default_persist_path() -> Option<PathBuf> {
    dirs::data_local_dir().map(|d| d.join("cloudflow").join("mock-store.json"))
}

/// Translate a `*`/`?` glob into an anchored regex
pub fn glob_to_regex(pattern: &str) -> Result<Regex, StoreError> {
    let mut re = String::with_capacity(pattern.len() + 2);
    re.push('^');
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| StoreError::Command(e.to_string()))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load previously persisted values from `path`, if it exists
    pub async fn with_persistence(path: PathBuf) -> Result<Self, StoreError> {
        let entries = DashMap::new();
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let saved: BTreeMap<String, String> = serde_json::from_str(&content)
                    .map_err(|e| StoreError::Persist(format!("{}: {}", path.display(), e)))?;
                debug!(path = %path.display(), keys = saved.len(), "Loaded persisted store");
                for (key, value) in saved {
                    entries.insert(
                        key,
                        Entry {
                            value,
                            expires_at: None,
                        },
                    );
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::Persist(e.to_string())),
        }

        Ok(Self {
            entries,
            persist_path: Some(path),
        })
    }

    pub fn persist_path(&self) -> Option<&Path> {
        self.persist_path.as_deref()
    }

    /// Number of entries held, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry
    fn purge_expired(&self, now: Instant) {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.is_live(now));
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            debug!(purged, "Purged expired store entries");
        }
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let entry = self.entries.get(key)?;
        if entry.is_live(now) {
            return Some(entry.value.clone());
        }
        drop(entry);
        self.entries.remove_if(key, |_, e| !e.is_live(now));
        None
    }

    async fn persist(&self) -> Result<(), StoreError> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };

        let snapshot: BTreeMap<String, String> = self
            .entries
            .iter()
            .filter(|e| e.expires_at.is_none())
            .map(|e| (e.key().clone(), e.value.clone()))
            .collect();

        let json = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| StoreError::Persist(e.to_string()))?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Persist(e.to_string()))?;
        }
        tokio::fs::write(path, json).await.map_err(|e| {
            warn!(path = %path.display(), error = %e, "Failed to persist store");
            StoreError::Persist(e.to_string())
        })
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.live_value(key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        self.persist().await
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let now = Instant::now();
        let (next, created) = {
            // The entry guard holds the shard lock, so this is atomic
            let mut created = false;
            let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| {
                created = true;
                Entry {
                    value: "0".to_string(),
                    expires_at: None,
                }
            });
            if !entry.is_live(now) {
                created = true;
                *entry = Entry {
                    value: "0".to_string(),
                    expires_at: None,
                };
            }
            let current: i64 = entry
                .value
                .parse()
                .map_err(|_| StoreError::NotAnInteger(key.to_string()))?;
            let next = current + 1;
            entry.value = next.to_string();
            (next, created)
        };
        // counters start fresh per window, so a new one is the time to sweep old ones
        if created {
            self.purge_expired(now);
        }
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let updated = match self.entries.get_mut(key) {
            Some(mut entry) if entry.is_live(now) => {
                entry.expires_at = Some(now + ttl);
                true
            }
            _ => false,
        };
        if updated {
            self.persist().await?;
        }
        Ok(updated)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let re = glob_to_regex(pattern)?;
        let now = Instant::now();
        self.purge_expired(now);
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| re.is_match(e.key()))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let existed = self
            .entries
            .remove(key)
            .is_some_and(|(_, entry)| entry.is_live(now));
        self.persist().await?;
        Ok(existed)
    }
}
