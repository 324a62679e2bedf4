use std::{
    collections::HashMap,
    fmt::Display,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Typed keys for everything kept in the shared state store
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StoreKey {
    Session(Uuid),
    Recommendation(String),
    Breaker(String),
    RateLimit(String),
}

impl Display for StoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreKey::Session(id) => write!(f, "session:{}", id),
            StoreKey::Recommendation(fingerprint) => write!(f, "recs:{}", fingerprint),
            StoreKey::Breaker(dependency) => write!(f, "breaker:{}", dependency.to_lowercase()),
            StoreKey::RateLimit(client) => write!(f, "ratelimit:{}", client),
        }
    }
}

/// A stored value together with the version it was written at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: String,
    pub version: u64,
}

/// External key-value store holding all cross-request state.
///
/// Plain `get`/`put` serve single-owner records (sessions, cache entries).
/// Records written by many concurrent requests (breaker, rate-limit windows)
/// go through `get_versioned`/`put_if_version` so that every transition is a
/// compare-and-swap. A key space is used with one family of methods only.
#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &StoreKey) -> AppResult<Option<String>>;

    async fn put(&self, key: &StoreKey, value: &str, ttl: Option<Duration>) -> AppResult<()>;

    async fn delete(&self, key: &StoreKey) -> AppResult<()>;

    async fn get_versioned(&self, key: &StoreKey) -> AppResult<Option<Versioned>>;

    /// Writes `value` only if the key is still at `expected` (`None` = absent).
    /// Returns `false` when another writer got there first.
    async fn put_if_version(
        &self,
        key: &StoreKey,
        value: &str,
        expected: Option<u64>,
        ttl: Option<Duration>,
    ) -> AppResult<bool>;
}

struct MemoryEntry {
    value: String,
    version: u64,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-process `StateStore` with the same CAS and TTL semantics as Redis.
/// Only coordinates callers sharing the process; used for tests and local runs.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, MemoryEntry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, HashMap<String, MemoryEntry>>> {
        self.entries
            .lock()
            .map_err(|_| AppError::Internal("memory store lock poisoned".to_string()))
    }

    fn live_version(
        entries: &HashMap<String, MemoryEntry>,
        key: &str,
        now: Instant,
    ) -> Option<u64> {
        entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.version)
    }
}

#[async_trait::async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &StoreKey) -> AppResult<Option<String>> {
        Ok(self.get_versioned(key).await?.map(|v| v.value))
    }

    async fn put(&self, key: &StoreKey, value: &str, ttl: Option<Duration>) -> AppResult<()> {
        let now = Instant::now();
        let key = key.to_string();
        let mut entries = self.lock()?;
        let version = Self::live_version(&entries, &key, now).map_or(1, |v| v + 1);
        entries.insert(
            key,
            MemoryEntry {
                value: value.to_string(),
                version,
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &StoreKey) -> AppResult<()> {
        self.lock()?.remove(&key.to_string());
        Ok(())
    }

    async fn get_versioned(&self, key: &StoreKey) -> AppResult<Option<Versioned>> {
        let now = Instant::now();
        let key = key.to_string();
        let mut entries = self.lock()?;

        match entries.get(&key) {
            Some(entry) if entry.is_live(now) => Ok(Some(Versioned {
                value: entry.value.clone(),
                version: entry.version,
            })),
            Some(_) => {
                entries.remove(&key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put_if_version(
        &self,
        key: &StoreKey,
        value: &str,
        expected: Option<u64>,
        ttl: Option<Duration>,
    ) -> AppResult<bool> {
        let now = Instant::now();
        let key = key.to_string();
        let mut entries = self.lock()?;

        if Self::live_version(&entries, &key, now) != expected {
            return Ok(false);
        }

        entries.insert(
            key,
            MemoryEntry {
                value: value.to_string(),
                version: expected.map_or(1, |v| v + 1),
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(true)
    }
}
