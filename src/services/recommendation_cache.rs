use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::{sync::Arc, time::Duration};

use crate::{
    db::{StateStore, StoreKey},
    error::AppResult,
    models::{CacheEntry, RecommendationResult, SessionState},
};

/// Cache key for a session's answers.
///
/// Built from the domain, the `(question_id, choice)` pairs sorted by
/// question id, and the coarse context bucket, so answer order never
/// changes the key.
pub fn fingerprint(session: &SessionState) -> String {
    let mut pairs: Vec<(&str, &str)> = session
        .choices
        .iter()
        .map(|c| (c.question_id.as_str(), c.choice.as_str()))
        .collect();
    pairs.sort_unstable();

    let answers = pairs
        .iter()
        .map(|(question_id, choice)| format!("{}={}", question_id, choice))
        .collect::<Vec<_>>()
        .join(";");

    let mut hasher = Sha256::new();
    hasher.update(session.domain.as_bytes());
    hasher.update(b"|");
    hasher.update(answers.as_bytes());
    hasher.update(b"|");
    hasher.update(session.context.coarse_bucket().as_bytes());
    hex::encode(hasher.finalize())
}

/// Fingerprint-keyed recommendation sets with a freshness window
#[derive(Clone)]
pub struct RecommendationCache {
    store: Arc<dyn StateStore>,
    ttl: Duration,
}

impl RecommendationCache {
    pub fn new(store: Arc<dyn StateStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Time left before an entry generated at `generated_at` goes stale
    fn remaining_ttl(&self, generated_at: DateTime<Utc>, now: DateTime<Utc>) -> Option<Duration> {
        let age = (now - generated_at).to_std().unwrap_or(Duration::ZERO);
        self.ttl.checked_sub(age).filter(|left| !left.is_zero())
    }

    /// Reads an entry without counting a hit
    pub async fn peek(&self, fingerprint: &str) -> AppResult<Option<CacheEntry>> {
        let key = StoreKey::Recommendation(fingerprint.to_string());
        match self.store.get(&key).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Returns a fresh entry and bumps its hit count. Stale entries are misses.
    pub async fn lookup_at(
        &self,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Option<CacheEntry>> {
        let Some(mut entry) = self.peek(fingerprint).await? else {
            return Ok(None);
        };

        let Some(remaining) = self.remaining_ttl(entry.payload.generated_at, now) else {
            tracing::debug!(fingerprint = %fingerprint, "Cached recommendations expired");
            return Ok(None);
        };

        // Hit counts are advisory; concurrent hits may undercount
        entry.hit_count += 1;
        let key = StoreKey::Recommendation(fingerprint.to_string());
        self.store
            .put(&key, &serde_json::to_string(&entry)?, Some(remaining))
            .await?;

        tracing::debug!(fingerprint = %fingerprint, hit_count = entry.hit_count, "Cache hit");
        Ok(Some(entry))
    }

    pub async fn lookup(&self, fingerprint: &str) -> AppResult<Option<CacheEntry>> {
        self.lookup_at(fingerprint, Utc::now()).await
    }

    /// Stores `payload` under `fingerprint`, replacing any previous entry
    pub async fn store(&self, fingerprint: &str, payload: &RecommendationResult) -> AppResult<()> {
        let entry = CacheEntry {
            fingerprint: fingerprint.to_string(),
            payload: payload.clone(),
            hit_count: 0,
        };
        let key = StoreKey::Recommendation(fingerprint.to_string());
        self.store
            .put(&key, &serde_json::to_string(&entry)?, Some(self.ttl))
            .await
    }
}
