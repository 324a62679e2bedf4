/// Fixed-window request limiting per client key.
///
/// Windows live in the shared store and are advanced with compare-and-swap,
/// so every process enforces the same count. A store outage fails open.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};

use crate::{
    db::{StateStore, StoreKey},
    error::{AppError, AppResult},
};

const MAX_CAS_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitSettings {
    /// Requests admitted per window
    pub limit: u32,
    pub window: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            limit: 60,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct WindowRecord {
    window_start_ms: i64,
    count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Rejected { retry_after: Duration },
}

impl RateDecision {
    /// Maps a rejection onto the API error
    pub fn into_result(self) -> AppResult<u32> {
        match self {
            RateDecision::Allowed { remaining } => Ok(remaining),
            RateDecision::Rejected { retry_after } => {
                Err(AppError::RateLimitExceeded { retry_after })
            }
        }
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn StateStore>,
    settings: RateLimitSettings,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn StateStore>, settings: RateLimitSettings) -> Self {
        Self { store, settings }
    }

    /// Counts one request from `client_key`, failing open on store errors
    pub async fn check_limit(&self, client_key: &str) -> RateDecision {
        match self.check_limit_at(client_key, Utc::now()).await {
            Ok(Some(decision)) => decision,
            Ok(None) => {
                tracing::warn!(
                    client = %client_key,
                    "Rate limit window contended, allowing request"
                );
                RateDecision::Allowed { remaining: 0 }
            }
            Err(e) => {
                tracing::warn!(
                    client = %client_key,
                    error = %e,
                    "Rate limiter store unavailable, allowing request"
                );
                RateDecision::Allowed {
                    remaining: self.settings.limit,
                }
            }
        }
    }

    /// Returns `None` if every CAS attempt lost to a concurrent writer
    pub async fn check_limit_at(
        &self,
        client_key: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Option<RateDecision>> {
        let key = StoreKey::RateLimit(client_key.to_string());
        let now_ms = now.timestamp_millis();
        let window_ms = self.settings.window.as_millis() as i64;

        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.store.get_versioned(&key).await?;
            let (record, version) = match &current {
                Some(versioned) => (
                    Some(serde_json::from_str::<WindowRecord>(&versioned.value)?),
                    Some(versioned.version),
                ),
                None => (None, None),
            };

            let next = match record {
                Some(record) if now_ms - record.window_start_ms < window_ms => {
                    if record.count >= self.settings.limit {
                        let wait_ms = (record.window_start_ms + window_ms - now_ms).max(1);
                        return Ok(Some(RateDecision::Rejected {
                            retry_after: Duration::from_millis(wait_ms as u64),
                        }));
                    }
                    WindowRecord {
                        count: record.count + 1,
                        ..record
                    }
                }
                _ => WindowRecord {
                    window_start_ms: now_ms,
                    count: 1,
                },
            };

            // Keys outlive their window only long enough to be reset
            let ttl = Duration::from_millis(
                (next.window_start_ms + window_ms - now_ms).max(1) as u64,
            );
            let written = self
                .store
                .put_if_version(&key, &serde_json::to_string(&next)?, version, Some(ttl))
                .await?;

            if written {
                return Ok(Some(RateDecision::Allowed {
                    remaining: self.settings.limit.saturating_sub(next.count),
                }));
            }
        }

        Ok(None)
    }
}
