/// Failure isolation for the generation service.
///
/// The breaker keeps no state in process memory: every request handler
/// builds a `CircuitBreaker` handle over the shared store and all state
/// transitions are compare-and-swap writes, so independent processes agree
/// on CLOSED / OPEN / HALF_OPEN without a lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{future::Future, sync::Arc, time::Duration};

use crate::{
    db::{StateStore, StoreKey},
    error::{AppError, AppResult},
};

/// Attempts at a contended transition before giving up on recording it
const MAX_CAS_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerSettings {
    /// Consecutive failures that trip the breaker
    pub failure_threshold: u32,
    /// How long the breaker stays open before allowing a trial call
    pub cooldown: Duration,
    /// Upper bound on a guarded call; exceeding it counts as a failure
    pub call_timeout: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
            call_timeout: Duration::from_secs(8),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerStatus {
    Closed,
    Open,
    HalfOpen,
}

/// Persisted breaker record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerState {
    pub status: BreakerStatus,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    /// When the current HALF_OPEN trial was handed out
    pub trial_started_at: Option<DateTime<Utc>>,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            status: BreakerStatus::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_started_at: None,
        }
    }
}

/// Admission granted by the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    /// Breaker closed, call passes through
    Normal,
    /// The single trial call allowed while HALF_OPEN
    Trial,
}

/// Handle over the shared breaker state of one dependency
#[derive(Clone)]
pub struct CircuitBreaker {
    store: Arc<dyn StateStore>,
    key: StoreKey,
    dependency: String,
    settings: BreakerSettings,
}

impl CircuitBreaker {
    pub fn new(store: Arc<dyn StateStore>, dependency: &str, settings: BreakerSettings) -> Self {
        Self {
            store,
            key: StoreKey::Breaker(dependency.to_string()),
            dependency: dependency.to_string(),
            settings,
        }
    }

    fn open_error(&self) -> AppError {
        AppError::CircuitOpen {
            dependency: self.dependency.clone(),
        }
    }

    async fn load(&self) -> AppResult<(BreakerState, Option<u64>)> {
        match self.store.get_versioned(&self.key).await? {
            Some(versioned) => {
                let state = serde_json::from_str(&versioned.value)?;
                Ok((state, Some(versioned.version)))
            }
            None => Ok((BreakerState::default(), None)),
        }
    }

    /// Current persisted state
    pub async fn state(&self) -> AppResult<BreakerState> {
        Ok(self.load().await?.0)
    }

    fn cooldown_elapsed(&self, since: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let Some(since) = since else {
            return true;
        };
        (now - since)
            .to_std()
            .map(|elapsed| elapsed >= self.settings.cooldown)
            .unwrap_or(false)
    }

    /// Decides whether a call may proceed at `now`.
    ///
    /// Once the cooldown has elapsed, the OPEN → HALF_OPEN transition is a
    /// single conditional write: exactly one concurrent caller wins the trial
    /// and every loser is rejected as if the breaker were still open. A trial
    /// that never reports back is reclaimed after another cooldown.
    pub async fn acquire_at(&self, now: DateTime<Utc>) -> AppResult<Permit> {
        let (state, version) = self.load().await?;

        let since = match state.status {
            BreakerStatus::Closed => return Ok(Permit::Normal),
            BreakerStatus::Open => state.opened_at,
            BreakerStatus::HalfOpen => state.trial_started_at,
        };

        if !self.cooldown_elapsed(since, now) {
            return Err(self.open_error());
        }

        let trial = BreakerState {
            status: BreakerStatus::HalfOpen,
            trial_started_at: Some(now),
            ..state
        };
        let won = self
            .store
            .put_if_version(&self.key, &serde_json::to_string(&trial)?, version, None)
            .await?;

        if won {
            tracing::info!(dependency = %self.dependency, "Circuit half-open, allowing trial call");
            Ok(Permit::Trial)
        } else {
            Err(self.open_error())
        }
    }

    /// `acquire_at(now)`, failing open if the state store itself is unreachable
    pub async fn acquire(&self) -> AppResult<Permit> {
        match self.acquire_at(Utc::now()).await {
            Err(open @ AppError::CircuitOpen { .. }) => Err(open),
            Err(e) => {
                tracing::warn!(
                    dependency = %self.dependency,
                    error = %e,
                    "Breaker state unavailable, allowing call"
                );
                Ok(Permit::Normal)
            }
            Ok(permit) => Ok(permit),
        }
    }

    /// Applies `transition` with compare-and-swap, retrying on conflict.
    /// `transition` returns `None` when no write is needed.
    async fn update<F>(&self, transition: F) -> AppResult<Option<BreakerState>>
    where
        F: Fn(&BreakerState) -> Option<BreakerState>,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (current, version) = self.load().await?;
            let Some(next) = transition(&current) else {
                return Ok(None);
            };
            if self
                .store
                .put_if_version(&self.key, &serde_json::to_string(&next)?, version, None)
                .await?
            {
                return Ok(Some(next));
            }
        }

        tracing::warn!(
            dependency = %self.dependency,
            "Breaker update abandoned after repeated conflicts"
        );
        Ok(None)
    }

    pub async fn record_success(&self, permit: Permit, _now: DateTime<Utc>) -> AppResult<()> {
        let next = self
            .update(|state| match (state.status, permit) {
                (BreakerStatus::HalfOpen, Permit::Trial) => Some(BreakerState::default()),
                (BreakerStatus::Closed, _) if state.consecutive_failures > 0 => {
                    Some(BreakerState::default())
                }
                _ => None,
            })
            .await?;

        if next.is_some() && permit == Permit::Trial {
            tracing::info!(dependency = %self.dependency, "Circuit closed after successful trial");
        }
        Ok(())
    }

    pub async fn record_failure(&self, permit: Permit, now: DateTime<Utc>) -> AppResult<()> {
        let threshold = self.settings.failure_threshold;
        let next = self
            .update(|state| match (state.status, permit) {
                (BreakerStatus::HalfOpen, Permit::Trial) => Some(BreakerState {
                    status: BreakerStatus::Open,
                    consecutive_failures: state.consecutive_failures.saturating_add(1),
                    opened_at: Some(now),
                    trial_started_at: None,
                }),
                (BreakerStatus::Closed, _) => {
                    let failures = state.consecutive_failures.saturating_add(1);
                    if failures >= threshold {
                        Some(BreakerState {
                            status: BreakerStatus::Open,
                            consecutive_failures: failures,
                            opened_at: Some(now),
                            trial_started_at: None,
                        })
                    } else {
                        Some(BreakerState {
                            consecutive_failures: failures,
                            ..BreakerState::default()
                        })
                    }
                }
                _ => None,
            })
            .await?;

        if let Some(state) = next {
            if state.status == BreakerStatus::Open {
                tracing::warn!(
                    dependency = %self.dependency,
                    failures = state.consecutive_failures,
                    cooldown_secs = self.settings.cooldown.as_secs(),
                    "Circuit opened"
                );
            }
        }
        Ok(())
    }

    /// Runs `operation` through the breaker.
    ///
    /// Short-circuits with `CircuitOpen` without invoking `operation` while
    /// open. The call is bounded by `call_timeout`; errors and timeouts are
    /// recorded as failures, and the outcome is returned unchanged.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> AppResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let permit = self.acquire().await?;

        let outcome = match tokio::time::timeout(self.settings.call_timeout, operation()).await {
            Ok(result) => result,
            Err(_) => Err(AppError::UpstreamService(format!(
                "{} call timed out after {}ms",
                self.dependency,
                self.settings.call_timeout.as_millis()
            ))),
        };

        let recorded = match &outcome {
            Ok(_) => self.record_success(permit, Utc::now()).await,
            Err(_) => self.record_failure(permit, Utc::now()).await,
        };
        if let Err(e) = recorded {
            tracing::warn!(
                dependency = %self.dependency,
                error = %e,
                "Failed to record breaker outcome"
            );
        }

        outcome
    }
}
