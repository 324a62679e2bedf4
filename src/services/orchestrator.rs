/// Produces the final recommendations of a session.
///
/// Priority order is cache, then the generation service behind the circuit
/// breaker, then the deterministic fallback. The fallback branch is an
/// explicit match on the guarded call's result, and `get_recommendations`
/// has no error path: callers always receive `K` items.

use chrono::Utc;
use serde::Deserialize;
use std::{collections::HashSet, sync::Arc};

use crate::{
    error::{AppError, AppResult},
    models::{DomainProfile, Provenance, RecommendationItem, RecommendationResult, SessionState},
    services::{
        circuit_breaker::CircuitBreaker,
        entropy::{EntropyModel, EntropySettings},
        fallback::{fallback, FALLBACK_CONFIDENCE},
        providers::{GenerationRequest, GenerationService},
        recommendation_cache::{fingerprint, RecommendationCache},
        telemetry::{CompletionEvent, TelemetrySink},
    },
};

/// Confidence for generated results that do not report one
pub const DEFAULT_GENERATED_CONFIDENCE: f64 = 0.85;

/// Expected shape of a generation response body
#[derive(Debug, Deserialize)]
struct GenerationPayload {
    items: Vec<RecommendationItem>,
    #[serde(default)]
    confidence: Option<f64>,
}

/// A payload that passed validation
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedPayload {
    pub items: Vec<RecommendationItem>,
    pub confidence: f64,
}

/// Parses a raw generation response and checks it holds exactly
/// `target_count` distinct, complete items.
pub fn validate_payload(raw: &str, target_count: usize) -> AppResult<ValidatedPayload> {
    let payload: GenerationPayload = serde_json::from_str(raw)
        .map_err(|e| AppError::PayloadValidation(format!("malformed JSON: {}", e)))?;

    if payload.items.len() != target_count {
        return Err(AppError::PayloadValidation(format!(
            "expected {} items, got {}",
            target_count,
            payload.items.len()
        )));
    }

    let mut titles = HashSet::new();
    for (index, item) in payload.items.iter().enumerate() {
        let title = item.title.trim();
        if title.is_empty() {
            return Err(AppError::PayloadValidation(format!(
                "item {} has an empty title",
                index
            )));
        }
        if item.reason.trim().is_empty() {
            return Err(AppError::PayloadValidation(format!(
                "item '{}' has an empty reason",
                title
            )));
        }
        if !titles.insert(title.to_lowercase()) {
            return Err(AppError::PayloadValidation(format!(
                "duplicate item '{}'",
                title
            )));
        }
    }

    let confidence = match payload.confidence {
        Some(c) if c.is_finite() => c.clamp(0.0, 1.0),
        _ => DEFAULT_GENERATED_CONFIDENCE,
    };

    Ok(ValidatedPayload {
        items: payload.items,
        confidence,
    })
}

#[derive(Clone)]
pub struct RecommendationOrchestrator {
    cache: RecommendationCache,
    breaker: CircuitBreaker,
    generator: Arc<dyn GenerationService>,
    telemetry: Arc<dyn TelemetrySink>,
    entropy: EntropySettings,
}

impl RecommendationOrchestrator {
    pub fn new(
        cache: RecommendationCache,
        breaker: CircuitBreaker,
        generator: Arc<dyn GenerationService>,
        telemetry: Arc<dyn TelemetrySink>,
        entropy: EntropySettings,
    ) -> Self {
        Self {
            cache,
            breaker,
            generator,
            telemetry,
            entropy,
        }
    }

    #[tracing::instrument(
        skip_all,
        fields(session_id = %session.session_id, domain = %session.domain)
    )]
    pub async fn get_recommendations(
        &self,
        session: &SessionState,
        profile: &DomainProfile,
    ) -> RecommendationResult {
        let fingerprint = fingerprint(session);

        let result = match self.cache.lookup(&fingerprint).await {
            Ok(Some(entry)) => RecommendationResult {
                provenance: Provenance::Cache,
                ..entry.payload
            },
            Ok(None) => self.produce(session, profile, &fingerprint).await,
            Err(e) => {
                tracing::warn!(error = %e, "Recommendation cache unavailable");
                self.produce(session, profile, &fingerprint).await
            }
        };

        tracing::info!(
            provenance = %result.provenance,
            items = result.items.len(),
            confidence = result.confidence,
            "Recommendations ready"
        );
        self.emit_completion(session, profile, &result).await;

        result
    }

    /// Generates (or falls back) and caches the outcome
    async fn produce(
        &self,
        session: &SessionState,
        profile: &DomainProfile,
        fingerprint: &str,
    ) -> RecommendationResult {
        let request = GenerationRequest::from_session(session, profile, fingerprint);

        let outcome = self
            .breaker
            .execute(|| self.generate_validated(&request, profile.target_count))
            .await;

        let result = match outcome {
            Ok(payload) => RecommendationResult {
                items: payload.items,
                provenance: Provenance::Generated,
                confidence: payload.confidence,
                generated_at: Utc::now(),
            },
            Err(reason) => {
                tracing::warn!(
                    reason = %reason,
                    code = reason.code(),
                    "Using fallback recommendations"
                );
                RecommendationResult {
                    items: fallback(session, profile),
                    provenance: Provenance::Fallback,
                    confidence: FALLBACK_CONFIDENCE,
                    generated_at: Utc::now(),
                }
            }
        };

        if let Err(e) = self.cache.store(fingerprint, &result).await {
            tracing::warn!(error = %e, "Failed to cache recommendations");
        }

        result
    }

    async fn generate_validated(
        &self,
        request: &GenerationRequest,
        target_count: usize,
    ) -> AppResult<ValidatedPayload> {
        let raw = self.generator.generate(request).await?;
        validate_payload(&raw, target_count)
    }

    async fn emit_completion(
        &self,
        session: &SessionState,
        profile: &DomainProfile,
        result: &RecommendationResult,
    ) {
        let model = EntropyModel::new(self.entropy, profile.archetype_count);
        let event = CompletionEvent {
            session_id: session.session_id,
            domain: session.domain.clone(),
            provenance: result.provenance,
            duration_ms: session.duration_ms(Utc::now()),
            final_entropy: model.remaining(session.choice_count()),
            question_count: session.choice_count(),
        };

        if let Err(e) = self.telemetry.record_completion(&event).await {
            tracing::warn!(error = %e, "Failed to record completion event");
        }
    }
}
