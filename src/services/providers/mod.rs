/// External recommendation generation
///
/// The generation service is an opaque, slow and occasionally unavailable
/// dependency. Implementations only move bytes: they return the raw response
/// body and leave parsing and validation to the orchestrator, so a malformed
/// payload is accounted as a failure in the same place as a transport error.
use serde::Serialize;

use crate::{
    error::AppResult,
    models::{DomainProfile, SessionState},
};

pub mod http_generation;

pub use http_generation::HttpGenerationClient;

/// One resolved preference sent to the generation service
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResolvedChoice {
    pub question_id: String,
    pub category: String,
    pub choice: String,
}

/// Structured preference summary for one finalized session
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GenerationRequest {
    pub domain: String,
    /// Number of items the response must contain
    pub count: usize,
    pub choices: Vec<ResolvedChoice>,
    /// Natural-language rendering of `choices`
    pub preference_summary: String,
    pub context_bucket: String,
    /// Session fingerprint; sent as the idempotency key, not in the body
    #[serde(skip)]
    pub idempotency_key: String,
}

impl GenerationRequest {
    pub fn from_session(
        session: &SessionState,
        profile: &DomainProfile,
        fingerprint: &str,
    ) -> Self {
        let choices: Vec<ResolvedChoice> = session
            .choices
            .iter()
            .map(|c| ResolvedChoice {
                question_id: c.question_id.clone(),
                category: c.category.clone(),
                choice: c.choice.clone(),
            })
            .collect();

        let preference_summary = if choices.is_empty() {
            format!("No stated preferences for {}", profile.name)
        } else {
            let parts = choices
                .iter()
                .map(|c| format!("{}: {}", c.category, c.choice))
                .collect::<Vec<_>>()
                .join(", ");
            format!("Looking for {} with {}", profile.name, parts)
        };

        Self {
            domain: session.domain.clone(),
            count: profile.target_count,
            choices,
            preference_summary,
            context_bucket: session.context.coarse_bucket(),
            idempotency_key: fingerprint.to_string(),
        }
    }
}

/// Trait for recommendation generation backends
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait GenerationService: Send + Sync {
    /// Requests recommendations and returns the raw response body.
    ///
    /// Calls with the same `idempotency_key` must not create duplicate side
    /// effects upstream.
    async fn generate(&self, request: &GenerationRequest) -> AppResult<String>;

    /// Provider name for logging and breaker keys
    fn name(&self) -> &'static str;
}
