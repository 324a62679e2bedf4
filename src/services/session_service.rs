/// Turn-by-turn driver of an elicitation session.
///
/// Each call loads the session from the store, applies one transition and
/// writes it back. Nothing survives in memory between turns.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use uuid::Uuid;

use crate::{
    db::{StateStore, StoreKey},
    error::{AppError, AppResult},
    models::{
        DomainProfile, DomainRegistry, Question, QuestionOption, RecommendationResult,
        SessionContext, SessionPhase, SessionState,
    },
    services::{
        catalog::QuestionCatalog,
        entropy::{EntropyModel, EntropySettings},
        orchestrator::RecommendationOrchestrator,
        question_selector::QuestionSelector,
    },
};

/// Question as presented to the caller
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QuestionView {
    pub id: String,
    pub text: String,
    pub category: String,
    pub options: Vec<QuestionOption>,
}

impl From<Question> for QuestionView {
    fn from(question: Question) -> Self {
        Self {
            id: question.id,
            text: question.text,
            category: question.category,
            options: question.options,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SessionStart {
    pub session_id: Uuid,
    pub question: QuestionView,
}

/// Result of one answered turn
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TurnOutcome {
    Question {
        question: QuestionView,
        remaining_entropy: f64,
    },
    Complete {
        recommendations: RecommendationResult,
    },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub domain: String,
    pub phase: SessionPhase,
    pub answered: usize,
    pub remaining_entropy: f64,
    pub pending_question_id: Option<String>,
    pub recommendations: Option<RecommendationResult>,
    pub created_at: DateTime<Utc>,
}

/// One answer submitted by the caller
#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    pub question_id: String,
    pub choice: String,
    pub response_time_ms: u64,
}

#[derive(Clone)]
pub struct SessionService {
    store: Arc<dyn StateStore>,
    domains: Arc<DomainRegistry>,
    catalog: Arc<dyn QuestionCatalog>,
    selector: QuestionSelector,
    orchestrator: RecommendationOrchestrator,
    entropy: EntropySettings,
    session_ttl: Duration,
}

impl SessionService {
    pub fn new(
        store: Arc<dyn StateStore>,
        domains: Arc<DomainRegistry>,
        catalog: Arc<dyn QuestionCatalog>,
        selector: QuestionSelector,
        orchestrator: RecommendationOrchestrator,
        entropy: EntropySettings,
        session_ttl: Duration,
    ) -> Self {
        Self {
            store,
            domains,
            catalog,
            selector,
            orchestrator,
            entropy,
            session_ttl,
        }
    }

    fn model(&self, profile: &DomainProfile) -> EntropyModel {
        EntropyModel::new(self.entropy, profile.archetype_count)
    }

    async fn load(&self, session_id: Uuid) -> AppResult<SessionState> {
        match self.store.get(&StoreKey::Session(session_id)).await? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Err(AppError::SessionNotFound(session_id.to_string())),
        }
    }

    /// Last writer wins; every write refreshes the TTL
    async fn save(&self, session: &SessionState) -> AppResult<()> {
        self.store
            .put(
                &StoreKey::Session(session.session_id),
                &serde_json::to_string(session)?,
                Some(self.session_ttl),
            )
            .await
    }

    /// Opens a session and returns its pivot question
    #[tracing::instrument(skip(self, context))]
    pub async fn start(&self, domain: &str, context: SessionContext) -> AppResult<SessionStart> {
        let profile = self.domains.require(domain)?;
        context.validate()?;

        let now = Utc::now();
        let mut session = SessionState::new(domain, context.with_defaults(now), now);

        let question = self
            .selector
            .select_next(&session, profile, &[])
            .await?
            .ok_or_else(|| {
                AppError::CatalogUnavailable(format!("no pivot question for domain '{}'", domain))
            })?;

        session.ask(&question, now);
        self.save(&session).await?;

        tracing::info!(
            session_id = %session.session_id,
            question_id = %question.id,
            "Session started"
        );

        Ok(SessionStart {
            session_id: session.session_id,
            question: question.into(),
        })
    }

    /// Records one answer and either asks the next question or finalizes
    #[tracing::instrument(skip(self, answer), fields(question_id = %answer.question_id))]
    pub async fn answer(&self, session_id: Uuid, answer: Answer) -> AppResult<TurnOutcome> {
        let mut session = self.load(session_id).await?;
        let profile = self.domains.require(&session.domain)?;

        match session.phase {
            SessionPhase::Finalized => {
                // Retried turn whose response never reached the caller
                let recommendations = session.recommendations.clone().ok_or_else(|| {
                    AppError::Internal(format!("session {} finalized without results", session_id))
                })?;
                return Ok(TurnOutcome::Complete { recommendations });
            }
            SessionPhase::Finalizing => return self.finalize(session, profile).await,
            SessionPhase::Eliciting => {}
        }

        let now = Utc::now();
        session.record_choice(
            &answer.question_id,
            &answer.choice,
            answer.response_time_ms,
            now,
        )?;

        let model = self.model(profile);
        if model.should_stop(&session) {
            tracing::info!(
                answered = session.choice_count(),
                remaining_entropy = model.remaining(session.choice_count()),
                "Stop condition reached"
            );
            return self.finalize(session, profile).await;
        }

        match self.selector.select_next(&session, profile, &[]).await {
            Ok(Some(question)) => {
                session.ask(&question, now);
                self.save(&session).await?;
                Ok(TurnOutcome::Question {
                    question: question.into(),
                    remaining_entropy: model.remaining(session.choice_count()),
                })
            }
            Ok(None) => self.finalize(session, profile).await,
            Err(AppError::CatalogUnavailable(reason)) => {
                tracing::warn!(reason = %reason, "Catalog unavailable, finalizing early");
                self.finalize(session, profile).await
            }
            Err(e) => Err(e),
        }
    }

    async fn finalize(
        &self,
        mut session: SessionState,
        profile: &DomainProfile,
    ) -> AppResult<TurnOutcome> {
        session.begin_finalizing(Utc::now());

        let recommendations = self.orchestrator.get_recommendations(&session, profile).await;
        session.finalize(recommendations.clone(), Utc::now())?;
        self.save(&session).await?;

        tracing::info!(
            session_id = %session.session_id,
            provenance = %recommendations.provenance,
            "Session finalized"
        );

        Ok(TurnOutcome::Complete { recommendations })
    }

    pub async fn get_session(&self, session_id: Uuid) -> AppResult<SessionSummary> {
        let session = self.load(session_id).await?;
        let profile = self.domains.require(&session.domain)?;

        Ok(SessionSummary {
            session_id: session.session_id,
            domain: session.domain.clone(),
            phase: session.phase,
            answered: session.choice_count(),
            remaining_entropy: self.model(profile).remaining(session.choice_count()),
            pending_question_id: session.pending.as_ref().map(|p| p.question_id.clone()),
            recommendations: session.recommendations.clone(),
            created_at: session.created_at,
        })
    }

    /// Folds the caller's satisfaction into the stats of every answered
    /// question. Accepted once per finalized session.
    #[tracing::instrument(skip(self))]
    pub async fn record_feedback(&self, session_id: Uuid, satisfaction: f64) -> AppResult<()> {
        if !(0.0..=1.0).contains(&satisfaction) {
            return Err(AppError::Validation(
                "satisfaction must be between 0 and 1".to_string(),
            ));
        }

        let mut session = self.load(session_id).await?;
        if !session.is_finalized() {
            return Err(AppError::Validation(
                "feedback is only accepted for finalized sessions".to_string(),
            ));
        }
        if session.feedback_recorded {
            return Err(AppError::Validation(
                "feedback already recorded for this session".to_string(),
            ));
        }

        let profile = self.domains.require(&session.domain)?;
        let question_ids: Vec<String> = session
            .choices
            .iter()
            .map(|c| c.question_id.clone())
            .collect();

        self.catalog
            .record_feedback(
                &question_ids,
                self.model(profile).normalized_gain_per_choice(),
                satisfaction,
            )
            .await?;

        session.feedback_recorded = true;
        session.updated_at = Utc::now();
        self.save(&session).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::models::{Candidate, Provenance};
    use crate::services::{
        catalog::{CandidateQuery, StaticCatalog},
        circuit_breaker::{BreakerSettings, CircuitBreaker},
        providers::MockGenerationService,
        recommendation_cache::RecommendationCache,
        telemetry::TracingTelemetry,
    };
    use std::sync::atomic::{AtomicBool, Ordering};

    const MOVIES_PAYLOAD: &str = r#"{"items": [
        {"title": "Arrival", "reason": "a"},
        {"title": "Enemy", "reason": "b"},
        {"title": "Heat", "reason": "c"}
    ], "confidence": 0.9}"#;

    /// Static catalog that can be switched off mid-session
    struct SwitchableCatalog {
        inner: StaticCatalog,
        down: AtomicBool,
    }

    #[async_trait::async_trait]
    impl QuestionCatalog for SwitchableCatalog {
        async fn pivot(&self, domain: &str) -> AppResult<Candidate> {
            if self.down.load(Ordering::SeqCst) {
                return Err(AppError::CatalogUnavailable("switched off".into()));
            }
            self.inner.pivot(domain).await
        }

        async fn candidates(&self, query: &CandidateQuery) -> AppResult<Vec<Candidate>> {
            if self.down.load(Ordering::SeqCst) {
                return Err(AppError::CatalogUnavailable("switched off".into()));
            }
            self.inner.candidates(query).await
        }

        async fn record_feedback(
            &self,
            question_ids: &[String],
            info_gain: f64,
            satisfaction: f64,
        ) -> AppResult<()> {
            self.inner
                .record_feedback(question_ids, info_gain, satisfaction)
                .await
        }
    }

    struct Harness {
        service: SessionService,
        catalog: Arc<SwitchableCatalog>,
    }

    fn harness(generator: MockGenerationService, entropy: EntropySettings) -> Harness {
        harness_with_ttl(generator, entropy, Duration::from_secs(3600))
    }

    fn harness_with_ttl(
        generator: MockGenerationService,
        entropy: EntropySettings,
        session_ttl: Duration,
    ) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let catalog = Arc::new(SwitchableCatalog {
            inner: StaticCatalog::builtin().unwrap(),
            down: AtomicBool::new(false),
        });
        let telemetry = Arc::new(TracingTelemetry);

        let orchestrator = RecommendationOrchestrator::new(
            RecommendationCache::new(store.clone(), Duration::from_secs(3600)),
            CircuitBreaker::new(store.clone(), "generation", BreakerSettings::default()),
            Arc::new(generator),
            telemetry.clone(),
            entropy,
        );

        let service = SessionService::new(
            store,
            Arc::new(DomainRegistry::builtin().unwrap()),
            catalog.clone(),
            QuestionSelector::new(catalog.clone(), telemetry),
            orchestrator,
            entropy,
            session_ttl,
        );

        Harness { service, catalog }
    }

    /// Stops after the pivot answer
    fn single_question() -> EntropySettings {
        EntropySettings {
            max_questions_per_session: 1,
            ..EntropySettings::default()
        }
    }

    fn generator(times: usize) -> MockGenerationService {
        let mut generator = MockGenerationService::new();
        generator
            .expect_generate()
            .times(times)
            .returning(|_| Ok(MOVIES_PAYLOAD.to_string()));
        generator
    }

    fn answer_for(question: &QuestionView, choice: &str) -> Answer {
        Answer {
            question_id: question.id.clone(),
            choice: choice.to_string(),
            response_time_ms: 1500,
        }
    }

    fn first_option(question: &QuestionView) -> Answer {
        answer_for(question, &question.options[0].value)
    }

    #[tokio::test]
    async fn test_start_returns_pivot() {
        let h = harness(generator(0), EntropySettings::default());
        let start = h.service.start("movies", SessionContext::new()).await.unwrap();

        assert_eq!(start.question.id, "mv_pivot");
        let summary = h.service.get_session(start.session_id).await.unwrap();
        assert_eq!(summary.phase, SessionPhase::Eliciting);
        assert_eq!(summary.pending_question_id.as_deref(), Some("mv_pivot"));
        assert_eq!(summary.answered, 0);
    }

    #[tokio::test]
    async fn test_start_rejects_unknown_domain() {
        let h = harness(generator(0), EntropySettings::default());
        let result = h.service.start("podcasts", SessionContext::new()).await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn test_start_with_catalog_down_is_unavailable() {
        let h = harness(generator(0), EntropySettings::default());
        h.catalog.down.store(true, Ordering::SeqCst);

        let result = h.service.start("movies", SessionContext::new()).await;
        assert!(matches!(result, Err(AppError::CatalogUnavailable(_))));
    }

    #[tokio::test]
    async fn test_movies_session_completes_after_five_answers() {
        let h = harness(generator(1), EntropySettings::default());
        let start = h.service.start("movies", SessionContext::new()).await.unwrap();

        let mut outcome = h
            .service
            .answer(start.session_id, answer_for(&start.question, "challenge"))
            .await
            .unwrap();

        let mut asked = vec![start.question.id.clone()];
        for turn in 2..=5 {
            let TurnOutcome::Question {
                question,
                remaining_entropy,
            } = outcome
            else {
                panic!("expected a question before answer {}", turn);
            };
            assert!(remaining_entropy >= 0.3);
            assert!(!asked.contains(&question.id), "question {} repeated", question.id);
            asked.push(question.id.clone());

            outcome = h
                .service
                .answer(start.session_id, first_option(&question))
                .await
                .unwrap();
        }

        let TurnOutcome::Complete { recommendations } = outcome else {
            panic!("expected recommendations after five answers");
        };
        assert_eq!(recommendations.provenance, Provenance::Generated);
        assert_eq!(recommendations.items.len(), 3);

        let summary = h.service.get_session(start.session_id).await.unwrap();
        assert_eq!(summary.phase, SessionPhase::Finalized);
        assert_eq!(summary.answered, 5);
        assert!((summary.remaining_entropy - 0.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_branch_restricts_followups() {
        let h = harness(generator(0), EntropySettings::default());
        let start = h.service.start("movies", SessionContext::new()).await.unwrap();

        let outcome = h
            .service
            .answer(start.session_id, answer_for(&start.question, "comfort"))
            .await
            .unwrap();

        let TurnOutcome::Question { question, .. } = outcome else {
            panic!("expected a follow-up question");
        };
        assert_eq!(question.id, "mv_b_feeling");
    }

    #[tokio::test]
    async fn test_answer_to_finalized_session_returns_stored_result() {
        let h = harness(generator(1), single_question());
        let start = h.service.start("movies", SessionContext::new()).await.unwrap();
        let answer = answer_for(&start.question, "challenge");

        let first = h.service.answer(start.session_id, answer.clone()).await.unwrap();
        let retried = h.service.answer(start.session_id, answer).await.unwrap();

        assert!(matches!(first, TurnOutcome::Complete { .. }));
        assert_eq!(first, retried);
    }

    #[tokio::test]
    async fn test_rejects_answer_for_other_question() {
        let h = harness(generator(0), EntropySettings::default());
        let start = h.service.start("movies", SessionContext::new()).await.unwrap();

        let result = h
            .service
            .answer(
                start.session_id,
                Answer {
                    question_id: "mv_a_tone".to_string(),
                    choice: "bleak".to_string(),
                    response_time_ms: 100,
                },
            )
            .await;
        assert!(matches!(result, Err(AppError::Validation(_))));

        let bad_option = h
            .service
            .answer(start.session_id, answer_for(&start.question, "maybe"))
            .await;
        assert!(matches!(bad_option, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let h = harness(generator(0), EntropySettings::default());
        let result = h
            .service
            .answer(
                Uuid::new_v4(),
                Answer {
                    question_id: "mv_pivot".to_string(),
                    choice: "challenge".to_string(),
                    response_time_ms: 100,
                },
            )
            .await;
        assert!(matches!(result, Err(AppError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_catalog_outage_mid_session_finalizes() {
        let h = harness(generator(1), EntropySettings::default());
        let start = h.service.start("movies", SessionContext::new()).await.unwrap();

        h.catalog.down.store(true, Ordering::SeqCst);
        let outcome = h
            .service
            .answer(start.session_id, answer_for(&start.question, "challenge"))
            .await
            .unwrap();

        assert!(matches!(outcome, TurnOutcome::Complete { .. }));
    }

    #[tokio::test]
    async fn test_exhausted_branch_finalizes() {
        // Slow entropy decay: only running out of questions can end the session
        let h = harness(
            generator(1),
            EntropySettings {
                reduction_per_choice: 0.01,
                stop_threshold: 0.3,
                max_questions_per_session: 20,
            },
        );
        let start = h.service.start("series", SessionContext::new()).await.unwrap();

        let mut outcome = h
            .service
            .answer(start.session_id, answer_for(&start.question, "binge"))
            .await
            .unwrap();
        let mut answered = 1;
        while let TurnOutcome::Question { question, .. } = outcome {
            outcome = h
                .service
                .answer(start.session_id, first_option(&question))
                .await
                .unwrap();
            answered += 1;
        }

        // Pivot, two binge follow-ups and the contextual question
        assert_eq!(answered, 4);
        assert!(matches!(outcome, TurnOutcome::Complete { .. }));
    }

    #[tokio::test]
    async fn test_feedback_once_per_finalized_session() {
        let h = harness(generator(1), single_question());
        let start = h.service.start("movies", SessionContext::new()).await.unwrap();

        let early = h.service.record_feedback(start.session_id, 0.8).await;
        assert!(matches!(early, Err(AppError::Validation(_))));

        h.service
            .answer(start.session_id, answer_for(&start.question, "comfort"))
            .await
            .unwrap();

        assert!(h.service.record_feedback(start.session_id, 1.5).await.is_err());
        h.service.record_feedback(start.session_id, 0.8).await.unwrap();
        assert!(h.service.record_feedback(start.session_id, 0.8).await.is_err());

        let stats = h.catalog.inner.performance_of("mv_pivot").unwrap();
        assert_eq!(stats.usage_count, 1);
        assert!((stats.avg_satisfaction - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_session_expires_after_ttl() {
        let h = harness_with_ttl(
            generator(0),
            EntropySettings::default(),
            Duration::from_millis(30),
        );
        let start = h.service.start("movies", SessionContext::new()).await.unwrap();
        assert!(h.service.get_session(start.session_id).await.is_ok());

        tokio::time::sleep(Duration::from_millis(60)).await;

        let answered = h
            .service
            .answer(start.session_id, answer_for(&start.question, "challenge"))
            .await;
        assert!(matches!(answered, Err(AppError::SessionNotFound(_))));
        assert!(matches!(
            h.service.get_session(start.session_id).await,
            Err(AppError::SessionNotFound(_))
        ));
        assert!(matches!(
            h.service.record_feedback(start.session_id, 0.5).await,
            Err(AppError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_each_turn_refreshes_session_ttl() {
        let h = harness_with_ttl(
            generator(0),
            EntropySettings::default(),
            Duration::from_millis(400),
        );
        let start = h.service.start("movies", SessionContext::new()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;
        h.service
            .answer(start.session_id, answer_for(&start.question, "challenge"))
            .await
            .unwrap();

        // Past the original expiry but within the refreshed one
        tokio::time::sleep(Duration::from_millis(250)).await;
        let summary = h.service.get_session(start.session_id).await.unwrap();
        assert_eq!(summary.answered, 1);
    }
}
