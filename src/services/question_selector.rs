use std::cmp::Ordering;
use std::sync::Arc;

use crate::{
    error::AppResult,
    models::{Candidate, DomainProfile, Question, QuestionType, SessionContext, SessionState},
    services::{
        catalog::{CandidateQuery, QuestionCatalog},
        telemetry::{SelectionEvent, TelemetrySink},
    },
};

/// Maximum weight of the bonus for rarely asked questions
const EXPLORATION_WEIGHT: f64 = 0.1;
/// Usage count at which a question stops earning an exploration bonus
const EXPLORATION_SATURATION: f64 = 100.0;
const PERFORMANCE_WEIGHT: f64 = 0.2;
const CONTEXT_BONUS: f64 = 0.1;
/// Upper bound on rows fetched per selection
const CANDIDATE_LIMIT: usize = 50;
const SCORE_EPSILON: f64 = 1e-9;

/// A candidate with its selection score
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredCandidate {
    pub candidate: Candidate,
    pub score: f64,
}

/// `expectedInfoGain + exploration + performance + context`
pub fn score_candidate(
    candidate: &Candidate,
    profile: &DomainProfile,
    context: &SessionContext,
) -> f64 {
    let usage = candidate.performance.usage_count as f64;
    let exploration = (1.0 - usage / EXPLORATION_SATURATION).max(0.0) * EXPLORATION_WEIGHT;
    let performance = (candidate.performance.avg_satisfaction - 0.5) * PERFORMANCE_WEIGHT;
    let context_bonus = if profile.context_affinity(context, &candidate.question.category) {
        CONTEXT_BONUS
    } else {
        0.0
    };

    candidate.question.expected_info_gain + exploration + performance + context_bonus
}

/// Highest score first; ties go to the less used question, then the lower id
fn compare(a: &ScoredCandidate, b: &ScoredCandidate) -> Ordering {
    if (a.score - b.score).abs() > SCORE_EPSILON {
        return b.score.total_cmp(&a.score);
    }
    a.candidate
        .performance
        .usage_count
        .cmp(&b.candidate.performance.usage_count)
        .then_with(|| a.candidate.question.id.cmp(&b.candidate.question.id))
}

/// Scores every candidate and returns the winner
pub fn pick_best(
    candidates: Vec<Candidate>,
    profile: &DomainProfile,
    context: &SessionContext,
) -> Option<ScoredCandidate> {
    candidates
        .into_iter()
        .map(|candidate| {
            let score = score_candidate(&candidate, profile, context);
            ScoredCandidate { candidate, score }
        })
        .min_by(compare)
}

/// Chooses the next question of a session
#[derive(Clone)]
pub struct QuestionSelector {
    catalog: Arc<dyn QuestionCatalog>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl QuestionSelector {
    pub fn new(catalog: Arc<dyn QuestionCatalog>, telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self { catalog, telemetry }
    }

    /// Returns the best next question, or `None` when nothing eligible is left.
    ///
    /// Questions already in the session history are always excluded on top
    /// of `exclude_ids`. A catalog outage surfaces as `CatalogUnavailable`.
    #[tracing::instrument(
        skip_all,
        fields(session_id = %session.session_id, answered = session.choice_count())
    )]
    pub async fn select_next(
        &self,
        session: &SessionState,
        profile: &DomainProfile,
        exclude_ids: &[String],
    ) -> AppResult<Option<Question>> {
        let mut excluded = session.asked_question_ids();
        excluded.extend(exclude_ids.iter().cloned());

        let candidates: Vec<Candidate> = self
            .eligible(session, profile, &excluded)
            .await?
            .into_iter()
            .filter(|c| !excluded.contains(&c.question.id))
            .collect();

        let candidate_count = candidates.len();
        let Some(best) = pick_best(candidates, profile, &session.context) else {
            tracing::info!("No eligible questions left");
            return Ok(None);
        };

        tracing::debug!(
            question_id = %best.candidate.question.id,
            score = best.score,
            candidates = candidate_count,
            "Question selected"
        );

        let event = SelectionEvent {
            session_id: session.session_id,
            question_id: best.candidate.question.id.clone(),
            score: best.score,
        };
        if let Err(e) = self.telemetry.record_selection(&event).await {
            tracing::warn!(error = %e, "Failed to record selection event");
        }

        Ok(Some(best.candidate.question))
    }

    async fn eligible(
        &self,
        session: &SessionState,
        profile: &DomainProfile,
        excluded: &[String],
    ) -> AppResult<Vec<Candidate>> {
        let Some(branch_choice) = session.branch_choice() else {
            return Ok(vec![self.catalog.pivot(&session.domain).await?]);
        };

        let (branch_type, categories) = match profile.branch_for(branch_choice) {
            Some(branch) => (branch.question_type, branch.categories.clone()),
            None => {
                // Unmapped pivot answer: only contextual questions remain eligible
                tracing::warn!(
                    domain = %profile.name,
                    choice = %branch_choice,
                    "Pivot answer has no branch"
                );
                (QuestionType::FollowupA, Vec::new())
            }
        };

        self.catalog
            .candidates(&CandidateQuery {
                domain: session.domain.clone(),
                branch_type,
                categories,
                exclude_ids: excluded.to_vec(),
                limit: CANDIDATE_LIMIT,
            })
            .await
    }
}
