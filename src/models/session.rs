use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

use super::{Question, RecommendationResult};

pub const DEVICE_CLASS: &str = "device_class";
pub const TIME_OF_DAY: &str = "time_of_day";
pub const REFERRER: &str = "referrer";

const MAX_CONTEXT_ENTRIES: usize = 8;
const MAX_CONTEXT_LEN: usize = 64;
/// Upper bound on a plausible answer time; anything above is a client bug
pub const MAX_RESPONSE_TIME_MS: u64 = 10 * 60 * 1000;

/// Coarse signals captured when a session starts.
///
/// Backed by a sorted map so that serialization and fingerprinting never
/// depend on the order the caller supplied the keys in.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct SessionContext(BTreeMap<String, String>);

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.0.insert(key.to_string(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn device_class(&self) -> Option<&str> {
        self.get(DEVICE_CLASS)
    }

    pub fn time_of_day(&self) -> Option<&str> {
        self.get(TIME_OF_DAY)
    }

    /// Rejects oversized or empty context maps from callers
    pub fn validate(&self) -> AppResult<()> {
        if self.0.len() > MAX_CONTEXT_ENTRIES {
            return Err(AppError::Validation(format!(
                "context may hold at most {} entries",
                MAX_CONTEXT_ENTRIES
            )));
        }
        for (key, value) in &self.0 {
            if key.trim().is_empty() || key.len() > MAX_CONTEXT_LEN || value.len() > MAX_CONTEXT_LEN
            {
                return Err(AppError::Validation(format!(
                    "context entry '{}' is empty or longer than {} characters",
                    key, MAX_CONTEXT_LEN
                )));
            }
        }
        Ok(())
    }

    /// Fills the time-of-day bucket from the clock when the caller did not send one
    pub fn with_defaults(mut self, now: DateTime<Utc>) -> Self {
        self.0
            .entry(TIME_OF_DAY.to_string())
            .or_insert_with(|| time_of_day_bucket(now.hour()).to_string());
        self
    }

    /// Bucket used for cache fingerprints. Only the coarse signals take part;
    /// referrer and any extra keys are ignored.
    pub fn coarse_bucket(&self) -> String {
        format!(
            "device={};tod={}",
            self.device_class().unwrap_or("any").to_lowercase(),
            self.time_of_day().unwrap_or("any").to_lowercase()
        )
    }
}

/// Maps an hour of day (0-23) to its bucket
pub fn time_of_day_bucket(hour: u32) -> &'static str {
    match hour {
        5..=11 => "morning",
        12..=16 => "afternoon",
        17..=21 => "evening",
        _ => "late_night",
    }
}

/// State machine of a session
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Eliciting,
    Finalizing,
    Finalized,
}

/// One answered question
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Choice {
    pub question_id: String,
    pub category: String,
    pub choice: String,
    pub answered_at: DateTime<Utc>,
    pub response_time_ms: u64,
}

/// The question currently awaiting an answer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingQuestion {
    pub question_id: String,
    pub category: String,
    pub options: Vec<String>,
}

impl From<&Question> for PendingQuestion {
    fn from(question: &Question) -> Self {
        Self {
            question_id: question.id.clone(),
            category: question.category.clone(),
            options: question.options.iter().map(|o| o.value.clone()).collect(),
        }
    }
}

impl PendingQuestion {
    pub fn has_option(&self, value: &str) -> bool {
        self.options.iter().any(|o| o == value)
    }
}

/// Per-conversation record persisted in the session store between turns
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionState {
    pub session_id: Uuid,
    pub domain: String,
    pub context: SessionContext,
    pub choices: Vec<Choice>,
    pub pending: Option<PendingQuestion>,
    pub phase: SessionPhase,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub recommendations: Option<RecommendationResult>,
    #[serde(default)]
    pub feedback_recorded: bool,
}

impl SessionState {
    pub fn new(domain: impl Into<String>, context: SessionContext, now: DateTime<Utc>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            domain: domain.into(),
            context,
            choices: Vec::new(),
            pending: None,
            phase: SessionPhase::Eliciting,
            created_at: now,
            updated_at: now,
            finalized_at: None,
            recommendations: None,
            feedback_recorded: false,
        }
    }

    pub fn choice_count(&self) -> usize {
        self.choices.len()
    }

    pub fn is_finalized(&self) -> bool {
        self.phase == SessionPhase::Finalized
    }

    /// Ids of every question already answered or currently pending
    pub fn asked_question_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.choices.iter().map(|c| c.question_id.clone()).collect();
        if let Some(pending) = &self.pending {
            if !ids.contains(&pending.question_id) {
                ids.push(pending.question_id.clone());
            }
        }
        ids
    }

    /// Value of the first answer, which picks the branch
    pub fn branch_choice(&self) -> Option<&str> {
        self.choices.first().map(|c| c.choice.as_str())
    }

    pub fn ask(&mut self, question: &Question, now: DateTime<Utc>) {
        self.pending = Some(PendingQuestion::from(question));
        self.updated_at = now;
    }

    /// Appends the answer to the pending question.
    ///
    /// The history is append-only and the whole record is frozen once the
    /// session leaves the eliciting phase.
    pub fn record_choice(
        &mut self,
        question_id: &str,
        choice: &str,
        response_time_ms: u64,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        if self.phase != SessionPhase::Eliciting {
            return Err(AppError::Validation(
                "session is no longer accepting answers".to_string(),
            ));
        }
        if response_time_ms > MAX_RESPONSE_TIME_MS {
            return Err(AppError::Validation(format!(
                "response_time_ms must be at most {}",
                MAX_RESPONSE_TIME_MS
            )));
        }

        let pending = self.pending.as_ref().ok_or_else(|| {
            AppError::Validation("no question is awaiting an answer".to_string())
        })?;
        if pending.question_id != question_id {
            return Err(AppError::Validation(format!(
                "question '{}' is not the pending question",
                question_id
            )));
        }
        if !pending.has_option(choice) {
            return Err(AppError::Validation(format!(
                "'{}' is not an option of question '{}'",
                choice, question_id
            )));
        }

        self.choices.push(Choice {
            question_id: pending.question_id.clone(),
            category: pending.category.clone(),
            choice: choice.to_string(),
            answered_at: now,
            response_time_ms,
        });
        self.pending = None;
        self.updated_at = now;
        Ok(())
    }

    pub fn begin_finalizing(&mut self, now: DateTime<Utc>) {
        if self.phase == SessionPhase::Eliciting {
            self.phase = SessionPhase::Finalizing;
            self.pending = None;
            self.updated_at = now;
        }
    }

    /// Attaches the recommendations. Happens at most once per session.
    pub fn finalize(&mut self, result: RecommendationResult, now: DateTime<Utc>) -> AppResult<()> {
        if self.is_finalized() {
            return Err(AppError::Internal(format!(
                "session {} finalized twice",
                self.session_id
            )));
        }
        self.phase = SessionPhase::Finalized;
        self.pending = None;
        self.recommendations = Some(result);
        self.finalized_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Wall-clock time from session start to finalization (or now)
    pub fn duration_ms(&self, now: DateTime<Utc>) -> i64 {
        let end = self.finalized_at.unwrap_or(now);
        (end - self.created_at).num_milliseconds().max(0)
    }
}
