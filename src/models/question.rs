use serde::{Deserialize, Serialize};
use std::{fmt::Display, str::FromStr};

/// Position of a question in the two-level decision tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    /// The single opening question of a domain
    Pivot,
    /// Follow-up asked only inside branch A
    FollowupA,
    /// Follow-up asked only inside branch B
    FollowupB,
    /// Eligible in every branch
    Contextual,
}

impl QuestionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionType::Pivot => "pivot",
            QuestionType::FollowupA => "followup_a",
            QuestionType::FollowupB => "followup_b",
            QuestionType::Contextual => "contextual",
        }
    }

    pub fn is_followup(&self) -> bool {
        matches!(self, QuestionType::FollowupA | QuestionType::FollowupB)
    }
}

impl Display for QuestionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuestionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pivot" => Ok(QuestionType::Pivot),
            "followup_a" => Ok(QuestionType::FollowupA),
            "followup_b" => Ok(QuestionType::FollowupB),
            "contextual" => Ok(QuestionType::Contextual),
            other => Err(format!("unknown question type '{}'", other)),
        }
    }
}

/// One side of a binary question
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuestionOption {
    /// Value recorded in the session when this side is picked
    pub value: String,
    /// Text shown to the user
    pub label: String,
}

/// A binary question from the catalog
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Question {
    pub id: String,
    pub text: String,
    pub category: String,
    pub domain: String,
    #[serde(rename = "type")]
    pub question_type: QuestionType,
    pub options: Vec<QuestionOption>,
    pub expected_info_gain: f64,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl Question {
    /// Checks the shape every catalog row must have
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("question id cannot be empty".to_string());
        }
        if self.options.len() != 2 {
            return Err(format!(
                "question '{}' must have exactly two options, found {}",
                self.id,
                self.options.len()
            ));
        }
        if self.options[0].value == self.options[1].value {
            return Err(format!("question '{}' has duplicate option values", self.id));
        }
        if !(0.0..=1.0).contains(&self.expected_info_gain) {
            return Err(format!(
                "question '{}' expected_info_gain {} outside [0, 1]",
                self.id, self.expected_info_gain
            ));
        }
        Ok(())
    }
}

/// Historical statistics for a question, fed by session feedback
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuestionPerformance {
    pub question_id: String,
    pub avg_info_gain: f64,
    pub usage_count: u64,
    pub avg_satisfaction: f64,
}

impl QuestionPerformance {
    /// Stats for a question nobody has rated yet. Satisfaction starts at the
    /// neutral midpoint so it neither helps nor hurts ranking.
    pub fn unseen(question_id: impl Into<String>) -> Self {
        Self {
            question_id: question_id.into(),
            avg_info_gain: 0.0,
            usage_count: 0,
            avg_satisfaction: 0.5,
        }
    }

    /// Folds one observation into the running averages
    pub fn record(&mut self, info_gain: f64, satisfaction: f64) {
        let n = self.usage_count as f64;
        self.avg_info_gain = (self.avg_info_gain * n + info_gain) / (n + 1.0);
        self.avg_satisfaction = (self.avg_satisfaction * n + satisfaction) / (n + 1.0);
        self.usage_count += 1;
    }
}

/// A question together with its performance stats, as ranked by the selector
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub question: Question,
    pub performance: QuestionPerformance,
}
