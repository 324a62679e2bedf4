/// Remaining-uncertainty model and the elicitation stop rule.
///
/// Everything here is a pure function of the session's answer count and
/// configuration. Entropy is measured in bits.

use crate::models::SessionState;

/// Tunables of the stop rule
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntropySettings {
    /// Bits removed by each answered question
    pub reduction_per_choice: f64,
    /// Elicitation stops once remaining entropy drops below this
    pub stop_threshold: f64,
    pub max_questions_per_session: usize,
}

impl Default for EntropySettings {
    fn default() -> Self {
        Self {
            reduction_per_choice: 0.55,
            stop_threshold: 0.3,
            max_questions_per_session: 6,
        }
    }
}

/// Entropy of a uniform prior over `archetype_count` user archetypes
pub fn initial_entropy(archetype_count: u32) -> f64 {
    if archetype_count <= 1 {
        return 0.0;
    }
    (archetype_count as f64).log2()
}

/// Uncertainty left after `choice_count` answers, floored at zero
pub fn remaining_entropy(
    archetype_count: u32,
    choice_count: usize,
    reduction_per_choice: f64,
) -> f64 {
    (initial_entropy(archetype_count) - choice_count as f64 * reduction_per_choice).max(0.0)
}

/// Shannon entropy of a discrete distribution. Weights are normalized first;
/// zero and negative weights contribute nothing.
pub fn shannon_entropy(weights: &[f64]) -> f64 {
    let total: f64 = weights.iter().filter(|w| **w > 0.0).sum();
    if total <= 0.0 {
        return 0.0;
    }

    weights
        .iter()
        .filter(|w| **w > 0.0)
        .map(|w| {
            let p = w / total;
            -p * p.log2()
        })
        .sum()
}

/// Stop rule for one domain
#[derive(Debug, Clone, Copy)]
pub struct EntropyModel {
    settings: EntropySettings,
    archetype_count: u32,
}

impl EntropyModel {
    pub fn new(settings: EntropySettings, archetype_count: u32) -> Self {
        Self {
            settings,
            archetype_count,
        }
    }

    pub fn initial(&self) -> f64 {
        initial_entropy(self.archetype_count)
    }

    pub fn remaining(&self, choice_count: usize) -> f64 {
        remaining_entropy(
            self.archetype_count,
            choice_count,
            self.settings.reduction_per_choice,
        )
    }

    /// Whether elicitation is over after `choice_count` answers
    pub fn should_stop_at(&self, choice_count: usize) -> bool {
        self.remaining(choice_count) < self.settings.stop_threshold
            || choice_count >= self.settings.max_questions_per_session
    }

    /// Sole termination condition of the ELICITING phase
    pub fn should_stop(&self, session: &SessionState) -> bool {
        self.should_stop_at(session.choice_count())
    }

    /// Share of the initial uncertainty one answer removes, in [0, 1].
    /// Recorded as the observed information gain of answered questions.
    pub fn normalized_gain_per_choice(&self) -> f64 {
        let initial = self.initial();
        if initial <= 0.0 {
            return 0.0;
        }
        (self.settings.reduction_per_choice / initial).clamp(0.0, 1.0)
    }
}
