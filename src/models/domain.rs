use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{AppError, AppResult};

use super::{QuestionType, RecommendationItem, SessionContext};

const BUILTIN_DOMAINS: &str = include_str!("../../config/domains.json");

pub const MIN_TARGET_COUNT: usize = 3;
pub const MAX_TARGET_COUNT: usize = 5;

/// Candidate pool selected by the pivot answer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Branch {
    /// Follow-up type eligible in this branch
    pub question_type: QuestionType,
    pub categories: Vec<String>,
}

/// Context rule granting a selection bonus to some categories,
/// e.g. short-format questions on mobile
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AffinityRule {
    /// Context key the rule looks at
    pub signal: String,
    pub equals: String,
    pub categories: Vec<String>,
}

impl AffinityRule {
    pub fn applies(&self, context: &SessionContext, category: &str) -> bool {
        context
            .get(&self.signal)
            .is_some_and(|v| v.eq_ignore_ascii_case(&self.equals))
            && self.categories.iter().any(|c| c == category)
    }
}

/// Per-domain tuning: decision tree shape, output size and curated pools
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DomainProfile {
    pub name: String,
    /// Number of user archetypes the domain distinguishes
    #[serde(default = "default_archetype_count")]
    pub archetype_count: u32,
    /// Number of recommendations returned per session
    pub target_count: usize,
    /// Keyed by the pivot answer value
    pub branches: BTreeMap<String, Branch>,
    #[serde(default)]
    pub affinity_rules: Vec<AffinityRule>,
    /// Curated fallback items keyed by preference bucket (`a` or `a/b`)
    #[serde(default)]
    pub fallback_pools: BTreeMap<String, Vec<RecommendationItem>>,
    pub serendipity: Vec<RecommendationItem>,
}

fn default_archetype_count() -> u32 {
    8
}

impl DomainProfile {
    pub fn branch_for(&self, pivot_choice: &str) -> Option<&Branch> {
        self.branches.get(pivot_choice)
    }

    /// True when any affinity rule favors `category` under `context`
    pub fn context_affinity(&self, context: &SessionContext, category: &str) -> bool {
        self.affinity_rules
            .iter()
            .any(|rule| rule.applies(context, category))
    }

    fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("domain name cannot be empty".to_string());
        }
        if self.archetype_count < 2 {
            return Err(format!("{}: archetype_count must be at least 2", self.name));
        }
        if !(MIN_TARGET_COUNT..=MAX_TARGET_COUNT).contains(&self.target_count) {
            return Err(format!(
                "{}: target_count must be between {} and {}",
                self.name, MIN_TARGET_COUNT, MAX_TARGET_COUNT
            ));
        }
        if self.branches.is_empty() {
            return Err(format!("{}: at least one branch is required", self.name));
        }
        for (choice, branch) in &self.branches {
            if !branch.question_type.is_followup() {
                return Err(format!(
                    "{}: branch '{}' must use a follow-up question type",
                    self.name, choice
                ));
            }
        }
        if self.serendipity.len() < self.target_count {
            return Err(format!(
                "{}: serendipity pool needs at least {} items",
                self.name, self.target_count
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct DomainFile {
    domains: Vec<DomainProfile>,
}

/// Validated set of domain profiles
#[derive(Debug, Clone)]
pub struct DomainRegistry {
    domains: BTreeMap<String, DomainProfile>,
}

impl DomainRegistry {
    /// Parses and validates a domain table
    pub fn from_json(json: &str) -> AppResult<Self> {
        let file: DomainFile = serde_json::from_str(json)
            .map_err(|e| AppError::Internal(format!("Invalid domain table: {}", e)))?;

        let mut domains = BTreeMap::new();
        for profile in file.domains {
            profile.validate().map_err(AppError::Internal)?;
            if domains.insert(profile.name.clone(), profile).is_some() {
                return Err(AppError::Internal(
                    "Invalid domain table: duplicate domain name".to_string(),
                ));
            }
        }

        Ok(Self { domains })
    }

    /// The domain table compiled into the binary
    pub fn builtin() -> AppResult<Self> {
        Self::from_json(BUILTIN_DOMAINS)
    }

    pub fn from_path(path: &str) -> AppResult<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| AppError::Internal(format!("Cannot read {}: {}", path, e)))?;
        Self::from_json(&json)
    }

    pub fn get(&self, name: &str) -> Option<&DomainProfile> {
        self.domains.get(name)
    }

    /// Looks up a domain named by a caller
    pub fn require(&self, name: &str) -> AppResult<&DomainProfile> {
        self.get(name)
            .ok_or_else(|| AppError::Validation(format!("unknown domain '{}'", name)))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.domains.keys().map(String::as_str)
    }
}
