use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// A single recommended title
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecommendationItem {
    pub title: String,
    #[serde(default)]
    pub year: Option<i32>,
    /// Why this title fits the user's answers
    pub reason: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Where a recommendation set came from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Cache,
    Generated,
    Fallback,
}

impl Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Provenance::Cache => write!(f, "cache"),
            Provenance::Generated => write!(f, "generated"),
            Provenance::Fallback => write!(f, "fallback"),
        }
    }
}

/// Final output of a session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecommendationResult {
    pub items: Vec<RecommendationItem>,
    pub provenance: Provenance,
    pub confidence: f64,
    pub generated_at: DateTime<Utc>,
}

/// Cached recommendation set keyed by session fingerprint.
///
/// `payload.provenance` records how the set was originally produced
/// (`generated` or `fallback`); callers served from the cache see `cache`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub payload: RecommendationResult,
    pub hit_count: u64,
}
