use std::collections::HashSet;

use crate::models::{DomainProfile, RecommendationItem, SessionState};

/// Confidence attached to every fallback result
pub const FALLBACK_CONFIDENCE: f64 = 0.6;

/// Preference bucket keys from most to least specific: `first/second`, `first`
pub fn bucket_keys(session: &SessionState) -> Vec<String> {
    let mut choices = session.choices.iter().map(|c| c.choice.as_str());
    match (choices.next(), choices.next()) {
        (Some(first), Some(second)) => vec![format!("{}/{}", first, second), first.to_string()],
        (Some(first), None) => vec![first.to_string()],
        _ => Vec::new(),
    }
}

/// Deterministic curated recommendations for a session.
///
/// Draws from the most specific matching pool, then the first-answer pool,
/// then the domain's serendipity pool, skipping repeated titles. Always
/// returns exactly `target_count` items, whatever the bucket.
pub fn fallback(session: &SessionState, profile: &DomainProfile) -> Vec<RecommendationItem> {
    let target = profile.target_count;
    let mut seen = HashSet::new();
    let mut items = Vec::with_capacity(target);

    let pools = bucket_keys(session)
        .into_iter()
        .filter_map(|key| profile.fallback_pools.get(&key))
        .chain(std::iter::once(&profile.serendipity));

    for item in pools.flatten() {
        if items.len() == target {
            break;
        }
        if seen.insert(item.title.to_lowercase()) {
            items.push(item.clone());
        }
    }

    // Only reachable with a pool table that repeats serendipity titles
    let mut n = 1;
    while items.len() < target {
        let title = format!("Editor's pick #{}", n);
        if seen.insert(title.to_lowercase()) {
            items.push(RecommendationItem {
                title,
                year: None,
                reason: format!("A popular {} pick", profile.name),
                tags: Vec::new(),
            });
        }
        n += 1;
    }

    items
}
