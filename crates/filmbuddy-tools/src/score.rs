//! Confidence scoring for fuzzy entity resolution.
//!
//! A resolver search returns candidate (id, name) rows; the preparer only
//! accepts the top match when its confidence clears a fixed threshold.
//! Confidence is the top similarity, penalized when the runner-up is close
//! enough to make the pick ambiguous — an ambiguous match must never be
//! silently guessed.

use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;

/// Minimum confidence for accepting a resolved identifier.
pub const CONFIDENCE_THRESHOLD: f64 = 0.8;

/// Similarity gap below which the top two candidates are ambiguous.
const AMBIGUITY_GAP: f64 = 0.05;

/// Penalty factor applied to an ambiguous top match. Chosen so that two
/// near-identical candidates always land below the acceptance threshold.
const AMBIGUITY_PENALTY: f64 = 0.6;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    pub id: String,
    pub name: String,
    pub confidence: f64,
}

fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
}

/// Score candidates against the query and pick a best match with a
/// confidence value. Returns `None` for an empty candidate set.
pub fn score_candidates(query: &str, candidates: &[(String, String)]) -> Option<Resolution> {
    let needle = normalize(query);
    if needle.is_empty() || candidates.is_empty() {
        return None;
    }

    let mut scored: Vec<(usize, f64)> = candidates
        .iter()
        .enumerate()
        .map(|(idx, (_, name))| (idx, jaro_winkler(&needle, &normalize(name))))
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let (best_idx, best_score) = scored[0];
    let runner_up = scored.get(1).map(|(_, s)| *s).unwrap_or(0.0);
    let confidence = if best_score - runner_up < AMBIGUITY_GAP && scored.len() > 1 {
        best_score * AMBIGUITY_PENALTY
    } else {
        best_score
    };

    let (id, name) = &candidates[best_idx];
    Some(Resolution {
        id: id.clone(),
        name: name.clone(),
        confidence,
    })
}

/// Convenience predicate for the preparer.
pub fn is_confident(resolution: &Resolution) -> bool {
    resolution.confidence >= CONFIDENCE_THRESHOLD
}
