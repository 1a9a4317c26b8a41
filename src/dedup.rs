//! Fact near-duplicate detection.
//!
//! Pure functions implementing §3.3 invariant 3: two facts for the same
//! entity are considered equal if the token-set overlap of the new fact
//! against the existing one exceeds 0.7. Exposed standalone so the merge
//! algorithm and tests can exercise the rule without a vault on disk.

use std::collections::HashSet;

/// Threshold above which two facts are considered near-duplicates (§3.3 #3).
pub const JACCARD_THRESHOLD: f32 = 0.7;

fn normalized_tokens(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Computes `|new ∩ existing| / |new|` over normalized (lowercased,
/// whitespace-split) token sets, matching the reference's `_fact_exists`
/// overlap computation exactly. Returns `0.0` if `new_fact` has no tokens.
#[must_use]
pub fn jaccard_overlap(new_fact: &str, existing_fact: &str) -> f32 {
    let new_tokens = normalized_tokens(new_fact);
    if new_tokens.is_empty() {
        return 0.0;
    }
    let existing_tokens = normalized_tokens(existing_fact);
    let overlap = new_tokens.intersection(&existing_tokens).count();
    #[allow(clippy::cast_precision_loss)]
    {
        overlap as f32 / new_tokens.len() as f32
    }
}

/// Returns `true` if `new_fact` is a near-duplicate of any fact already in
/// `existing_facts`, i.e. the overlap exceeds [`JACCARD_THRESHOLD`].
#[must_use]
pub fn fact_exists(new_fact: &str, existing_facts: &[String]) -> bool {
    existing_facts
        .iter()
        .any(|existing| jaccard_overlap(new_fact, existing) > JACCARD_THRESHOLD)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_facts_are_duplicates() {
        assert!(fact_exists("uses Python", &["uses Python".to_string()]));
    }

    #[test]
    fn test_high_overlap_is_duplicate() {
        assert!(fact_exists(
            "works at Uzum Bank",
            &["Works At Uzum Bank".to_string()]
        ));
    }

    #[test]
    fn test_low_overlap_is_not_duplicate() {
        assert!(!fact_exists(
            "switched to Svelte",
            &["uses React".to_string()]
        ));
    }

    #[test]
    fn test_empty_new_fact_has_zero_overlap() {
        assert!((jaccard_overlap("", "uses Python") - 0.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_threshold_boundary_not_strictly_greater_is_not_duplicate() {
        // "a b c d" vs "a b" -> overlap = 2/4 = 0.5, below threshold
        assert!(!fact_exists("a b c d", &["a b".to_string()]));
    }
}
