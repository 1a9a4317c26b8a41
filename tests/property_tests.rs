//! Property-based invariants (§8) over fact deduplication, the markdown
//! codec's round-trip behavior, and hybrid retrieval's score/dedup
//! guarantees.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use mengram::dedup::{fact_exists, jaccard_overlap};
use mengram::embedding::FallbackEmbedder;
use mengram::graph::KnowledgeGraph;
use mengram::markdown::{extract_tags, extract_wikilinks, parse_frontmatter};
use mengram::retrieval::HybridRetriever;
use mengram::vector::VectorIndex;
use proptest::prelude::*;
use std::collections::HashSet;

fn word() -> impl Strategy<Value = String> {
    "[a-z]{2,8}"
}

fn word_list(max_len: usize) -> impl Strategy<Value = Vec<String>> {
    proptest::collection::vec(word(), 0..max_len)
}

proptest! {
    /// A fact is always its own near-duplicate: overlap of a non-empty
    /// fact against itself is exactly 1.0, which exceeds the threshold.
    #[test]
    fn fact_always_duplicates_itself(words in word_list(10)) {
        prop_assume!(!words.is_empty());
        let fact = words.join(" ");
        prop_assert!((jaccard_overlap(&fact, &fact) - 1.0).abs() < f32::EPSILON);
        prop_assert!(fact_exists(&fact, &[fact.clone()]));
    }

    /// Overlap is always within `[0, 1]`, and an empty new fact always
    /// reports zero overlap regardless of what it's compared against.
    #[test]
    fn overlap_is_bounded_and_empty_fact_has_no_overlap(
        new_words in word_list(10),
        existing_words in word_list(10),
    ) {
        let new_fact = new_words.join(" ");
        let existing_fact = existing_words.join(" ");
        let overlap = jaccard_overlap(&new_fact, &existing_fact);
        prop_assert!((0.0..=1.0).contains(&overlap));
        if new_fact.trim().is_empty() {
            prop_assert!((overlap - 0.0).abs() < f32::EPSILON);
        }
    }

    /// Case never affects overlap: the dedup rule normalizes to lowercase
    /// before tokenizing.
    #[test]
    fn overlap_is_case_insensitive(words in word_list(8)) {
        prop_assume!(!words.is_empty());
        let lower = words.join(" ");
        let upper = lower.to_uppercase();
        let overlap = jaccard_overlap(&upper, &lower);
        prop_assert!((overlap - 1.0).abs() < f32::EPSILON);
    }

    /// Appending extra tokens to a fact can only shrink its overlap
    /// against the unmodified original, never grow it, since the
    /// denominator (new fact's token count) only increases.
    #[test]
    fn appending_tokens_never_increases_overlap(
        base in word_list(6),
        extra in proptest::collection::vec("[a-z]{10,16}", 1..6),
    ) {
        prop_assume!(!base.is_empty());
        let existing = base.join(" ");
        let mut combined = base.clone();
        combined.extend(extra.iter().cloned());
        let extended = combined.join(" ");
        prop_assert!(jaccard_overlap(&extended, &existing) <= jaccard_overlap(&existing, &existing) + f32::EPSILON);
    }
}

proptest! {
    /// Front matter parsing never panics on arbitrary key/value text, and
    /// a block it did parse always round-trips its own keys back out.
    #[test]
    fn frontmatter_roundtrips_known_keys(
        entity_type in "[a-z]{3,10}",
        created in "[0-9]{4}-[0-9]{2}-[0-9]{2}",
    ) {
        let content = format!("---\ntype: {entity_type}\ncreated: {created}\n---\nbody");
        let (fm, body) = parse_frontmatter(&content);
        prop_assert_eq!(fm.get("type"), Some(&entity_type));
        prop_assert_eq!(fm.get("created"), Some(&created));
        prop_assert_eq!(body, "body");
    }

    /// Every wikilink target extracted from synthesized text matches the
    /// name that was wrapped in `[[ ]]`, for any name free of brackets and
    /// pipes.
    #[test]
    fn wikilink_target_matches_wrapped_name(name in "[A-Za-z][A-Za-z0-9 ]{0,20}") {
        let name = name.trim().to_string();
        prop_assume!(!name.is_empty());
        let content = format!("See [[{name}]] for details.");
        let links = extract_wikilinks(&content);
        prop_assert_eq!(links.len(), 1);
        prop_assert_eq!(links[0].target.as_str(), name.as_str());
        prop_assert_eq!(links[0].alias.as_ref(), None);
    }

    /// Every inline `#tag` synthesized into body text is present in the
    /// extracted tag set.
    #[test]
    fn inline_tags_are_always_extracted(tag in "[a-z][a-z0-9_-]{1,12}") {
        let content = format!("Some text #{tag} more text");
        let tags = extract_tags(&content, &std::collections::BTreeMap::new());
        prop_assert!(tags.contains(&tag));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Graph expansion from a set of direct matches never re-lists an
    /// entity that was already a direct match (§8 property: direct/graph
    /// id disjointness), across randomly generated chain lengths.
    #[test]
    fn graph_context_never_overlaps_direct_matches(chain_len in 2usize..8) {
        let notes: Vec<(String, String)> = (0..chain_len)
            .map(|i| {
                let name = format!("Node{i}");
                let body = if i + 1 < chain_len {
                    format!("---\ntype: concept\n---\n\n# {name}\n\n## Relations\n\n- → **next** [[Node{}]]\n", i + 1)
                } else {
                    format!("---\ntype: concept\n---\n\n# {name}\n\n## Facts\n\n- terminal node fact\n")
                };
                (name, body)
            })
            .collect();

        let embedder = FallbackEmbedder::new(32);
        let graph = KnowledgeGraph::build(&notes);
        let vector = VectorIndex::build(&notes, &embedder, 500).expect("build vector index");
        let retriever = HybridRetriever::new(&graph, &vector);

        let result = retriever.query("terminal node fact", &embedder, chain_len, chain_len, 0.0).expect("query");
        let direct: HashSet<&str> = result.direct_matches.iter().map(|m| m.entity_name.as_str()).collect();
        for entry in &result.graph_context {
            prop_assert!(!direct.contains(entry.entity_name.as_str()));
        }
    }

    /// Every direct match returned by a query has a score at or above the
    /// `min_score` floor passed in.
    #[test]
    fn direct_matches_never_fall_below_min_score(min_score in 0.0f32..0.9) {
        let notes = vec![
            ("Alpha".to_string(), "---\ntype: concept\n---\n\n# Alpha\n\n## Facts\n\n- alpha fact one\n- alpha fact two\n".to_string()),
            ("Beta".to_string(), "---\ntype: concept\n---\n\n# Beta\n\n## Facts\n\n- beta fact about something else\n".to_string()),
        ];
        let embedder = FallbackEmbedder::new(32);
        let graph = KnowledgeGraph::build(&notes);
        let vector = VectorIndex::build(&notes, &embedder, 500).expect("build vector index");
        let retriever = HybridRetriever::new(&graph, &vector);

        let result = retriever.query("alpha fact", &embedder, 10, 1, min_score).expect("query");
        for m in &result.direct_matches {
            prop_assert!(m.score >= min_score);
        }
    }
}
