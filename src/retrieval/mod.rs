//! Hybrid retriever: fuses vector search with graph expansion (§4.8).

use crate::embedding::Embedder;
use crate::graph::{Direction, KnowledgeGraph};
use crate::vector::{SearchMatch, VectorIndex};
use crate::{Error, Result};
use std::collections::{HashSet, BTreeMap};

/// One entity reached via graph expansion from a direct match.
#[derive(Debug, Clone)]
pub struct GraphContextEntry {
    /// The entity's canonical name.
    pub entity_name: String,
    /// Relation type connecting it to the entity it was reached from.
    pub relation_type: String,
    /// Which side of that relation the expansion started on.
    pub direction: Direction,
}

/// The full result of one hybrid retrieval call (§4.8).
#[derive(Debug, Clone)]
pub struct RetrievalResult {
    /// The query text (or `"context:{name}"` for entity-anchored lookups).
    pub query: String,
    /// Direct vector matches.
    pub direct_matches: Vec<SearchMatch>,
    /// Entities reached via graph expansion from the direct matches.
    pub graph_context: Vec<GraphContextEntry>,
    /// The assembled natural-language context string.
    pub assembled_context: String,
}

/// Combines a [`VectorIndex`] and a [`KnowledgeGraph`] into ranked
/// entities plus an assembled context string (§4.8).
pub struct HybridRetriever<'a> {
    graph: &'a KnowledgeGraph,
    vector: &'a VectorIndex,
}

impl<'a> HybridRetriever<'a> {
    /// Builds a retriever over a tenant's derived graph and vector index.
    #[must_use]
    pub fn new(graph: &'a KnowledgeGraph, vector: &'a VectorIndex) -> Self {
        Self { graph, vector }
    }

    /// Vector top-K, expanded through the graph to `graph_depth` levels
    /// (§4.8 `query`).
    ///
    /// # Errors
    ///
    /// Returns an error if embedding the query fails.
    pub fn query(
        &self,
        text: &str,
        embedder: &dyn Embedder,
        top_k: usize,
        graph_depth: usize,
        min_score: f32,
    ) -> Result<RetrievalResult> {
        let direct_matches = self.vector.search(text, embedder, top_k, min_score)?;
        let graph_context = self.expand(&direct_matches, graph_depth);
        let assembled_context = assemble_context(&direct_matches, &graph_context);
        Ok(RetrievalResult {
            query: text.to_string(),
            direct_matches,
            graph_context,
            assembled_context,
        })
    }

    /// Treats every chunk of `name` as a direct match (score `1.0`) and
    /// expands from it (§4.8 "Entity-anchored variant").
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFoundError`] if no such entity exists.
    pub fn get_entity_context(&self, name: &str, graph_depth: usize) -> Result<RetrievalResult> {
        if self.graph.find_entity(name).is_none() {
            return Err(Error::NotFoundError(name.to_string()));
        }
        let direct_matches = self.vector.search_by_entity(name);
        let graph_context = self.expand(&direct_matches, graph_depth);
        let assembled_context = assemble_context(&direct_matches, &graph_context);
        Ok(RetrievalResult {
            query: format!("context:{name}"),
            direct_matches,
            graph_context,
            assembled_context,
        })
    }

    /// Expands from the entities named by `matches`, deduplicating by
    /// entity id across direct matches *and* the expansion itself, and
    /// skipping tag nodes (§4.8 step 2, §8 property 3).
    fn expand(&self, matches: &[SearchMatch], graph_depth: usize) -> Vec<GraphContextEntry> {
        let mut seen = HashSet::new();
        for m in matches {
            if let Some(id) = self.graph.find_entity(&m.entity_name) {
                seen.insert(id);
            }
        }

        let mut graph_context = Vec::new();
        for m in matches {
            let Some(id) = self.graph.find_entity(&m.entity_name) else {
                continue;
            };
            for neighbor in self.graph.get_neighbors(id, graph_depth) {
                if neighbor.node.is_tag() || seen.contains(&neighbor.node.id) {
                    continue;
                }
                seen.insert(neighbor.node.id);
                graph_context.push(GraphContextEntry {
                    entity_name: neighbor.node.name.clone(),
                    relation_type: neighbor.relation_type,
                    direction: neighbor.direction,
                });
            }
        }
        graph_context
    }
}

/// Assembles the two-header natural-language context string (§4.8 step 3).
fn assemble_context(direct_matches: &[SearchMatch], graph_context: &[GraphContextEntry]) -> String {
    let mut parts = Vec::new();

    if !direct_matches.is_empty() {
        parts.push("## Relevant fragments from notes\n".to_string());
        let mut seen_content = HashSet::new();
        for m in direct_matches {
            if !seen_content.insert(m.content.clone()) {
                continue;
            }
            parts.push(format!(
                "**{}** ({}) [score: {:.2}]:\n{}\n",
                m.entity_name, m.section, m.score, m.content
            ));
        }
    }

    if !graph_context.is_empty() {
        parts.push("\n## Related entities (from knowledge graph)\n".to_string());
        let mut by_type: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for entry in graph_context {
            by_type.entry(entry.relation_type.clone()).or_default().push(entry.entity_name.clone());
        }
        for (relation_type, names) in by_type {
            parts.push(format!("- **{relation_type}**: {}", names.join(", ")));
        }
    }

    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::FallbackEmbedder;

    fn note(name: &str, body: &str) -> (String, String) {
        (name.to_string(), format!("---\ntype: concept\n---\n\n# {name}\n\n{body}\n"))
    }

    #[test]
    fn test_query_fuses_vector_and_graph() {
        let notes = vec![
            note("Uzum Bank", "## Facts\n\n- a bank in Uzbekistan\n\n## Relations\n\n- ← **works_at** [[Ali]]"),
            note("Ali", "## Relations\n\n- → **works_at** [[Uzum Bank]]"),
        ];
        let embedder = FallbackEmbedder::new(32);
        let graph = KnowledgeGraph::build(&notes);
        let vector = VectorIndex::build(&notes, &embedder, 500).expect("build vector");
        let retriever = HybridRetriever::new(&graph, &vector);

        let result = retriever.query("bank in Uzbekistan", &embedder, 5, 2, 0.0).expect("query");
        assert!(!result.direct_matches.is_empty());
        assert!(result.graph_context.iter().any(|e| e.entity_name == "Ali"));
        assert!(result.assembled_context.contains("## Relevant fragments from notes"));
        assert!(result.assembled_context.contains("## Related entities"));
    }

    #[test]
    fn test_graph_context_excludes_direct_match_ids() {
        let notes = vec![
            note("A", "## Relations\n\n- → **uses** [[B]]"),
            note("B", "## Facts\n\n- something"),
        ];
        let embedder = FallbackEmbedder::new(32);
        let graph = KnowledgeGraph::build(&notes);
        let vector = VectorIndex::build(&notes, &embedder, 500).expect("build vector");
        let retriever = HybridRetriever::new(&graph, &vector);

        let result = retriever.query("something", &embedder, 5, 1, 0.0).expect("query");
        let direct_names: HashSet<&str> = result.direct_matches.iter().map(|m| m.entity_name.as_str()).collect();
        for entry in &result.graph_context {
            assert!(!direct_names.contains(entry.entity_name.as_str()));
        }
    }

    #[test]
    fn test_entity_context_not_found() {
        let notes: Vec<(String, String)> = vec![];
        let embedder = FallbackEmbedder::new(32);
        let graph = KnowledgeGraph::build(&notes);
        let vector = VectorIndex::build(&notes, &embedder, 500).expect("build vector");
        let retriever = HybridRetriever::new(&graph, &vector);
        assert!(retriever.get_entity_context("Nobody", 1).is_err());
    }

    #[test]
    fn test_assemble_context_dedups_identical_content() {
        let matches = vec![
            SearchMatch { chunk_id: "a#0".into(), entity_name: "A".into(), section: "Facts".into(), content: "same".into(), score: 0.9 },
            SearchMatch { chunk_id: "b#0".into(), entity_name: "B".into(), section: "Facts".into(), content: "same".into(), score: 0.8 },
        ];
        let context = assemble_context(&matches, &[]);
        assert_eq!(context.matches("same").count(), 1);
    }
}
