//! Vector index: chunk-level embeddings derived from the vault.
//!
//! For each note, the markdown codec's chunks become entries, embedded in
//! batches through an [`Embedder`] and searched by cosine similarity
//! (unit-norm vectors, so a dot product suffices; §4.6).

use crate::embedding::{cosine_similarity, Embedder};
use crate::markdown;
use crate::vault::VaultStore;
use crate::Result;

/// One chunk's embedding, joined back to its entity.
#[derive(Debug, Clone)]
pub struct ChunkEntry {
    /// Opaque chunk identifier, `"{entity_name}#{position}"`.
    pub chunk_id: String,
    /// The entity this chunk belongs to.
    pub entity_name: String,
    /// Section the chunk was drawn from.
    pub section: String,
    /// Chunk text.
    pub content: String,
    /// Unit-norm embedding.
    pub vector: Vec<f32>,
}

/// A scored chunk returned from search (§4.6).
#[derive(Debug, Clone)]
pub struct SearchMatch {
    /// Matched chunk id.
    pub chunk_id: String,
    /// Owning entity.
    pub entity_name: String,
    /// Section the chunk was drawn from.
    pub section: String,
    /// Chunk text.
    pub content: String,
    /// Cosine similarity to the query (or `1.0` for entity-anchored
    /// lookups).
    pub score: f32,
}

/// The tenant's derived vector index.
pub struct VectorIndex {
    entries: Vec<ChunkEntry>,
}

impl VectorIndex {
    /// Builds the index by chunking and embedding every note in `vault`.
    ///
    /// # Errors
    ///
    /// Returns an error if the vault cannot be read or embedding fails.
    pub fn build_from_vault(vault: &VaultStore, embedder: &dyn Embedder, chunk_size: usize) -> Result<Self> {
        let notes = vault.read_all_notes()?;
        Self::build(&notes, embedder, chunk_size)
    }

    /// Builds the index from already-read `(entity name, raw content)`
    /// pairs, without touching disk.
    ///
    /// # Errors
    ///
    /// Returns an error if embedding fails.
    pub fn build(notes: &[(String, String)], embedder: &dyn Embedder, chunk_size: usize) -> Result<Self> {
        let mut entity_names = Vec::new();
        let mut sections_per_note = Vec::new();
        let mut texts: Vec<String> = Vec::new();
        let mut chunk_meta: Vec<(usize, String, usize)> = Vec::new(); // (note_index, section, position)

        for (note_idx, (name, content)) in notes.iter().enumerate() {
            let (_, body) = markdown::parse_frontmatter(content);
            let sections = markdown::extract_sections(body);
            let chunks = markdown::create_chunks(&sections, chunk_size);
            entity_names.push(name.clone());
            sections_per_note.push(sections);
            for chunk in chunks {
                chunk_meta.push((note_idx, chunk.section.clone(), chunk.position));
                texts.push(chunk.content);
            }
        }

        if texts.is_empty() {
            return Ok(Self { entries: Vec::new() });
        }

        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let vectors = embedder.embed_batch(&refs)?;

        let mut entries = Vec::with_capacity(texts.len());
        for ((note_idx, section, position), (text, vector)) in chunk_meta.into_iter().zip(texts.into_iter().zip(vectors)) {
            let entity_name = entity_names[note_idx].clone();
            entries.push(ChunkEntry {
                chunk_id: format!("{entity_name}#{position}"),
                entity_name,
                section,
                content: text,
                vector,
            });
        }

        Ok(Self { entries })
    }

    /// Total number of chunk entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` if the index has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Top-K cosine search with a minimum-score threshold (§4.6 `search`).
    ///
    /// # Errors
    ///
    /// Returns an error if embedding the query fails.
    pub fn search(&self, query: &str, embedder: &dyn Embedder, top_k: usize, min_score: f32) -> Result<Vec<SearchMatch>> {
        let query_vector = embedder.embed(query)?;
        let mut scored: Vec<SearchMatch> = self
            .entries
            .iter()
            .map(|entry| SearchMatch {
                chunk_id: entry.chunk_id.clone(),
                entity_name: entry.entity_name.clone(),
                section: entry.section.clone(),
                content: entry.content.clone(),
                score: cosine_similarity(&query_vector, &entry.vector),
            })
            .filter(|m| m.score >= min_score)
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }

    /// All entries for one entity, each scored `1.0` (§4.6
    /// `search_by_entity`).
    #[must_use]
    pub fn search_by_entity(&self, entity_name: &str) -> Vec<SearchMatch> {
        self.entries
            .iter()
            .filter(|e| e.entity_name.eq_ignore_ascii_case(entity_name))
            .map(|entry| SearchMatch {
                chunk_id: entry.chunk_id.clone(),
                entity_name: entry.entity_name.clone(),
                section: entry.section.clone(),
                content: entry.content.clone(),
                score: 1.0,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::FallbackEmbedder;

    #[test]
    fn test_build_and_search_returns_scores_above_threshold() {
        let embedder = FallbackEmbedder::new(64);
        let notes = vec![
            ("Ali".to_string(), "---\ntype: person\n---\n\n# Ali\n\n## Facts\n\n- works at Uzum Bank\n".to_string()),
        ];
        let index = VectorIndex::build(&notes, &embedder, 500).expect("build");
        assert!(!index.is_empty());

        let results = index.search("works at Uzum Bank", &embedder, 5, 0.0).expect("search");
        assert!(!results.is_empty());
        for r in &results {
            assert!(r.score >= 0.0);
        }
    }

    #[test]
    fn test_search_by_entity_scores_one() {
        let embedder = FallbackEmbedder::new(64);
        let notes = vec![
            ("Ali".to_string(), "---\ntype: person\n---\n\n# Ali\n\n## Facts\n\n- works at Uzum Bank\n".to_string()),
        ];
        let index = VectorIndex::build(&notes, &embedder, 500).expect("build");
        let results = index.search_by_entity("ali");
        assert!(!results.is_empty());
        assert!(results.iter().all(|r| (r.score - 1.0).abs() < f32::EPSILON));
    }

    #[test]
    fn test_empty_vault_produces_empty_index() {
        let embedder = FallbackEmbedder::new(64);
        let index = VectorIndex::build(&[], &embedder, 500).expect("build");
        assert!(index.is_empty());
    }
}
