//! A single tenant's memory: one vault, plus the graph and vector views
//! derived from it on demand (§4.9).

use crate::config::{EmbeddingConfig, ExtractionConfig, LlmConfig, RetrievalConfig};
use crate::embedding::{create_embedder, Embedder};
use crate::extraction::{ConversationTurn, ExtractionOrchestrator};
use crate::graph::{KnowledgeGraph, Subgraph};
use crate::llm::{create_llm_client, LlmProvider};
use crate::ratelimit::RateLimiter;
use crate::retrieval::{HybridRetriever, RetrievalResult};
use crate::vault::{EntityData, KnowledgeEntry, MergeStats, VaultStats, VaultStore};
use crate::vector::VectorIndex;
use crate::Result;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, RwLock};

/// One row of [`Brain::search`]: a vector match joined with its entity's
/// full parsed data (§4.9 `search`).
#[derive(Debug, Clone)]
pub struct SearchRow {
    /// Matched entity's canonical name.
    pub entity: String,
    /// `type` front-matter value.
    pub entity_type: String,
    /// Best cosine-similarity score among this entity's matched chunks.
    pub score: f32,
    /// The entity's fact bullets.
    pub facts: Vec<String>,
    /// The entity's parsed relations.
    pub relations: Vec<crate::vault::RelationLine>,
    /// The entity's parsed knowledge entries.
    pub knowledge: Vec<KnowledgeEntry>,
    /// The entity's parsed episode entries.
    pub episodes: Vec<crate::vault::EpisodeEntry>,
    /// The entity's parsed procedure entries.
    pub procedures: Vec<crate::vault::ProcedureEntry>,
}

/// A summary of one entity's connectedness, used by [`Brain::get_profile`].
#[derive(Debug, Clone)]
pub struct EntitySummary {
    /// Canonical entity name.
    pub name: String,
    /// `type` front-matter value.
    pub entity_type: String,
    /// Number of fact bullets.
    pub fact_count: usize,
    /// Number of relation lines.
    pub relation_count: usize,
}

/// A tenant-level summary combining vault totals with its most-connected
/// entities (§4.9 `get_profile`).
#[derive(Debug, Clone)]
pub struct Profile {
    /// Aggregate vault statistics.
    pub stats: VaultStats,
    /// Entities ranked by fact-plus-relation count, most connected first,
    /// truncated to a handful of rows.
    pub top_entities: Vec<EntitySummary>,
}

/// One knowledge entry surfaced by [`Brain::get_recent_knowledge`], tagged
/// with the entity it belongs to.
#[derive(Debug, Clone)]
pub struct RecentKnowledge {
    /// The owning entity's canonical name.
    pub entity: String,
    /// The parsed knowledge entry.
    pub entry: KnowledgeEntry,
}

const PROFILE_TOP_ENTITIES: usize = 10;

/// The graph and vector index derived from a vault at a point in time,
/// tagged with the vault generation they were built from.
struct DerivedViews {
    generation: u64,
    graph: KnowledgeGraph,
    vector: VectorIndex,
}

/// One tenant's memory: a vault plus the LLM, embedder, and rate limiter
/// needed to populate and query it (§4.9).
///
/// Derived views (the knowledge graph and vector index) are rebuilt lazily,
/// the first time they're needed after the vault's generation counter has
/// advanced past the cached build (§9 "shared mutable vault state").
pub struct Brain {
    vault: VaultStore,
    llm: Arc<dyn LlmProvider>,
    embedder: Arc<dyn Embedder>,
    retrieval: RetrievalConfig,
    extraction: ExtractionConfig,
    rate_limiter: RateLimiter,
    derived: RwLock<Option<DerivedViews>>,
}

impl Brain {
    /// Opens (creating if absent) the vault at `vault_path` and wires up
    /// the LLM, embedder, and rate limiter from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the vault directory cannot be created or the
    /// configured LLM provider requires credentials that are absent.
    pub fn open(
        vault_path: impl AsRef<Path>,
        llm_config: &LlmConfig,
        embedding_config: &EmbeddingConfig,
        retrieval: RetrievalConfig,
        extraction: ExtractionConfig,
    ) -> Result<Self> {
        let vault = VaultStore::open(vault_path.as_ref())?;
        let llm: Arc<dyn LlmProvider> = Arc::from(create_llm_client(llm_config)?);
        let embedder: Arc<dyn Embedder> = Arc::from(create_embedder(embedding_config));
        let rate_limiter = RateLimiter::new(extraction.rate_per_minute.max(1) as usize, std::time::Duration::from_secs(60));
        Ok(Self {
            vault,
            llm,
            embedder,
            retrieval,
            extraction,
            rate_limiter,
            derived: RwLock::new(None),
        })
    }

    /// Wraps an already-built vault and adapters directly, sharing the LLM
    /// and embedder with any other tenant that holds the same `Arc`s. Used
    /// by [`crate::Memory`] (one LLM/embedder pair serves every tenant) and
    /// by tests.
    #[must_use]
    pub fn from_parts(
        vault: VaultStore,
        llm: Arc<dyn LlmProvider>,
        embedder: Arc<dyn Embedder>,
        retrieval: RetrievalConfig,
        extraction: ExtractionConfig,
    ) -> Self {
        let rate_limiter = RateLimiter::new(extraction.rate_per_minute.max(1) as usize, std::time::Duration::from_secs(60));
        Self {
            vault,
            llm,
            embedder,
            retrieval,
            extraction,
            rate_limiter,
            derived: RwLock::new(None),
        }
    }

    /// Runs extraction over a conversation and merges the result into the
    /// vault (§4.7, §4.4).
    ///
    /// Blocks on the shared extraction rate limiter before calling the LLM
    /// (§5). The vault's generation counter advances as a side effect,
    /// which invalidates any cached derived views the next time they're
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the LLM call fails or the vault cannot be
    /// written.
    pub fn remember(&self, conversation: &[ConversationTurn]) -> Result<MergeStats> {
        self.rate_limiter.acquire();
        let existing_context = self.existing_context()?;
        let orchestrator = ExtractionOrchestrator::new(self.llm.as_ref());
        let extraction = orchestrator.extract(conversation, &existing_context)?;
        self.vault.process_extraction(&extraction)
    }

    /// Convenience wrapper over [`Self::remember`] for a single free-text
    /// turn, attributed to the user role.
    ///
    /// # Errors
    ///
    /// See [`Self::remember`].
    pub fn add(&self, text: &str) -> Result<MergeStats> {
        self.remember_text(text)
    }

    /// Wraps a single free-text turn, attributed to the user role, and
    /// calls [`Self::remember`] (§4.9 `remember_text`).
    ///
    /// # Errors
    ///
    /// See [`Self::remember`].
    pub fn remember_text(&self, text: &str) -> Result<MergeStats> {
        self.remember(&[ConversationTurn::user(text)])
    }

    /// Hybrid search: one row per matched entity, joining the vector
    /// match's score with that entity's full parsed data (§4.9 `search`).
    /// Matches are deduplicated by entity, keeping the first (highest-
    /// scoring) match.
    ///
    /// # Errors
    ///
    /// Returns an error if the vault cannot be read or the query cannot be
    /// embedded.
    pub fn search(&self, query: &str, top_k: usize) -> Result<Vec<SearchRow>> {
        self.ensure_fresh()?;
        let guard = self.derived.read().map_err(|_| crate::Error::IoError("derived view lock poisoned".to_string()))?;
        let views = guard.as_ref().ok_or_else(|| crate::Error::IoError("derived views not built".to_string()))?;
        let matches = views.vector.search(query, self.embedder.as_ref(), top_k, self.retrieval.min_score)?;

        let mut seen = HashSet::new();
        let mut rows = Vec::with_capacity(matches.len());
        for m in matches {
            if !seen.insert(m.entity_name.clone()) {
                continue;
            }
            let data = self.vault.get_entity_data(&m.entity_name)?;
            rows.push(SearchRow {
                entity: data.name,
                entity_type: data.entity_type,
                score: m.score,
                facts: data.facts,
                relations: data.relations,
                knowledge: data.knowledge,
                episodes: data.episodes,
                procedures: data.procedures,
            });
        }
        Ok(rows)
    }

    /// Hybrid retrieval over this tenant's derived views (§4.8).
    ///
    /// # Errors
    ///
    /// Returns an error if the vault cannot be read or the query cannot be
    /// embedded.
    pub fn recall(&self, query: &str, top_k: Option<usize>, graph_depth: Option<usize>) -> Result<RetrievalResult> {
        self.ensure_fresh()?;
        let guard = self.derived.read().map_err(|_| crate::Error::IoError("derived view lock poisoned".to_string()))?;
        let views = guard.as_ref().ok_or_else(|| crate::Error::IoError("derived views not built".to_string()))?;
        let retriever = HybridRetriever::new(&views.graph, &views.vector);
        retriever.query(
            query,
            self.embedder.as_ref(),
            top_k.unwrap_or(self.retrieval.top_k),
            graph_depth.unwrap_or(self.retrieval.graph_depth),
            self.retrieval.min_score,
        )
    }

    /// Entity-anchored retrieval: every chunk belonging to `name`, expanded
    /// through the graph (§4.8 "Entity-anchored variant").
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::NotFoundError`] if no such entity exists.
    pub fn context_for_entity(&self, name: &str, graph_depth: Option<usize>) -> Result<RetrievalResult> {
        self.ensure_fresh()?;
        let guard = self.derived.read().map_err(|_| crate::Error::IoError("derived view lock poisoned".to_string()))?;
        let views = guard.as_ref().ok_or_else(|| crate::Error::IoError("derived views not built".to_string()))?;
        let retriever = HybridRetriever::new(&views.graph, &views.vector);
        retriever.get_entity_context(name, graph_depth.unwrap_or(self.retrieval.graph_depth))
    }

    /// Canonical names of every entity in this tenant's vault, sorted
    /// (§4.4 `list_notes`, used by [`crate::Memory::get_all`]).
    ///
    /// # Errors
    ///
    /// Returns an error if the vault cannot be read.
    pub fn list_entity_names(&self) -> Result<Vec<String>> {
        self.vault.list_notes()
    }

    /// One entity's raw parsed data (§4.4 `get_entity_data`).
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::NotFoundError`] if no note exists for `name`.
    pub fn get_entity(&self, name: &str) -> Result<EntityData> {
        self.vault.get_entity_data(name)
    }

    /// Removes an entity's note, invalidating derived views via the vault's
    /// generation counter. Returns `true` if it existed (§4.9 `delete`).
    ///
    /// # Errors
    ///
    /// Returns an error on a filesystem failure.
    pub fn delete(&self, name: &str) -> Result<bool> {
        self.vault.delete(name)
    }

    /// Aggregate vault statistics (§4.9 `get_stats`).
    ///
    /// # Errors
    ///
    /// Returns an error if the vault cannot be read.
    pub fn get_stats(&self) -> Result<VaultStats> {
        self.vault.stats()
    }

    /// A tenant summary: vault totals plus the entities with the most
    /// facts and relations (§4.9 `get_profile`).
    ///
    /// # Errors
    ///
    /// Returns an error if the vault cannot be read.
    pub fn get_profile(&self) -> Result<Profile> {
        let stats = self.vault.stats()?;
        let mut summaries: Vec<EntitySummary> = self
            .vault
            .list_notes()?
            .into_iter()
            .filter_map(|name| self.vault.get_entity_data(&name).ok())
            .map(|data| EntitySummary {
                name: data.name,
                entity_type: data.entity_type,
                fact_count: data.facts.len(),
                relation_count: data.relations.len(),
            })
            .collect();
        summaries.sort_by(|a, b| (b.fact_count + b.relation_count).cmp(&(a.fact_count + a.relation_count)));
        summaries.truncate(PROFILE_TOP_ENTITIES);
        Ok(Profile { stats, top_entities: summaries })
    }

    /// The most recent knowledge entries across every entity in the vault,
    /// newest first, truncated to `limit` (§4.9 `get_recent_knowledge`).
    ///
    /// # Errors
    ///
    /// Returns an error if the vault cannot be read.
    pub fn get_recent_knowledge(&self, limit: usize) -> Result<Vec<RecentKnowledge>> {
        let mut entries = Vec::new();
        for name in self.vault.list_notes()? {
            let data = self.vault.get_entity_data(&name)?;
            for entry in data.knowledge {
                entries.push(RecentKnowledge { entity: data.name.clone(), entry });
            }
        }
        entries.sort_by(|a, b| b.entry.date.cmp(&a.entry.date));
        entries.truncate(limit);
        Ok(entries)
    }

    /// The induced subgraph around `name` to `depth` hops, or an empty
    /// subgraph if the entity is unknown (§4.9 `get_subgraph`).
    ///
    /// # Errors
    ///
    /// Returns an error if the vault cannot be read.
    pub fn get_subgraph(&self, name: &str, depth: usize) -> Result<Subgraph> {
        self.ensure_fresh()?;
        let guard = self.derived.read().map_err(|_| crate::Error::IoError("derived view lock poisoned".to_string()))?;
        let views = guard.as_ref().ok_or_else(|| crate::Error::IoError("derived views not built".to_string()))?;
        Ok(views
            .graph
            .find_entity(name)
            .map_or_else(|| Subgraph { nodes: Vec::new(), edges: Vec::new() }, |id| views.graph.get_subgraph(id, depth)))
    }

    /// A newline-joined list of known entity names, used to seed the
    /// extraction prompt's existing-context block (§4.7).
    fn existing_context(&self) -> Result<String> {
        Ok(self.vault.list_notes()?.join("\n"))
    }

    /// Rebuilds the derived views if the vault's generation has advanced
    /// past the cached build, or if nothing has been built yet.
    fn ensure_fresh(&self) -> Result<()> {
        let current_generation = self.vault.generation();
        {
            let guard = self.derived.read().map_err(|_| crate::Error::IoError("derived view lock poisoned".to_string()))?;
            if guard.as_ref().is_some_and(|v| v.generation == current_generation) {
                return Ok(());
            }
        }

        let notes = self.vault.read_all_notes()?;
        let graph = KnowledgeGraph::build(&notes);
        let vector = VectorIndex::build(&notes, self.embedder.as_ref(), self.extraction.chunk_size)?;

        let mut guard = self.derived.write().map_err(|_| crate::Error::IoError("derived view lock poisoned".to_string()))?;
        *guard = Some(DerivedViews { generation: current_generation, graph, vector });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EmbeddingConfig, ExtractionConfig, RetrievalConfig};
    use crate::llm::LlmProvider;

    struct StubLlm(String);

    impl LlmProvider for StubLlm {
        fn name(&self) -> &'static str {
            "stub"
        }

        fn complete(&self, _prompt: &str, _system: &str) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    fn brain(dir: &std::path::Path, response: &str) -> Brain {
        let vault = VaultStore::open(dir).expect("open vault");
        let llm: Arc<dyn LlmProvider> = Arc::new(StubLlm(response.to_string()));
        let embedder: Arc<dyn Embedder> = Arc::new(crate::embedding::FallbackEmbedder::new(32));
        Brain::from_parts(vault, llm, embedder, RetrievalConfig::default(), ExtractionConfig::default())
    }

    #[test]
    fn test_remember_then_recall_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let response = r#"{
            "entities": [{"name": "Ali", "type": "person", "facts": ["works at Uzum Bank"]}],
            "relations": [],
            "knowledge": [],
            "episodes": [],
            "procedures": []
        }"#;
        let brain = brain(dir.path(), response);
        let stats = brain.add("ali works at uzum bank").expect("remember");
        assert_eq!(stats.created, vec!["Ali".to_string()]);

        let result = brain.recall("where does ali work", None, None).expect("recall");
        assert!(!result.direct_matches.is_empty());
    }

    #[test]
    fn test_generation_changes_invalidate_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let response = r#"{"entities": [{"name": "Ali", "type": "person", "facts": ["a fact"]}], "relations": [], "knowledge": [], "episodes": [], "procedures": []}"#;
        let brain = brain(dir.path(), response);
        brain.add("first").expect("remember 1");
        brain.recall("a fact", None, None).expect("recall 1");
        brain.add("second mention of ali").expect("remember 2");
        let result = brain.recall("a fact", None, None).expect("recall 2");
        assert!(!result.direct_matches.is_empty());
    }

    #[test]
    fn test_forget_removes_entity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let response = r#"{"entities": [{"name": "Ali", "type": "person", "facts": ["a fact"]}], "relations": [], "knowledge": [], "episodes": [], "procedures": []}"#;
        let brain = brain(dir.path(), response);
        brain.add("ali").expect("remember");
        assert!(brain.delete("Ali").expect("delete"));
        assert!(brain.get_entity("Ali").is_err());
    }

    #[test]
    fn test_search_joins_score_with_entity_data() {
        let dir = tempfile::tempdir().expect("tempdir");
        let response = r#"{
            "entities": [{"name": "Ali", "type": "person", "facts": ["works at Uzum Bank"]}],
            "relations": [], "knowledge": [], "episodes": [], "procedures": []
        }"#;
        let brain = brain(dir.path(), response);
        brain.add("ali works at uzum bank").expect("remember");
        let rows = brain.search("where does ali work", 5).expect("search");
        assert!(rows.iter().any(|r| r.entity == "Ali" && !r.facts.is_empty()));
    }

    #[test]
    fn test_get_subgraph_unknown_entity_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let brain = brain(dir.path(), "{}");
        let subgraph = brain.get_subgraph("Nobody", 2).expect("subgraph");
        assert!(subgraph.nodes.is_empty());
        assert!(subgraph.edges.is_empty());
    }

    #[test]
    fn test_get_profile_ranks_by_connectedness() {
        let dir = tempfile::tempdir().expect("tempdir");
        let response = r#"{
            "entities": [{"name": "Ali", "type": "person", "facts": ["a", "b", "c"]}],
            "relations": [], "knowledge": [], "episodes": [], "procedures": []
        }"#;
        let brain = brain(dir.path(), response);
        brain.add("ali").expect("remember");
        let profile = brain.get_profile().expect("profile");
        assert_eq!(profile.stats.total_notes, 1);
        assert_eq!(profile.top_entities.first().map(|e| e.name.as_str()), Some("Ali"));
    }
}
