//! Multi-tenant façade: one [`Brain`] per `user_id`, lazily created and
//! cached (§4.9, mirroring the reference SDK's top-level `Memory` class).

use crate::brain::Brain;
use crate::config::MemoryConfig;
use crate::embedding::{create_embedder, Embedder};
use crate::extraction::ConversationTurn;
use crate::graph::Subgraph;
use crate::llm::{create_llm_client, LlmProvider};
use crate::vault::{MergeStats, VaultStats};
use crate::Result;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A relation from a [`MemoryItem`]'s entity to another entity.
#[derive(Debug, Clone)]
pub struct RelationSummary {
    /// Relation type.
    pub relation_type: String,
    /// The other entity's name.
    pub target: String,
}

/// One entity's memory, flattened for external consumption.
#[derive(Debug, Clone)]
pub struct MemoryItem {
    /// Canonical entity name.
    pub name: String,
    /// `type` front-matter value.
    pub entity_type: String,
    /// Parsed Facts-section bullet contents.
    pub facts: Vec<String>,
    /// Outgoing and incoming relations, one level deep.
    pub relations: Vec<RelationSummary>,
    /// This entity's `## Episodes` entries, if any.
    pub episodes: Vec<crate::vault::EpisodeEntry>,
    /// This entity's `## Procedures` entries, if any.
    pub procedures: Vec<crate::vault::ProcedureEntry>,
}

/// One scored row from [`Memory::search`]: an entity plus the assembled
/// context the query produced.
#[derive(Debug, Clone)]
pub struct SearchResultRow {
    /// The matched entity, flattened.
    pub memory: MemoryItem,
    /// Cosine-similarity score of this entity's best-matching chunk.
    pub score: f32,
    /// The assembled natural-language context for the whole query (shared
    /// across every row returned from one `search` call).
    pub context: String,
}

/// Either a single free-text turn or a full multi-turn conversation,
/// accepted by [`Memory::add`] the way the reference SDK accepts either a
/// string or a list of role/content dicts.
pub enum Messages<'a> {
    /// A single turn, attributed to the user role.
    Text(&'a str),
    /// A full conversation.
    Conversation(&'a [ConversationTurn]),
}

impl<'a> From<&'a str> for Messages<'a> {
    fn from(text: &'a str) -> Self {
        Self::Text(text)
    }
}

impl<'a> From<&'a [ConversationTurn]> for Messages<'a> {
    fn from(turns: &'a [ConversationTurn]) -> Self {
        Self::Conversation(turns)
    }
}

/// Top-level entry point: a vault root, an LLM, and an embedder, shared
/// across every tenant's lazily-created [`Brain`] (§4.9).
pub struct Memory {
    config: MemoryConfig,
    llm: Arc<dyn LlmProvider>,
    embedder: Arc<dyn Embedder>,
    brains: RwLock<HashMap<String, Arc<Brain>>>,
}

impl Memory {
    /// Builds a `Memory` from configuration, constructing the shared LLM
    /// and embedder once.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured LLM provider requires credentials
    /// that are absent.
    pub fn new(config: MemoryConfig) -> Result<Self> {
        let llm: Arc<dyn LlmProvider> = Arc::from(create_llm_client(&config.llm)?);
        let embedder: Arc<dyn Embedder> = Arc::from(create_embedder(&config.embedding));
        Ok(Self {
            config,
            llm,
            embedder,
            brains: RwLock::new(HashMap::new()),
        })
    }

    /// Gets or lazily creates the [`Brain`] for `user_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the tenant's vault directory cannot be created.
    fn brain_for(&self, user_id: &str) -> Result<Arc<Brain>> {
        {
            let guard = self.brains.read().map_err(|_| crate::Error::IoError("brain cache lock poisoned".to_string()))?;
            if let Some(brain) = guard.get(user_id) {
                return Ok(Arc::clone(brain));
            }
        }

        let mut guard = self.brains.write().map_err(|_| crate::Error::IoError("brain cache lock poisoned".to_string()))?;
        if let Some(brain) = guard.get(user_id) {
            return Ok(Arc::clone(brain));
        }

        let vault_path = self.config.vault_path.join(user_id);
        let vault = crate::vault::VaultStore::open(vault_path)?;
        let brain = Arc::new(crate::brain::Brain::from_parts(
            vault,
            Arc::clone(&self.llm),
            Arc::clone(&self.embedder),
            self.config.retrieval,
            self.config.extraction,
        ));
        guard.insert(user_id.to_string(), Arc::clone(&brain));
        Ok(brain)
    }

    /// Adds a memory from free text or a conversation (§4.7, §4.4).
    ///
    /// # Errors
    ///
    /// Returns an error if the LLM call or vault write fails.
    pub fn add<'a>(&self, messages: impl Into<Messages<'a>>, user_id: &str) -> Result<MergeStats> {
        let brain = self.brain_for(user_id)?;
        match messages.into() {
            Messages::Text(text) => brain.add(text),
            Messages::Conversation(turns) => brain.remember(turns),
        }
    }

    /// Hybrid search: ranked entities plus the assembled context produced
    /// by the query (§4.8).
    ///
    /// # Errors
    ///
    /// Returns an error if the tenant's vault cannot be read or the query
    /// cannot be embedded.
    pub fn search(&self, query: &str, user_id: &str, top_k: usize) -> Result<Vec<SearchResultRow>> {
        let brain = self.brain_for(user_id)?;
        let rows = brain.search(query, top_k)?;
        let context = brain.recall(query, Some(top_k), None)?.assembled_context;

        Ok(rows
            .into_iter()
            .map(|row| SearchResultRow {
                memory: MemoryItem {
                    name: row.entity,
                    entity_type: row.entity_type,
                    facts: row.facts,
                    relations: row
                        .relations
                        .into_iter()
                        .map(|r| RelationSummary { relation_type: r.relation_type, target: r.other })
                        .collect(),
                    episodes: row.episodes,
                    procedures: row.procedures,
                },
                score: row.score,
                context: context.clone(),
            })
            .collect())
    }

    /// Every non-tag entity in a tenant's vault, flattened (§4.9
    /// `get_all`).
    ///
    /// # Errors
    ///
    /// Returns an error if the tenant's vault cannot be read.
    pub fn get_all(&self, user_id: &str) -> Result<Vec<MemoryItem>> {
        let brain = self.brain_for(user_id)?;
        let mut items = Vec::new();
        for name in brain.list_entity_names()? {
            items.push(self.flatten_entity(&brain, &name)?);
        }
        Ok(items)
    }

    /// One entity, flattened, or `None` if it doesn't exist (§4.9 `get`).
    ///
    /// # Errors
    ///
    /// Returns an error if the tenant's vault cannot be read.
    pub fn get(&self, entity_name: &str, user_id: &str) -> Result<Option<MemoryItem>> {
        let brain = self.brain_for(user_id)?;
        match self.flatten_entity(&brain, entity_name) {
            Ok(item) => Ok(Some(item)),
            Err(crate::Error::NotFoundError(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Deletes an entity's note. Returns `true` if it existed (§4.9
    /// `delete`).
    ///
    /// # Errors
    ///
    /// Returns an error on a filesystem failure.
    pub fn delete(&self, entity_name: &str, user_id: &str) -> Result<bool> {
        let brain = self.brain_for(user_id)?;
        brain.delete(entity_name)
    }

    /// Aggregate vault statistics for a tenant (§4.9 `get_stats`).
    ///
    /// # Errors
    ///
    /// Returns an error if the tenant's vault cannot be read.
    pub fn stats(&self, user_id: &str) -> Result<VaultStats> {
        self.brain_for(user_id)?.get_stats()
    }

    /// The induced subgraph around `entity_name` to `depth` hops, or an
    /// empty subgraph if the entity is unknown (§4.10 `graph`).
    ///
    /// # Errors
    ///
    /// Returns an error if the tenant's vault cannot be read.
    pub fn graph(&self, entity_name: &str, user_id: &str, depth: usize) -> Result<Subgraph> {
        self.brain_for(user_id)?.get_subgraph(entity_name, depth)
    }

    fn flatten_entity(&self, brain: &Brain, name: &str) -> Result<MemoryItem> {
        let data = brain.get_entity(name)?;
        let relations = data
            .relations
            .into_iter()
            .map(|r| RelationSummary { relation_type: r.relation_type, target: r.other })
            .collect();
        Ok(MemoryItem {
            name: data.name,
            entity_type: data.entity_type,
            facts: data.facts,
            relations,
            episodes: data.episodes,
            procedures: data.procedures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LlmProviderKind;

    fn config(dir: &std::path::Path) -> MemoryConfig {
        let mut config = MemoryConfig::default();
        config.vault_path = dir.to_path_buf();
        config.llm.provider = LlmProviderKind::Ollama; // needs no API key
        config
    }

    #[test]
    fn test_separate_tenants_get_separate_vaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let memory = Memory::new(config(dir.path())).expect("new");
        let ali_brain = memory.brain_for("ali").expect("brain");
        let bob_brain = memory.brain_for("bob").expect("brain");
        assert!(!std::ptr::eq(ali_brain.as_ref(), bob_brain.as_ref()));
        assert!(dir.path().join("ali").exists());
        assert!(dir.path().join("bob").exists());
    }

    #[test]
    fn test_brain_for_is_cached() {
        let dir = tempfile::tempdir().expect("tempdir");
        let memory = Memory::new(config(dir.path())).expect("new");
        let first = memory.brain_for("ali").expect("brain");
        let second = memory.brain_for("ali").expect("brain");
        assert!(std::ptr::eq(first.as_ref(), second.as_ref()));
    }

    #[test]
    fn test_get_returns_none_for_unknown_entity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let memory = Memory::new(config(dir.path())).expect("new");
        assert!(memory.get("Nobody", "ali").expect("get").is_none());
    }

    #[test]
    fn test_graph_of_unknown_entity_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let memory = Memory::new(config(dir.path())).expect("new");
        let subgraph = memory.graph("Nobody", "ali", 2).expect("graph");
        assert!(subgraph.nodes.is_empty());
    }
}
