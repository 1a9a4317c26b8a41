//! Vault store: the authoritative on-disk state of a tenant's notes.
//!
//! Owns a single tenant's directory of entity notes, performs the
//! idempotent merge algorithm (§4.4) that turns an [`ExtractionResult`]
//! into created/updated notes, and enforces at-most-one-writer-per-tenant
//! via a reader/writer lock plus a generation counter the derived graph
//! and vector views validate against (§5, §9 "shared mutable vault state").

// Allow cognitive_complexity for the merge algorithm, which mirrors the
// reference implementation's branching closely on purpose.
#![allow(clippy::cognitive_complexity)]

use crate::dedup;
use crate::extraction::{ExtractedKnowledge, ExtractedRelation, ExtractionResult};
use crate::markdown;
use crate::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

static WIKILINK_SCAN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[\[([^\]]+)\]\]").expect("valid regex"));
static KNOWLEDGE_TITLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\*\*\[[\w]+\]\s+(.+?)\*\*").expect("valid regex"));
static RELATION_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(→|←)\s*\*\*([^*]+)\*\*\s*\[\[([^\]|]+)(?:\|[^\]]+)?\]\](?::\s*(.*))?$")
        .expect("valid regex")
});

/// Replaces any of `<>:"/\|?*` with `_` (§4.4 step 1a).
#[must_use]
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if "<>:\"/\\|?*".contains(c) { '_' } else { c })
        .collect()
}

/// Result of a `process_extraction` merge: canonical names of entities
/// created versus updated.
#[derive(Debug, Clone, Default)]
pub struct MergeStats {
    /// Entities whose note did not previously exist.
    pub created: Vec<String>,
    /// Entities whose existing note gained new facts, relations, or
    /// knowledge entries.
    pub updated: Vec<String>,
}

/// One `- → **type** [[Other]]: description` or `- ← …` relation line,
/// parsed back out of a note body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationLine {
    /// `true` if this entity is the relation's source (`→`).
    pub outgoing: bool,
    /// Relation type, e.g. `works_at`.
    pub relation_type: String,
    /// The other entity's canonical name.
    pub other: String,
    /// Optional free-text description.
    pub description: Option<String>,
}

/// A parsed `**[type] title** (date)` knowledge entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnowledgeEntry {
    /// Knowledge type, e.g. `solution`, `command`.
    pub knowledge_type: String,
    /// Title used for uniqueness (§3.3 #4).
    pub title: String,
    /// Entry date, `YYYY-MM-DD`.
    pub date: String,
    /// Prose content.
    pub content: String,
    /// Fenced code block contents, if the entry carried an artifact.
    pub artifact: Option<String>,
}

/// A parsed `## Episodes` entry (§3.2, §3.5 "optional episode … sections").
// `importance` is an `f32`; see `ExtractedEpisode`'s note on why this can
// only derive `PartialEq`, not `Eq`.
#[derive(Debug, Clone, PartialEq)]
pub struct EpisodeEntry {
    /// ≤20-word summary, used as the entry's heading.
    pub summary: String,
    /// Entry date, `YYYY-MM-DD`.
    pub date: String,
    /// Detailed context, wikilinks intact.
    pub context: String,
    /// What resulted, if recorded.
    pub outcome: Option<String>,
    /// One of positive/negative/neutral/mixed.
    pub emotional_valence: String,
    /// Clamped to `[0, 1]`.
    pub importance: f32,
    /// Other participants (this entity excluded), canonical names.
    pub participants: Vec<String>,
}

/// A parsed `## Procedures` entry (§3.2, §3.5 "optional … procedure
/// sections").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcedureEntry {
    /// Procedure name, used as the entry's heading.
    pub name: String,
    /// When to use it, if recorded.
    pub trigger: Option<String>,
    /// Ordered step lines, `"{n}. {action}[ - {detail}]"`.
    pub steps: Vec<String>,
    /// Other involved entities (this entity excluded), canonical names.
    pub entities: Vec<String>,
}

/// The full parsed content of one entity note, as read back by
/// `get_entity_data`.
#[derive(Debug, Clone)]
pub struct EntityData {
    /// Canonical entity name (from the note's `# Heading`, falling back to
    /// the sanitized file stem).
    pub name: String,
    /// Entity type from front matter (`concept` for stubs).
    pub entity_type: String,
    /// Creation timestamp, `YYYY-MM-DD HH:MM`.
    pub created: String,
    /// Last-update timestamp, `YYYY-MM-DD HH:MM`.
    pub updated: String,
    /// Tags from front matter.
    pub tags: Vec<String>,
    /// Fact bullet lines, wikilinks intact.
    pub facts: Vec<String>,
    /// Parsed relation lines.
    pub relations: Vec<RelationLine>,
    /// Parsed knowledge entries.
    pub knowledge: Vec<KnowledgeEntry>,
    /// Parsed episode entries this entity participated in.
    pub episodes: Vec<EpisodeEntry>,
    /// Parsed procedure entries this entity is involved in.
    pub procedures: Vec<ProcedureEntry>,
}

/// Aggregate counts over a tenant's vault (§4.9 `get_stats`).
#[derive(Debug, Clone, Default)]
pub struct VaultStats {
    /// Total number of notes.
    pub total_notes: usize,
    /// Note count grouped by `type` front-matter value.
    pub by_type: BTreeMap<String, usize>,
    /// Total knowledge entries across all notes.
    pub knowledge_entries: usize,
}

/// A tenant's directory of entity notes, and the sole writer of that
/// directory (§4.4, §5).
pub struct VaultStore {
    root: PathBuf,
    lock: RwLock<()>,
    generation: AtomicU64,
}

impl VaultStore {
    /// Opens (creating if absent) the vault directory at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IoError`] if the directory cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            lock: RwLock::new(()),
            generation: AtomicU64::new(0),
        })
    }

    /// The current generation counter. Derived views (graph, vector index)
    /// compare this against the generation they were built from to decide
    /// whether a rebuild is needed (§9).
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn note_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.md", sanitize_name(name)))
    }

    /// Lists every note's file stem, sorted (§4.4 `list_notes`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::IoError`] if the directory cannot be read.
    pub fn list_notes(&self) -> Result<Vec<String>> {
        let _guard = self.lock.read().map_err(|_| Error::IoError("vault lock poisoned".to_string()))?;
        self.list_notes_unlocked()
    }

    fn list_notes_unlocked(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("md") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Reads and parses every note for derived-view construction (graph,
    /// vector index). Returns `(canonical name, raw content)` pairs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IoError`] if the directory or a note cannot be read.
    pub fn read_all_notes(&self) -> Result<Vec<(String, String)>> {
        let _guard = self.lock.read().map_err(|_| Error::IoError("vault lock poisoned".to_string()))?;
        let stems = self.list_notes_unlocked()?;
        let mut notes = Vec::with_capacity(stems.len());
        for stem in stems {
            let path = self.root.join(format!("{stem}.md"));
            let content = fs::read_to_string(&path)?;
            let name = entity_name_from_body(&content).unwrap_or(stem);
            notes.push((name, content));
        }
        Ok(notes)
    }

    /// Reads and parses one entity's note (§4.4 `get_entity_data`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFoundError`] if no note exists for `name`, or
    /// [`Error::IoError`] on a read failure.
    pub fn get_entity_data(&self, name: &str) -> Result<EntityData> {
        let _guard = self.lock.read().map_err(|_| Error::IoError("vault lock poisoned".to_string()))?;
        let path = self.note_path(name);
        if !path.exists() {
            return Err(Error::NotFoundError(name.to_string()));
        }
        let content = fs::read_to_string(&path)?;
        Ok(parse_entity_data(&content, name))
    }

    /// Aggregate stats over the vault (§4.4 `stats`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::IoError`] if the directory cannot be read.
    pub fn stats(&self) -> Result<VaultStats> {
        let _guard = self.lock.read().map_err(|_| Error::IoError("vault lock poisoned".to_string()))?;
        let stems = self.list_notes_unlocked()?;
        let mut stats = VaultStats {
            total_notes: stems.len(),
            ..VaultStats::default()
        };
        for stem in &stems {
            let path = self.root.join(format!("{stem}.md"));
            let content = fs::read_to_string(&path)?;
            let (frontmatter, body) = markdown::parse_frontmatter(&content);
            let entity_type = frontmatter.get("type").cloned().unwrap_or_else(|| "unknown".to_string());
            *stats.by_type.entry(entity_type).or_insert(0) += 1;
            stats.knowledge_entries += KNOWLEDGE_TITLE_RE.find_iter(body).count();
        }
        Ok(stats)
    }

    /// Removes an entity's note entirely (§3.4 lifecycle, §4.4 `delete`).
    /// Returns `true` if a note existed and was removed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IoError`] on a filesystem failure.
    pub fn delete(&self, name: &str) -> Result<bool> {
        let _guard = self.lock.write().map_err(|_| Error::IoError("vault lock poisoned".to_string()))?;
        let path = self.note_path(name);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path)?;
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    /// Applies the merge algorithm for one `ExtractionResult` (§4.4).
    ///
    /// Acquires the exclusive (writer) lock for the duration of the call;
    /// any mutation bumps the generation counter exactly once, invalidating
    /// cached derived views.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IoError`] if a note cannot be read or written.
    pub fn process_extraction(&self, extraction: &ExtractionResult) -> Result<MergeStats> {
        let _guard = self.lock.write().map_err(|_| Error::IoError("vault lock poisoned".to_string()))?;
        let mut stats = MergeStats::default();
        let mut known: std::collections::HashSet<String> =
            extraction.entities.iter().map(|e| e.name.clone()).collect();

        // Step 1: entities named directly by the extraction.
        for entity in &extraction.entities {
            let entity_relations: Vec<&ExtractedRelation> = extraction
                .relations
                .iter()
                .filter(|r| r.from_entity == entity.name || r.to_entity == entity.name)
                .collect();
            let entity_knowledge: Vec<&ExtractedKnowledge> =
                extraction.knowledge.iter().filter(|k| k.entity == entity.name).collect();

            let path = self.note_path(&entity.name);
            if path.exists() {
                let changed =
                    self.update_note(&path, &entity.name, &entity.facts, &entity_relations, &entity_knowledge)?;
                if changed {
                    stats.updated.push(entity.name.clone());
                }
            } else {
                self.create_note(
                    &path,
                    &entity.name,
                    &entity.entity_type,
                    &entity.facts,
                    &entity_relations,
                    &entity_knowledge,
                )?;
                stats.created.push(entity.name.clone());
            }
        }

        // Step 2: knowledge entries for entities not otherwise declared.
        for k in &extraction.knowledge {
            if k.entity.is_empty() || known.contains(&k.entity) {
                continue;
            }
            let path = self.note_path(&k.entity);
            if path.exists() {
                if self.append_knowledge(&path, std::slice::from_ref(k))? && !stats.updated.contains(&k.entity) {
                    stats.updated.push(k.entity.clone());
                }
            } else {
                self.create_note(&path, &k.entity, "concept", &[], &[], std::slice::from_ref(k))?;
                stats.created.push(k.entity.clone());
            }
            known.insert(k.entity.clone());
        }

        // Step 3: stub entities for relation endpoints not otherwise materialized.
        for rel in &extraction.relations {
            for name in [&rel.from_entity, &rel.to_entity] {
                if name.is_empty() || known.contains(name.as_str()) {
                    continue;
                }
                let path = self.note_path(name);
                if !path.exists() {
                    self.create_note(&path, name, "concept", &[], &[], &[])?;
                    stats.created.push(name.clone());
                }
                known.insert(name.clone());
            }
        }

        // Step 4: episodes. Every participant is a referential-integrity
        // endpoint (§3.3 #2): create a stub if absent, then append the
        // episode under that entity's `## Episodes` section (append-only,
        // §3.4: no dedup rule is defined for episodes).
        for episode in &extraction.episodes {
            for participant in &episode.participants {
                if participant.is_empty() {
                    continue;
                }
                let (path, newly_created) = self.ensure_entity_stub(participant, &mut stats)?;
                self.append_episode(&path, episode, participant)?;
                if !newly_created {
                    mark_updated(&mut stats, participant);
                }
            }
        }

        // Step 5: procedures. Same referential-integrity and append-only
        // treatment as episodes, keyed by the procedure's involved entities.
        for procedure in &extraction.procedures {
            for entity_name in &procedure.entities {
                if entity_name.is_empty() {
                    continue;
                }
                let (path, newly_created) = self.ensure_entity_stub(entity_name, &mut stats)?;
                self.append_procedure(&path, procedure, entity_name)?;
                if !newly_created {
                    mark_updated(&mut stats, entity_name);
                }
            }
        }

        if !stats.created.is_empty() || !stats.updated.is_empty() {
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
        Ok(stats)
    }

    /// Resolves `name` to its note path, creating a `concept` stub if one
    /// does not already exist. Returns whether a stub was just created.
    fn ensure_entity_stub(&self, name: &str, stats: &mut MergeStats) -> Result<(PathBuf, bool)> {
        let path = self.note_path(name);
        if path.exists() {
            return Ok((path, false));
        }
        self.create_note(&path, name, "concept", &[], &[], &[])?;
        if !stats.created.contains(&name.to_string()) {
            stats.created.push(name.to_string());
        }
        Ok((path, true))
    }

    fn existing_note_stems(&self) -> Result<Vec<String>> {
        self.list_notes_unlocked()
    }

    /// Wikilinkifies the first case-insensitive, non-self occurrence of
    /// every other known note name found in `text` (§4.4 step 4).
    fn add_wikilinks(&self, text: &str, current_entity: &str) -> Result<String> {
        let mut text = text.to_string();
        for note_name in self.existing_note_stems()? {
            if note_name.eq_ignore_ascii_case(current_entity) {
                continue;
            }
            if text.contains(&format!("[[{note_name}]]")) {
                continue;
            }
            let pattern = match Regex::new(&format!("(?i){}", regex::escape(&note_name))) {
                Ok(re) => re,
                Err(_) => continue,
            };
            if let Some(m) = pattern.find(&text) {
                let mut replaced = String::with_capacity(text.len());
                replaced.push_str(&text[..m.start()]);
                replaced.push_str(&format!("[[{note_name}]]"));
                replaced.push_str(&text[m.end()..]);
                text = replaced;
            }
        }
        Ok(text)
    }

    fn create_note(
        &self,
        path: &Path,
        name: &str,
        entity_type: &str,
        facts: &[crate::extraction::ExtractedFact],
        relations: &[&ExtractedRelation],
        knowledge: &[&ExtractedKnowledge],
    ) -> Result<()> {
        let now = crate::now_stamp();
        let mut body = String::new();
        body.push_str(&format!("# {name}\n"));

        if !facts.is_empty() {
            body.push_str("\n## Facts\n\n");
            for fact in facts {
                let linked = self.add_wikilinks(&fact.content, name)?;
                body.push_str(&format!("- {linked}\n"));
            }
        }

        if !relations.is_empty() {
            body.push_str("\n## Relations\n\n");
            for rel in relations {
                body.push_str(&format_relation_line(rel, name));
            }
        }

        if !knowledge.is_empty() {
            body.push_str("\n## Knowledge\n\n");
            for k in knowledge {
                body.push_str(&self.format_knowledge_entry(k, name)?);
            }
        }

        let content = format_with_frontmatter(entity_type, &now, &now, &[entity_type.to_string()], &body);
        write_atomic(path, &content)
    }

    /// Returns `true` if the note was actually changed.
    fn update_note(
        &self,
        path: &Path,
        name: &str,
        facts: &[crate::extraction::ExtractedFact],
        relations: &[&ExtractedRelation],
        knowledge: &[&ExtractedKnowledge],
    ) -> Result<bool> {
        let content = fs::read_to_string(path)?;
        let (mut frontmatter, mut body) = markdown::parse_frontmatter(&content);
        let created = frontmatter.get("created").cloned().unwrap_or_else(crate::now_stamp);
        let entity_type = frontmatter.get("type").cloned().unwrap_or_else(|| "concept".to_string());

        let existing_facts = extract_existing_facts(body);
        let new_facts: Vec<&crate::extraction::ExtractedFact> = facts
            .iter()
            .filter(|f| !dedup::fact_exists(&f.content, &existing_facts))
            .collect();

        let mut changed = false;

        if !new_facts.is_empty() {
            let mut new_lines = String::new();
            for fact in &new_facts {
                let linked = self.add_wikilinks(&fact.content, name)?;
                new_lines.push_str(&format!("- {linked}\n"));
            }
            body = insert_into_section(&body, "## Facts", &new_lines);
            changed = true;
        }

        let existing_links: std::collections::HashSet<String> = WIKILINK_SCAN_RE
            .captures_iter(&body)
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .collect();
        let new_rels: Vec<&&ExtractedRelation> = relations
            .iter()
            .filter(|r| {
                let other = if r.from_entity == name { &r.to_entity } else { &r.from_entity };
                !existing_links.contains(other)
            })
            .collect();

        if !new_rels.is_empty() {
            let mut new_lines = String::new();
            for rel in &new_rels {
                new_lines.push_str(&format_relation_line(rel, name));
            }
            body = insert_into_section(&body, "## Relations", &new_lines);
            changed = true;
        }

        if !knowledge.is_empty() {
            let existing_titles: std::collections::HashSet<String> = KNOWLEDGE_TITLE_RE
                .captures_iter(&body)
                .filter_map(|c| c.get(1).map(|m| m.as_str().trim().to_string()))
                .collect();
            let new_knowledge: Vec<&&ExtractedKnowledge> =
                knowledge.iter().filter(|k| !existing_titles.contains(&k.title)).collect();
            if !new_knowledge.is_empty() {
                for k in &new_knowledge {
                    let entry = self.format_knowledge_entry(k, name)?;
                    body = append_knowledge_entry(&body, &entry);
                }
                changed = true;
            }
        }

        if changed {
            frontmatter.insert("updated".to_string(), crate::now_stamp());
            let tags = frontmatter
                .get("tags")
                .cloned()
                .unwrap_or_else(|| entity_type.clone());
            let tag_list: Vec<String> = tags.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
            let out = format_with_frontmatter(&entity_type, &created, &frontmatter["updated"], &tag_list, &body);
            write_atomic(path, &out)?;
        }

        Ok(changed)
    }

    fn append_knowledge(&self, path: &Path, knowledge: &[ExtractedKnowledge]) -> Result<bool> {
        let content = fs::read_to_string(path)?;
        let (mut frontmatter, mut body) = markdown::parse_frontmatter(&content);
        let created = frontmatter.get("created").cloned().unwrap_or_else(crate::now_stamp);
        let entity_type = frontmatter.get("type").cloned().unwrap_or_else(|| "concept".to_string());
        let name = entity_name_from_body(&content).unwrap_or_default();

        let existing_titles: std::collections::HashSet<String> = KNOWLEDGE_TITLE_RE
            .captures_iter(body)
            .filter_map(|c| c.get(1).map(|m| m.as_str().trim().to_string()))
            .collect();
        let new_knowledge: Vec<&ExtractedKnowledge> =
            knowledge.iter().filter(|k| !existing_titles.contains(&k.title)).collect();
        if new_knowledge.is_empty() {
            return Ok(false);
        }

        for k in &new_knowledge {
            let entry = self.format_knowledge_entry(k, &name)?;
            body = append_knowledge_entry(&body, &entry);
        }

        frontmatter.insert("updated".to_string(), crate::now_stamp());
        let tags = frontmatter.get("tags").cloned().unwrap_or_else(|| entity_type.clone());
        let tag_list: Vec<String> = tags.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
        let out = format_with_frontmatter(&entity_type, &created, &frontmatter["updated"], &tag_list, &body);
        write_atomic(path, &out)?;
        Ok(true)
    }

    fn format_knowledge_entry(&self, k: &ExtractedKnowledge, current_entity: &str) -> Result<String> {
        let today = crate::today_stamp();
        let mut entry = format!("**[{}] {}** ({})\n", k.knowledge_type, k.title, today);
        let linked = self.add_wikilinks(&k.content, current_entity)?;
        entry.push_str(&linked);
        entry.push('\n');
        if let Some(artifact) = &k.artifact {
            let lang = detect_artifact_lang(artifact, &k.knowledge_type);
            entry.push_str(&format!("\n```{lang}\n{}\n```\n", artifact.trim()));
        }
        entry.push('\n');
        Ok(entry)
    }

    /// Appends an episode entry to `path`'s `## Episodes` section
    /// (append-only, §3.4; no dedup rule is defined for episodes).
    ///
    /// # Errors
    ///
    /// Returns [`Error::IoError`] if the note cannot be read or written.
    fn append_episode(&self, path: &Path, episode: &crate::extraction::ExtractedEpisode, current_entity: &str) -> Result<()> {
        let content = fs::read_to_string(path)?;
        let (mut frontmatter, mut body) = markdown::parse_frontmatter(&content);
        let created = frontmatter.get("created").cloned().unwrap_or_else(crate::now_stamp);
        let entity_type = frontmatter.get("type").cloned().unwrap_or_else(|| "concept".to_string());

        let entry = self.format_episode_entry(episode, current_entity)?;
        body = append_section_entry(&body, "## Episodes", &entry);

        frontmatter.insert("updated".to_string(), crate::now_stamp());
        let tags = frontmatter.get("tags").cloned().unwrap_or_else(|| entity_type.clone());
        let tag_list: Vec<String> = tags.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
        let out = format_with_frontmatter(&entity_type, &created, &frontmatter["updated"], &tag_list, &body);
        write_atomic(path, &out)
    }

    /// Appends a procedure entry to `path`'s `## Procedures` section
    /// (append-only, §3.4; no dedup rule is defined for procedures).
    ///
    /// # Errors
    ///
    /// Returns [`Error::IoError`] if the note cannot be read or written.
    fn append_procedure(&self, path: &Path, procedure: &crate::extraction::ExtractedProcedure, current_entity: &str) -> Result<()> {
        let content = fs::read_to_string(path)?;
        let (mut frontmatter, mut body) = markdown::parse_frontmatter(&content);
        let created = frontmatter.get("created").cloned().unwrap_or_else(crate::now_stamp);
        let entity_type = frontmatter.get("type").cloned().unwrap_or_else(|| "concept".to_string());

        let entry = format_procedure_entry(procedure, current_entity);
        body = append_section_entry(&body, "## Procedures", &entry);

        frontmatter.insert("updated".to_string(), crate::now_stamp());
        let tags = frontmatter.get("tags").cloned().unwrap_or_else(|| entity_type.clone());
        let tag_list: Vec<String> = tags.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
        let out = format_with_frontmatter(&entity_type, &created, &frontmatter["updated"], &tag_list, &body);
        write_atomic(path, &out)
    }

    fn format_episode_entry(&self, ep: &crate::extraction::ExtractedEpisode, current_entity: &str) -> Result<String> {
        let date = ep.happened_at.clone().unwrap_or_else(crate::today_stamp);
        let mut entry = format!("**{}** ({date})\n", ep.summary);
        if !ep.context.is_empty() {
            let linked = self.add_wikilinks(&ep.context, current_entity)?;
            entry.push_str(&linked);
            entry.push('\n');
        }
        if !ep.outcome.is_empty() {
            entry.push_str(&format!("Outcome: {}\n", ep.outcome));
        }
        entry.push_str(&format!("[{}, importance: {:.2}]\n", ep.emotional_valence, ep.importance));
        let others: Vec<String> =
            ep.participants.iter().filter(|p| !p.eq_ignore_ascii_case(current_entity)).cloned().collect();
        if !others.is_empty() {
            let links: Vec<String> = others.iter().map(|o| format!("[[{o}]]")).collect();
            entry.push_str(&format!("Participants: {}\n", links.join(", ")));
        }
        entry.push('\n');
        Ok(entry)
    }
}

/// Marks `name` as updated unless it's already tracked as created or
/// updated in this merge (avoids an entity appearing in both lists).
fn mark_updated(stats: &mut MergeStats, name: &str) {
    if !stats.created.contains(&name.to_string()) && !stats.updated.contains(&name.to_string()) {
        stats.updated.push(name.to_string());
    }
}

fn format_procedure_entry(pr: &crate::extraction::ExtractedProcedure, current_entity: &str) -> String {
    let mut entry = format!("**{}**\n", pr.name);
    if !pr.trigger.is_empty() {
        entry.push_str(&format!("Trigger: {}\n", pr.trigger));
    }
    for step in &pr.steps {
        if let Some(detail) = &step.detail {
            entry.push_str(&format!("{}. {} - {detail}\n", step.step, step.action));
        } else {
            entry.push_str(&format!("{}. {}\n", step.step, step.action));
        }
    }
    let others: Vec<String> = pr.entities.iter().filter(|e| !e.eq_ignore_ascii_case(current_entity)).cloned().collect();
    if !others.is_empty() {
        let links: Vec<String> = others.iter().map(|o| format!("[[{o}]]")).collect();
        entry.push_str(&format!("Entities: {}\n", links.join(", ")));
    }
    entry.push('\n');
    entry
}

/// Appends `entry` at the end of `heading`'s section, creating the section
/// at the end of the body if absent (§4.3 "inserted at the end of the
/// matching section").
fn append_section_entry(body: &str, heading: &str, entry: &str) -> String {
    if body.contains(heading) {
        format!("{}\n\n{}", body.trim_end(), entry.trim_end())
    } else {
        format!("{}\n\n{heading}\n\n{}", body.trim_end(), entry.trim_end())
    }
}

fn extract_existing_facts(body: &str) -> Vec<String> {
    let sections = markdown::extract_sections(body);
    let Some(facts_section) = sections.iter().find(|s| s.title == "Facts") else {
        return Vec::new();
    };
    facts_section
        .content
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let rest = line.strip_prefix("- ")?;
            Some(WIKILINK_SCAN_RE.replace_all(rest, "$1").to_string())
        })
        .collect()
}

fn format_relation_line(rel: &ExtractedRelation, current_entity: &str) -> String {
    let outgoing = rel.from_entity == current_entity;
    let other = if outgoing { &rel.to_entity } else { &rel.from_entity };
    let arrow = if outgoing { "→" } else { "←" };
    let desc = if rel.description.is_empty() {
        String::new()
    } else {
        format!(": {}", rel.description)
    };
    format!("- {arrow} **{}** [[{other}]]{desc}\n", rel.relation_type)
}

/// Inserts `new_lines` at the end of `section_heading`'s content (creating
/// the section at the end of the body if it does not exist yet; §4.3
/// "inserted at the end of the matching section").
fn insert_into_section(body: &str, section_heading: &str, new_lines: &str) -> String {
    if let Some(start) = body.find(section_heading) {
        let search_from = start + section_heading.len();
        let insert_at = find_next_section(body, search_from).unwrap_or(body.len());
        format!("{}\n{new_lines}\n{}", body[..insert_at].trim_end(), &body[insert_at..])
    } else {
        format!("{}\n\n{section_heading}\n\n{new_lines}", body.trim_end())
    }
}

fn append_knowledge_entry(body: &str, entry: &str) -> String {
    append_section_entry(body, "## Knowledge", entry)
}

fn find_next_section(body: &str, start: usize) -> Option<usize> {
    body[start..].find("\n## ").map(|pos| start + pos)
}

fn format_with_frontmatter(entity_type: &str, created: &str, updated: &str, tags: &[String], body: &str) -> String {
    let mut unique_tags = tags.to_vec();
    if !unique_tags.iter().any(|t| t == entity_type) {
        unique_tags.insert(0, entity_type.to_string());
    }
    let tags_str = unique_tags.join(", ");
    format!(
        "---\ntype: {entity_type}\ncreated: {created}\nupdated: {updated}\ntags: [{tags_str}]\n---\n\n{}\n",
        body.trim()
    )
}

fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let tmp_path = path.with_extension("md.tmp");
    fs::write(&tmp_path, content)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Recovers the entity's canonical name from its `# Heading`, if present.
fn entity_name_from_body(content: &str) -> Option<String> {
    let (_, body) = markdown::parse_frontmatter(content);
    let sections = markdown::extract_sections(body);
    sections.into_iter().find(|s| s.level == 1).map(|s| s.title)
}

fn parse_entity_data(content: &str, fallback_name: &str) -> EntityData {
    let (frontmatter, body) = markdown::parse_frontmatter(content);
    let name = entity_name_from_body(content).unwrap_or_else(|| fallback_name.to_string());
    let entity_type = frontmatter.get("type").cloned().unwrap_or_else(|| "concept".to_string());
    let created = frontmatter.get("created").cloned().unwrap_or_default();
    let updated = frontmatter.get("updated").cloned().unwrap_or_default();
    let tags = frontmatter
        .get("tags")
        .map(|t| t.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();

    let sections = markdown::extract_sections(body);
    let facts = sections
        .iter()
        .find(|s| s.title == "Facts")
        .map(|s| {
            s.content
                .lines()
                .filter_map(|l| l.trim().strip_prefix("- ").map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    let relations = sections
        .iter()
        .find(|s| s.title == "Relations")
        .map(|s| {
            s.content
                .lines()
                .filter_map(|l| parse_relation_line(l.trim()))
                .collect()
        })
        .unwrap_or_default();

    let knowledge = sections
        .iter()
        .find(|s| s.title == "Knowledge")
        .map(|s| parse_knowledge_entries(&s.content))
        .unwrap_or_default();

    let episodes = sections
        .iter()
        .find(|s| s.title == "Episodes")
        .map(|s| parse_episode_entries(&s.content))
        .unwrap_or_default();

    let procedures = sections
        .iter()
        .find(|s| s.title == "Procedures")
        .map(|s| parse_procedure_entries(&s.content))
        .unwrap_or_default();

    EntityData {
        name,
        entity_type,
        created,
        updated,
        tags,
        facts,
        relations,
        knowledge,
        episodes,
        procedures,
    }
}

fn parse_episode_entries(content: &str) -> Vec<EpisodeEntry> {
    static HEADER_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?m)^\*\*(.+?)\*\*\s+\(([\d-]+)\)\s*$").expect("valid regex"));
    static VALENCE_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^\[(\w+),\s*importance:\s*([\d.]+)\]$").expect("valid regex"));

    let headers: Vec<_> = HEADER_RE.captures_iter(content).collect();
    let mut entries = Vec::new();
    for (i, header) in headers.iter().enumerate() {
        let full = header.get(0).expect("full match");
        let summary = header.get(1).expect("group 1").as_str().trim().to_string();
        let date = header.get(2).expect("group 2").as_str().to_string();
        let start = full.end();
        let end = headers.get(i + 1).and_then(|next| next.get(0)).map_or(content.len(), |m| m.start());
        let block = content[start..end].trim();

        let mut context_lines = Vec::new();
        let mut outcome = None;
        let mut emotional_valence = "neutral".to_string();
        let mut importance = 0.5_f32;
        let mut participants = Vec::new();

        for line in block.lines() {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix("Outcome: ") {
                outcome = Some(rest.to_string());
            } else if let Some(rest) = line.strip_prefix("Participants: ") {
                participants = rest
                    .split(',')
                    .map(|s| WIKILINK_SCAN_RE.replace_all(s.trim(), "$1").to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            } else if let Some(captures) = VALENCE_RE.captures(line) {
                emotional_valence = captures.get(1).expect("group 1").as_str().to_string();
                importance = captures.get(2).expect("group 2").as_str().parse().unwrap_or(0.5);
            } else if !line.is_empty() {
                context_lines.push(line.to_string());
            }
        }

        entries.push(EpisodeEntry {
            summary,
            date,
            context: context_lines.join(" "),
            outcome,
            emotional_valence,
            importance,
            participants,
        });
    }
    entries
}

fn parse_procedure_entries(content: &str) -> Vec<ProcedureEntry> {
    static HEADER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\*\*([^*]+)\*\*\s*$").expect("valid regex"));
    static STEP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+\.\s+.+$").expect("valid regex"));

    let headers: Vec<_> = HEADER_RE.captures_iter(content).collect();
    let mut entries = Vec::new();
    for (i, header) in headers.iter().enumerate() {
        let full = header.get(0).expect("full match");
        let name = header.get(1).expect("group 1").as_str().trim().to_string();
        let start = full.end();
        let end = headers.get(i + 1).and_then(|next| next.get(0)).map_or(content.len(), |m| m.start());
        let block = content[start..end].trim();

        let mut trigger = None;
        let mut steps = Vec::new();
        let mut entities = Vec::new();

        for line in block.lines() {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix("Trigger: ") {
                trigger = Some(rest.to_string());
            } else if let Some(rest) = line.strip_prefix("Entities: ") {
                entities = rest
                    .split(',')
                    .map(|s| WIKILINK_SCAN_RE.replace_all(s.trim(), "$1").to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            } else if STEP_RE.is_match(line) {
                steps.push(line.to_string());
            }
        }

        entries.push(ProcedureEntry { name, trigger, steps, entities });
    }
    entries
}

fn parse_relation_line(line: &str) -> Option<RelationLine> {
    let rest = line.strip_prefix("- ")?;
    let captures = RELATION_LINE_RE.captures(rest)?;
    let outgoing = captures.get(1).is_some_and(|m| m.as_str() == "→");
    let relation_type = captures.get(2)?.as_str().to_string();
    let other = captures.get(3)?.as_str().to_string();
    let description = captures.get(4).map(|m| m.as_str().to_string());
    Some(RelationLine {
        outgoing,
        relation_type,
        other,
        description,
    })
}

fn parse_knowledge_entries(content: &str) -> Vec<KnowledgeEntry> {
    static ENTRY_HEADER_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?m)^\*\*\[(\w+)\]\s+(.+?)\*\*\s+\(([\d-]+)\)\s*$").expect("valid regex"));

    let headers: Vec<_> = ENTRY_HEADER_RE.captures_iter(content).collect();
    let mut entries = Vec::new();
    for (i, header) in headers.iter().enumerate() {
        let full = header.get(0).expect("full match");
        let start = full.end();
        let end = headers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(content.len(), |m| m.start());
        let block = content[start..end].trim();

        let (prose, artifact) = if let Some(fence_start) = block.find("```") {
            let prose = block[..fence_start].trim().to_string();
            let after_lang = &block[fence_start + 3..];
            let lang_end = after_lang.find('\n').map_or(0, |i| i + 1);
            let rest = &after_lang[lang_end..];
            let artifact = rest.rfind("```").map(|end| rest[..end].trim().to_string());
            (prose, artifact)
        } else {
            (block.to_string(), None)
        };

        entries.push(KnowledgeEntry {
            knowledge_type: header.get(1).expect("group 1").as_str().to_string(),
            title: header.get(2).expect("group 2").as_str().trim().to_string(),
            date: header.get(3).expect("group 3").as_str().to_string(),
            content: prose,
            artifact,
        });
    }
    entries
}

/// Detects a fenced-code-block language tag for a knowledge artifact,
/// mirroring the reference's content-then-type heuristic exactly.
#[must_use]
pub fn detect_artifact_lang(artifact: &str, knowledge_type: &str) -> &'static str {
    let trimmed = artifact.trim();
    let lower_start = trimmed.get(..6.min(trimmed.len())).unwrap_or("").to_ascii_lowercase();
    if lower_start.starts_with("select") {
        return "sql";
    }
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return "json";
    }
    if trimmed.starts_with('<') {
        return "xml";
    }
    if trimmed.starts_with("def ") || trimmed.starts_with("import ") {
        return "python";
    }
    if trimmed.starts_with("public ") || trimmed.starts_with("private ") {
        return "java";
    }
    if trimmed.contains(':') && !trimmed.starts_with("http") {
        return "yaml";
    }
    if trimmed.starts_with('$') || trimmed.starts_with("#!") {
        return "bash";
    }
    match knowledge_type {
        "command" => "bash",
        "config" => "yaml",
        "formula" => "math",
        "sql" => "sql",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::{ExtractedEntity, ExtractedFact};

    fn entity(name: &str, entity_type: &str, facts: &[&str]) -> ExtractedEntity {
        ExtractedEntity {
            name: name.to_string(),
            entity_type: entity_type.to_string(),
            facts: facts.iter().map(|f| ExtractedFact { content: (*f).to_string(), happened_at: None }).collect(),
        }
    }

    #[test]
    fn test_sanitize_replaces_forbidden_chars() {
        assert_eq!(sanitize_name("a/b:c"), "a_b_c");
    }

    #[test]
    fn test_create_then_read_back() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let vault = VaultStore::open(tmp.path()).expect("open");

        let extraction = ExtractionResult {
            entities: vec![entity("Ali", "person", &["works at Uzum Bank"])],
            relations: vec![ExtractedRelation {
                from_entity: "Ali".to_string(),
                to_entity: "Uzum Bank".to_string(),
                relation_type: "works_at".to_string(),
                description: String::new(),
            }],
            knowledge: vec![],
            episodes: vec![],
            procedures: vec![],
            raw_response: String::new(),
        };

        let stats = vault.process_extraction(&extraction).expect("merge");
        assert!(stats.created.contains(&"Ali".to_string()));
        assert!(stats.created.contains(&"Uzum Bank".to_string()));

        let data = vault.get_entity_data("Ali").expect("read back");
        assert_eq!(data.name, "Ali");
        assert_eq!(data.relations.len(), 1);
        assert_eq!(data.relations[0].relation_type, "works_at");
        assert!(data.relations[0].outgoing);
    }

    #[test]
    fn test_episode_materializes_stub_participants_and_appends_entry() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let vault = VaultStore::open(tmp.path()).expect("open");
        let extraction = ExtractionResult {
            entities: vec![],
            relations: vec![],
            knowledge: vec![],
            episodes: vec![crate::extraction::ExtractedEpisode {
                summary: "Debugged a flaky deploy".to_string(),
                context: "Ali and Bob paired on the Uzum Bank outage".to_string(),
                outcome: "Rolled back the bad release".to_string(),
                participants: vec!["Ali".to_string(), "Bob".to_string()],
                emotional_valence: "positive".to_string(),
                importance: 0.8,
                happened_at: Some("2026-01-15".to_string()),
            }],
            procedures: vec![],
            raw_response: String::new(),
        };

        let stats = vault.process_extraction(&extraction).expect("merge");
        assert!(stats.created.contains(&"Ali".to_string()));
        assert!(stats.created.contains(&"Bob".to_string()));

        let ali = vault.get_entity_data("Ali").expect("read back");
        assert_eq!(ali.entity_type, "concept");
        assert_eq!(ali.episodes.len(), 1);
        assert_eq!(ali.episodes[0].summary, "Debugged a flaky deploy");
        assert_eq!(ali.episodes[0].date, "2026-01-15");
        assert_eq!(ali.episodes[0].outcome.as_deref(), Some("Rolled back the bad release"));
        assert_eq!(ali.episodes[0].emotional_valence, "positive");
        assert!((ali.episodes[0].importance - 0.8).abs() < 1e-6);
        assert_eq!(ali.episodes[0].participants, vec!["Bob".to_string()]);

        let bob = vault.get_entity_data("Bob").expect("read back");
        assert_eq!(bob.episodes[0].participants, vec!["Ali".to_string()]);
    }

    #[test]
    fn test_procedure_materializes_stub_entities_and_appends_entry() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let vault = VaultStore::open(tmp.path()).expect("open");
        let extraction = ExtractionResult {
            entities: vec![],
            relations: vec![],
            knowledge: vec![],
            episodes: vec![],
            procedures: vec![crate::extraction::ExtractedProcedure {
                name: "Deploy rollback".to_string(),
                trigger: "A release breaks production".to_string(),
                steps: vec![
                    crate::extraction::ProcedureStep {
                        step: 1,
                        action: "Revert the release".to_string(),
                        detail: Some("git revert HEAD".to_string()),
                    },
                    crate::extraction::ProcedureStep { step: 2, action: "Notify the team".to_string(), detail: None },
                ],
                entities: vec!["Uzum Bank".to_string()],
            }],
            raw_response: String::new(),
        };

        let stats = vault.process_extraction(&extraction).expect("merge");
        assert!(stats.created.contains(&"Uzum Bank".to_string()));

        let data = vault.get_entity_data("Uzum Bank").expect("read back");
        assert_eq!(data.procedures.len(), 1);
        assert_eq!(data.procedures[0].name, "Deploy rollback");
        assert_eq!(data.procedures[0].trigger.as_deref(), Some("A release breaks production"));
        assert_eq!(data.procedures[0].steps.len(), 2);
        assert!(data.procedures[0].steps[0].contains("Revert the release"));
    }

    #[test]
    fn test_episodes_are_append_only_across_reingestion() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let vault = VaultStore::open(tmp.path()).expect("open");
        let extraction = ExtractionResult {
            entities: vec![],
            relations: vec![],
            knowledge: vec![],
            episodes: vec![crate::extraction::ExtractedEpisode {
                summary: "Shipped v1".to_string(),
                context: "Launched the first release".to_string(),
                outcome: "Success".to_string(),
                participants: vec!["Ali".to_string()],
                emotional_valence: "positive".to_string(),
                importance: 0.6,
                happened_at: None,
            }],
            procedures: vec![],
            raw_response: String::new(),
        };

        vault.process_extraction(&extraction).expect("first");
        vault.process_extraction(&extraction).expect("second");

        let data = vault.get_entity_data("Ali").expect("read back");
        assert_eq!(data.episodes.len(), 2, "episodes are append-only per §3.4, no dedup rule applies");
    }

    #[test]
    fn test_idempotent_reingestion_does_not_duplicate_facts() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let vault = VaultStore::open(tmp.path()).expect("open");
        let extraction = ExtractionResult {
            entities: vec![entity("Ali", "person", &["uses Python"])],
            relations: vec![],
            knowledge: vec![],
            episodes: vec![],
            procedures: vec![],
            raw_response: String::new(),
        };
        vault.process_extraction(&extraction).expect("first");
        vault.process_extraction(&extraction).expect("second");

        let data = vault.get_entity_data("Ali").expect("read");
        assert_eq!(data.facts.len(), 1);
    }

    #[test]
    fn test_delete_then_not_found() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let vault = VaultStore::open(tmp.path()).expect("open");
        let extraction = ExtractionResult {
            entities: vec![entity("Ali", "person", &[])],
            relations: vec![],
            knowledge: vec![],
            episodes: vec![],
            procedures: vec![],
            raw_response: String::new(),
        };
        vault.process_extraction(&extraction).expect("merge");
        assert!(vault.delete("Ali").expect("delete"));
        assert!(matches!(vault.get_entity_data("Ali"), Err(Error::NotFoundError(_))));
    }

    #[test]
    fn test_detect_artifact_lang_sql() {
        assert_eq!(detect_artifact_lang("SELECT 1", "solution"), "sql");
    }

    #[test]
    fn test_detect_artifact_lang_falls_back_to_type() {
        assert_eq!(detect_artifact_lang("ls -la", "command"), "bash");
    }
}
