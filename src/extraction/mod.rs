//! Extraction orchestrator.
//!
//! Drives an [`LlmProvider`] with a context-seeded prompt and parses the
//! structured response defensively into an [`ExtractionResult`] (§4.7).
//! The LLM's JSON is schemaless by nature; it is modeled here as tagged
//! structs with per-field validation rather than passed through as a raw
//! `serde_json::Value` (§9 "dynamically typed extraction result").

use crate::llm::{extract_json_from_response, LlmProvider};
use serde_json::Value;

/// Version marker for the extraction prompt wording (§9 ambiguity #1: two
/// source variants of the prompt coexist with the same schema; this crate
/// keeps one and versions it so a future reword is visible in diffs).
pub const EXTRACTION_PROMPT_VERSION: u32 = 2;

const EXTRACTION_PROMPT: &str = r#"You are a precision knowledge extraction system. Extract IMPORTANT, LASTING personal knowledge from the USER's messages.

Return ONLY valid JSON without markdown. Be VERY selective - quality over quantity.

ENTITY RULES:
- ONLY named, specific entities with 2+ extractable facts where possible
- entity_type: person, project, technology, company, concept, place, activity
- If user says "I"/"me"/"my", resolve to their name if known, otherwise "User"
{existing_context}
ENTITY NAMING:
- EXACT casing from context: "Mengram" not "MENGRAM", "PostgreSQL" not "postgresql"
- If an entity already exists above, use the EXACT SAME NAME (do not create duplicates)

FACT RULES:
- Normalized format: subject + verb + object, present tense, under 20 words
- Do not re-extract facts that already exist above, even if worded slightly differently

Response format (strict JSON, no ```):
{{
  "entities": [{{"name": "Entity Name", "type": "person|project|technology|company|concept|place|activity", "facts": ["fact 1", {{"fact": "fact 2", "when": "2026-01-01"}}]}}],
  "relations": [{{"from": "Entity 1", "to": "Entity 2", "type": "works_at|uses|member_of|depends_on|created_by|friend_of|lives_in|related_to", "description": "short description"}}],
  "knowledge": [{{"entity": "Entity this knowledge belongs to", "type": "solution|formula|command|insight|decision|recipe|reference", "title": "Short descriptive title", "content": "Detailed explanation", "artifact": "code/config/formula/command (optional, null if none)"}}],
  "episodes": [{{"summary": "Brief description (under 20 words)", "context": "Detailed description", "outcome": "What was decided or resolved", "participants": ["Entity1"], "emotional_valence": "positive|negative|neutral|mixed", "importance": 0.5, "happened_at": null}}],
  "procedures": [{{"name": "Short procedure name", "trigger": "When to use this procedure", "steps": [{{"step": 1, "action": "What to do", "detail": "Specifics"}}], "entities": ["Entity1"]}}]
}}

CONVERSATION:
{conversation}

Extract knowledge (return ONLY JSON):"#;

const EXISTING_CONTEXT_BLOCK: &str = "\nEXISTING ENTITIES FOR THIS USER (use same names, avoid duplicate facts):\n{context}\n";

/// A role in a conversation turn (§4.7 step 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The end user.
    User,
    /// The AI assistant.
    Assistant,
}

impl Role {
    fn label(self) -> &'static str {
        match self {
            Self::User => "User",
            Self::Assistant => "Assistant",
        }
    }
}

/// One turn of a conversation passed to `remember`.
#[derive(Debug, Clone)]
pub struct ConversationTurn {
    /// Who said it.
    pub role: Role,
    /// What they said.
    pub content: String,
}

impl ConversationTurn {
    /// Builds a user-role turn.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    /// Builds an assistant-role turn.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// One fact, normalized from either a bare string or a `{fact, when}`
/// object in the LLM's response (§4.7 field normalization).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedFact {
    /// Fact content (≤20 words, §3.2).
    pub content: String,
    /// Optional ISO event date.
    pub happened_at: Option<String>,
}

/// An entity named by the extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedEntity {
    /// Canonical name, exact casing.
    pub name: String,
    /// One of person/project/technology/company/concept/place/activity;
    /// unrecognized values are *not* rejected here (entity_type is open
    /// text downstream), only missing ones default to `concept`.
    pub entity_type: String,
    /// Facts about this entity.
    pub facts: Vec<ExtractedFact>,
}

/// A directed relation between two entities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedRelation {
    /// Source entity name.
    pub from_entity: String,
    /// Target entity name.
    pub to_entity: String,
    /// Relation type (open vocabulary; defaults to `related_to`).
    pub relation_type: String,
    /// Optional description.
    pub description: String,
}

/// A typed, titled knowledge entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedKnowledge {
    /// Entity this knowledge belongs to.
    pub entity: String,
    /// Knowledge type, e.g. `solution`, `command`.
    pub knowledge_type: String,
    /// Short descriptive title (keyed for uniqueness, §3.3 #4).
    pub title: String,
    /// Prose content.
    pub content: String,
    /// Optional code/config/formula/command artifact.
    pub artifact: Option<String>,
}

/// A past event.
// `importance` is an `f32`, which has no total order (`NaN`), so this type
// can only derive `PartialEq`, not `Eq`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedEpisode {
    /// ≤20-word summary.
    pub summary: String,
    /// Detailed context.
    pub context: String,
    /// What resulted.
    pub outcome: String,
    /// Participant entity names.
    pub participants: Vec<String>,
    /// One of positive/negative/neutral/mixed.
    pub emotional_valence: String,
    /// Clamped to `[0, 1]`.
    pub importance: f32,
    /// Optional event date.
    pub happened_at: Option<String>,
}

/// One step of a procedure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcedureStep {
    /// 1-indexed step number.
    pub step: u32,
    /// What to do.
    pub action: String,
    /// Optional specifics (a command, a file path, …).
    pub detail: Option<String>,
}

/// A named, ordered workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedProcedure {
    /// Procedure name.
    pub name: String,
    /// When to use it.
    pub trigger: String,
    /// Ordered steps.
    pub steps: Vec<ProcedureStep>,
    /// Entities this procedure involves.
    pub entities: Vec<String>,
}

/// The full structured output of one extraction call (§4.7).
// Carries `ExtractedEpisode`, so this can only derive `PartialEq` too.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractionResult {
    /// Entities mentioned.
    pub entities: Vec<ExtractedEntity>,
    /// Relations between entities.
    pub relations: Vec<ExtractedRelation>,
    /// Knowledge entries.
    pub knowledge: Vec<ExtractedKnowledge>,
    /// Episodes (events).
    pub episodes: Vec<ExtractedEpisode>,
    /// Procedures (workflows).
    pub procedures: Vec<ExtractedProcedure>,
    /// Raw LLM response text, retained for debugging.
    pub raw_response: String,
}

/// Normalizes `happened_at`/date-like string values: `"null"`, `"none"`,
/// `"unknown"`, and `""` (case-insensitively) all become absent (§4.7).
fn normalize_date(value: Option<&str>) -> Option<String> {
    let value = value?.trim();
    if value.is_empty() {
        return None;
    }
    match value.to_ascii_lowercase().as_str() {
        "null" | "none" | "unknown" => None,
        _ => Some(value.to_string()),
    }
}

fn parse_fact(value: &Value) -> Option<ExtractedFact> {
    match value {
        Value::String(s) => Some(ExtractedFact { content: s.clone(), happened_at: None }),
        Value::Object(obj) => {
            let content = obj.get("fact").and_then(Value::as_str)?.to_string();
            let happened_at = normalize_date(obj.get("when").and_then(Value::as_str));
            Some(ExtractedFact { content, happened_at })
        }
        _ => None,
    }
}

fn str_field(obj: &serde_json::Map<String, Value>, key: &str, default: &str) -> String {
    obj.get(key).and_then(Value::as_str).unwrap_or(default).to_string()
}

fn str_list(obj: &serde_json::Map<String, Value>, key: &str) -> Vec<String> {
    obj.get(key)
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

/// Drives an LLM through the extraction prompt contract and parses its
/// response defensively (§4.7).
pub struct ExtractionOrchestrator<'a> {
    llm: &'a dyn LlmProvider,
}

impl<'a> ExtractionOrchestrator<'a> {
    /// Wraps an LLM provider for extraction calls.
    #[must_use]
    pub fn new(llm: &'a dyn LlmProvider) -> Self {
        Self { llm }
    }

    /// Produces an [`ExtractionResult`] from a conversation, optionally
    /// seeded with an existing-context block of the tenant's known entities.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::LlmError`] only if the underlying LLM call
    /// itself fails (after its own retries). A malformed JSON response is
    /// *not* an error here: it degrades to an empty [`ExtractionResult`]
    /// with a logged warning (§7 "orchestrator-level parse failures return
    /// an empty extraction with a warning").
    pub fn extract(&self, conversation: &[ConversationTurn], existing_context: &str) -> crate::Result<ExtractionResult> {
        let prompt = build_prompt(conversation, existing_context);
        let raw = self.llm.complete(&prompt, "")?;
        Ok(parse_response(&raw))
    }
}

fn format_conversation(conversation: &[ConversationTurn]) -> String {
    conversation
        .iter()
        .map(|turn| format!("{}: {}", turn.role.label(), turn.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn build_prompt(conversation: &[ConversationTurn], existing_context: &str) -> String {
    let context_block = if existing_context.is_empty() {
        String::new()
    } else {
        EXISTING_CONTEXT_BLOCK.replace("{context}", existing_context)
    };
    EXTRACTION_PROMPT
        .replace("{existing_context}", &context_block)
        .replace("{conversation}", &format_conversation(conversation))
}

/// Parses a raw LLM response defensively (§4.7 "Response parsing").
///
/// Strips a leading fenced-code-block marker if present, tries a direct
/// JSON parse, and on failure retries against the outermost `{…}`
/// substring. On a second failure, logs a warning and returns an empty
/// result; the raw text is always retained.
#[must_use]
pub fn parse_response(raw: &str) -> ExtractionResult {
    let trimmed = raw.trim();
    let candidate = extract_json_from_response(trimmed);

    let data = match serde_json::from_str::<Value>(candidate) {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!("failed to parse extraction response as JSON");
            return ExtractionResult { raw_response: raw.to_string(), ..ExtractionResult::default() };
        }
    };

    let Value::Object(root) = data else {
        tracing::warn!("extraction response JSON was not an object");
        return ExtractionResult { raw_response: raw.to_string(), ..ExtractionResult::default() };
    };

    let entities = root
        .get("entities")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(parse_entity).collect())
        .unwrap_or_default();

    let relations = root
        .get("relations")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(parse_relation).collect())
        .unwrap_or_default();

    let knowledge = root
        .get("knowledge")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(parse_knowledge).collect())
        .unwrap_or_default();

    let episodes = root
        .get("episodes")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(parse_episode).collect())
        .unwrap_or_default();

    let procedures = root
        .get("procedures")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(parse_procedure).collect())
        .unwrap_or_default();

    ExtractionResult {
        entities,
        relations,
        knowledge,
        episodes,
        procedures,
        raw_response: raw.to_string(),
    }
}

fn parse_entity(value: &Value) -> Option<ExtractedEntity> {
    let obj = value.as_object()?;
    let name = obj.get("name").and_then(Value::as_str)?.to_string();
    let entity_type = str_field(obj, "type", "concept");
    let facts = obj
        .get("facts")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(parse_fact).collect())
        .unwrap_or_default();
    Some(ExtractedEntity { name, entity_type, facts })
}

fn parse_relation(value: &Value) -> Option<ExtractedRelation> {
    let obj = value.as_object()?;
    let from_entity = obj.get("from").and_then(Value::as_str)?.to_string();
    let to_entity = obj.get("to").and_then(Value::as_str)?.to_string();
    let relation_type = str_field(obj, "type", "related_to");
    let description = str_field(obj, "description", "");
    Some(ExtractedRelation { from_entity, to_entity, relation_type, description })
}

fn parse_knowledge(value: &Value) -> Option<ExtractedKnowledge> {
    let obj = value.as_object()?;
    let entity = obj.get("entity").and_then(Value::as_str)?.to_string();
    let title = obj.get("title").and_then(Value::as_str)?.to_string();
    let knowledge_type = str_field(obj, "type", "insight");
    let content = str_field(obj, "content", "");
    let artifact = obj.get("artifact").and_then(Value::as_str).map(str::to_string);
    Some(ExtractedKnowledge { entity, knowledge_type, title, content, artifact })
}

fn parse_episode(value: &Value) -> Option<ExtractedEpisode> {
    let obj = value.as_object()?;
    let summary = obj.get("summary").and_then(Value::as_str)?.to_string();
    let context = str_field(obj, "context", "");
    let outcome = str_field(obj, "outcome", "");
    let participants = str_list(obj, "participants");
    let emotional_valence = str_field(obj, "emotional_valence", "neutral");
    let importance = obj
        .get("importance")
        .and_then(Value::as_f64)
        .map_or(0.5, |v| v.clamp(0.0, 1.0) as f32);
    let happened_at = normalize_date(obj.get("happened_at").and_then(Value::as_str));
    Some(ExtractedEpisode { summary, context, outcome, participants, emotional_valence, importance, happened_at })
}

fn parse_procedure(value: &Value) -> Option<ExtractedProcedure> {
    let obj = value.as_object()?;
    let name = obj.get("name").and_then(Value::as_str)?.to_string();
    let trigger = str_field(obj, "trigger", "");
    let entities = str_list(obj, "entities");
    let steps = obj
        .get("steps")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .enumerate()
                .filter_map(|(i, s)| {
                    let s = s.as_object()?;
                    let action = s.get("action").and_then(Value::as_str)?.to_string();
                    let step = s.get("step").and_then(Value::as_u64).map_or(i as u32 + 1, |v| v as u32);
                    let detail = s.get("detail").and_then(Value::as_str).map(str::to_string);
                    Some(ProcedureStep { step, action, detail })
                })
                .collect()
        })
        .unwrap_or_default();
    Some(ExtractedProcedure { name, trigger, steps, entities })
}
