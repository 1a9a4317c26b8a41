//! Markdown codec for vault notes.
//!
//! Parses a note into front matter plus an ordered list of sections, pulls
//! out wikilinks and inline tags, and chunks section bodies into
//! vector-index-sized pieces. Serialization re-assembles a note from
//! sections in a stable order, appending new items to the matching section
//! (creating it if absent) rather than rewriting the whole file.
//!
//! Regex semantics are considered part of the persistence contract and must
//! not drift: see [`FRONTMATTER_RE`], [`WIKILINK_RE`], [`HEADING_RE`],
//! [`TAG_RE`] (§4.3).

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

/// Matches a leading YAML front-matter block.
static FRONTMATTER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^---\n(.*?)\n---\n").expect("valid regex"));

/// Matches `[[target]]` or `[[target|alias]]`.
static WIKILINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\[([^\]|]+)(?:\|([^\]]+))?\]\]").expect("valid regex"));

/// Matches a markdown heading line, levels 1 through 6.
static HEADING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^(#{1,6})\s+(.+)$").expect("valid regex"));

/// Matches an inline `#tag`, excluding headings (which start a line with `#`
/// followed by a space, not a tag character).
static TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|\s)#([A-Za-z][\w\-/]*)").expect("valid regex"));

/// Number of characters of surrounding context captured around a wikilink.
const WIKILINK_CONTEXT_RADIUS: usize = 80;

/// Target chunk size in characters for the vector index.
const DEFAULT_CHUNK_SIZE: usize = 500;

/// A `[[target]]` or `[[target|alias]]` wikilink, with surrounding context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WikiLink {
    /// The link target (canonical entity name).
    pub target: String,
    /// Optional display alias.
    pub alias: Option<String>,
    /// Up to 80 characters of text on either side of the link.
    pub context: String,
}

/// A document section: a heading and the text beneath it, up to the next
/// heading of any level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    /// Section title. `"(root)"` or `"(intro)"` for headingless content.
    pub title: String,
    /// Heading level, 1-6. 0 for synthetic root/intro sections.
    pub level: u8,
    /// Section body, trimmed.
    pub content: String,
}

/// A chunk of text sized for the vector index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    /// Chunk text, prefixed with its section title unless the section is a
    /// synthetic root/intro.
    pub content: String,
    /// Title of the section this chunk was drawn from.
    pub section: String,
    /// Position of this chunk within the document, 0-indexed.
    pub position: usize,
}

/// Result of parsing one note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedNote {
    /// Front matter as a string-keyed map (values kept as their YAML scalar
    /// text; the vault layer interprets specific keys).
    pub frontmatter: BTreeMap<String, String>,
    /// Tags gathered from front matter and inline `#tags`, deduplicated and
    /// sorted.
    pub tags: Vec<String>,
    /// Wikilinks found in the body, in document order.
    pub wikilinks: Vec<WikiLink>,
    /// Sections, in document order.
    pub sections: Vec<Section>,
    /// Chunks derived from sections, in document order.
    pub chunks: Vec<TextChunk>,
}

/// Splits raw note content into front matter and body.
///
/// Front matter values are returned as raw strings; a `tags:` key uses a
/// comma-joined form if the source was a YAML list.
#[must_use]
pub fn parse_frontmatter(content: &str) -> (BTreeMap<String, String>, &str) {
    let Some(captures) = FRONTMATTER_RE.captures(content) else {
        return (BTreeMap::new(), content);
    };

    let block = captures.get(1).map_or("", |m| m.as_str());
    let body_start = captures.get(0).map_or(0, |m| m.end());
    let metadata = parse_frontmatter_block(block);

    (metadata, &content[body_start..])
}

/// Parses a YAML front-matter block into a flat string map.
///
/// Accepts the subset of YAML the vault writer emits: `key: value` scalars
/// and `key: [a, b, c]` flow lists. Anything else is skipped rather than
/// failing the whole parse.
fn parse_frontmatter_block(block: &str) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();
    for line in block.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() {
            continue;
        }
        let value = if let Some(inner) = value.strip_prefix('[').and_then(|v| v.strip_suffix(']'))
        {
            inner
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(", ")
        } else {
            value.to_string()
        };
        metadata.insert(key.to_string(), value);
    }
    metadata
}

/// Extracts every wikilink in `content`, with context.
#[must_use]
pub fn extract_wikilinks(content: &str) -> Vec<WikiLink> {
    WIKILINK_RE
        .captures_iter(content)
        .map(|captures| {
            let full = captures.get(0).expect("full match always present");
            let target = captures.get(1).map_or("", |m| m.as_str()).trim();
            let alias = captures
                .get(2)
                .map(|m| m.as_str().trim().to_string())
                .filter(|s| !s.is_empty());

            let start = full.start().saturating_sub(WIKILINK_CONTEXT_RADIUS);
            let end = (full.end() + WIKILINK_CONTEXT_RADIUS).min(content.len());
            let context = content[floor_char_boundary(content, start)..ceil_char_boundary(content, end)]
                .replace('\n', " ")
                .trim()
                .to_string();

            WikiLink {
                target: target.to_string(),
                alias,
                context,
            }
        })
        .collect()
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_char_boundary(s: &str, mut index: usize) -> usize {
    while index < s.len() && !s.is_char_boundary(index) {
        index += 1;
    }
    index
}

/// Extracts tags from front matter's `tags` key and inline `#tags` in the
/// body, deduplicated and sorted.
#[must_use]
pub fn extract_tags(content: &str, frontmatter: &BTreeMap<String, String>) -> Vec<String> {
    let mut tags: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();

    if let Some(raw) = frontmatter.get("tags") {
        for tag in raw.split(',') {
            let tag = tag.trim();
            if !tag.is_empty() {
                tags.insert(tag.to_string());
            }
        }
    }

    for captures in TAG_RE.captures_iter(content) {
        if let Some(tag) = captures.get(1) {
            tags.insert(tag.as_str().to_string());
        }
    }

    tags.into_iter().collect()
}

/// Splits a note body into sections by heading.
#[must_use]
pub fn extract_sections(content: &str) -> Vec<Section> {
    let headings: Vec<_> = HEADING_RE.captures_iter(content).collect();

    if headings.is_empty() {
        let trimmed = content.trim();
        return if trimmed.is_empty() {
            Vec::new()
        } else {
            vec![Section {
                title: "(root)".to_string(),
                level: 0,
                content: trimmed.to_string(),
            }]
        };
    }

    let mut sections = Vec::new();

    let first_start = headings[0].get(0).expect("full match").start();
    let pre_heading = content[..first_start].trim();
    if !pre_heading.is_empty() {
        sections.push(Section {
            title: "(intro)".to_string(),
            level: 0,
            content: pre_heading.to_string(),
        });
    }

    for (i, heading) in headings.iter().enumerate() {
        let full = heading.get(0).expect("full match");
        let level = heading.get(1).map_or(0, |m| m.as_str().len()) as u8;
        let title = heading.get(2).map_or("", |m| m.as_str()).trim().to_string();

        let start = full.end();
        let end = headings
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(content.len(), |m| m.start());

        let body = content[start..end].trim().to_string();
        sections.push(Section {
            title,
            level,
            content: body,
        });
    }

    sections
}

/// Splits sections into chunks of roughly `chunk_size` characters, falling
/// back to paragraph splits for oversize sections. Never hard-splits an
/// oversize paragraph mid-word; a single paragraph larger than `chunk_size`
/// becomes its own chunk.
#[must_use]
pub fn create_chunks(sections: &[Section], chunk_size: usize) -> Vec<TextChunk> {
    let mut chunks = Vec::new();
    let mut position = 0;

    for section in sections {
        if section.content.is_empty() {
            continue;
        }

        if section.content.chars().count() <= chunk_size {
            let text = if section.title == "(root)" || section.title == "(intro)" {
                section.content.clone()
            } else {
                format!("{}: {}", section.title, section.content)
            };
            chunks.push(TextChunk {
                content: text,
                section: section.title.clone(),
                position,
            });
            position += 1;
            continue;
        }

        let paragraphs: Vec<&str> = split_paragraphs(&section.content);
        let mut current = String::new();

        for paragraph in paragraphs {
            let paragraph = paragraph.trim();
            if paragraph.is_empty() {
                continue;
            }

            if !current.is_empty() && current.chars().count() + paragraph.chars().count() > chunk_size
            {
                chunks.push(TextChunk {
                    content: current.trim().to_string(),
                    section: section.title.clone(),
                    position,
                });
                position += 1;
                current = paragraph.to_string();
            } else if current.is_empty() {
                current = paragraph.to_string();
            } else {
                current.push_str("\n\n");
                current.push_str(paragraph);
            }
        }

        if !current.trim().is_empty() {
            chunks.push(TextChunk {
                content: current.trim().to_string(),
                section: section.title.clone(),
                position,
            });
            position += 1;
        }
    }

    chunks
}

fn split_paragraphs(content: &str) -> Vec<&str> {
    static PARAGRAPH_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"\n\s*\n").expect("valid regex"));
    PARAGRAPH_RE.split(content).collect()
}

/// Parses a complete note from its raw disk content.
#[must_use]
pub fn parse_note(content: &str) -> ParsedNote {
    let (frontmatter, body) = parse_frontmatter(content);
    let wikilinks = extract_wikilinks(body);
    let tags = extract_tags(body, &frontmatter);
    let sections = extract_sections(body);
    let chunks = create_chunks(&sections, DEFAULT_CHUNK_SIZE);

    ParsedNote {
        frontmatter,
        tags,
        wikilinks,
        sections,
        chunks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frontmatter_extracts_block() {
        let content = "---\ntype: entity\ncreated: 2026-01-01\n---\nbody text";
        let (fm, body) = parse_frontmatter(content);
        assert_eq!(fm.get("type"), Some(&"entity".to_string()));
        assert_eq!(body, "body text");
    }

    #[test]
    fn test_parse_frontmatter_absent() {
        let content = "just a plain note";
        let (fm, body) = parse_frontmatter(content);
        assert!(fm.is_empty());
        assert_eq!(body, content);
    }

    #[test]
    fn test_extract_wikilinks_with_alias() {
        let content = "See [[PostgreSQL|the database]] for details.";
        let links = extract_wikilinks(content);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].target, "PostgreSQL");
        assert_eq!(links[0].alias.as_deref(), Some("the database"));
    }

    #[test]
    fn test_extract_wikilinks_without_alias() {
        let links = extract_wikilinks("Uses [[Redis]] for caching.");
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].target, "Redis");
        assert_eq!(links[0].alias, None);
    }

    #[test]
    fn test_extract_tags_from_frontmatter_and_inline() {
        let mut fm = BTreeMap::new();
        fm.insert("tags".to_string(), "backend, rust".to_string());
        let tags = extract_tags("Some #database and #rust notes.", &fm);
        assert!(tags.contains(&"backend".to_string()));
        assert!(tags.contains(&"rust".to_string()));
        assert!(tags.contains(&"database".to_string()));
    }

    #[test]
    fn test_extract_sections_splits_by_heading() {
        let content = "# Facts\n\nfact one\n\n## Relations\n\nrelation one";
        let sections = extract_sections(content);
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].title, "Facts");
        assert_eq!(sections[0].level, 1);
        assert_eq!(sections[1].title, "Relations");
        assert_eq!(sections[1].level, 2);
    }

    #[test]
    fn test_extract_sections_no_headings_becomes_root() {
        let sections = extract_sections("just some text");
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].title, "(root)");
    }

    #[test]
    fn test_create_chunks_small_section_is_one_chunk() {
        let sections = vec![Section {
            title: "Facts".to_string(),
            level: 1,
            content: "short fact".to_string(),
        }];
        let chunks = create_chunks(&sections, 500);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "Facts: short fact");
    }

    #[test]
    fn test_create_chunks_never_hard_splits_oversize_paragraph() {
        let big_paragraph = "x".repeat(1000);
        let sections = vec![Section {
            title: "Knowledge".to_string(),
            level: 1,
            content: big_paragraph.clone(),
        }];
        let chunks = create_chunks(&sections, 500);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].content.contains(&big_paragraph));
    }

    #[test]
    fn test_create_chunks_splits_long_section_by_paragraph() {
        let para_a = "a".repeat(300);
        let para_b = "b".repeat(300);
        let sections = vec![Section {
            title: "Knowledge".to_string(),
            level: 1,
            content: format!("{para_a}\n\n{para_b}"),
        }];
        let chunks = create_chunks(&sections, 500);
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn test_parse_note_end_to_end() {
        let content = "---\ntype: entity\n---\n# Facts\n\nWorks with [[PostgreSQL]] #database";
        let note = parse_note(content);
        assert_eq!(note.frontmatter.get("type"), Some(&"entity".to_string()));
        assert_eq!(note.wikilinks.len(), 1);
        assert!(note.tags.contains(&"database".to_string()));
        assert_eq!(note.sections.len(), 1);
        assert_eq!(note.sections[0].title, "Facts");
    }
}
