//! # Mengram
//!
//! A long-term memory service for conversational AI: conversations and free
//! text are turned into a typed, cross-linked knowledge graph backed by
//! human-readable markdown notes on disk, and retrieval queries are answered
//! by fusing dense-vector similarity search with graph traversal.
//!
//! ## Features
//!
//! - Per-tenant vaults of plain markdown notes (can be opened in any editor)
//! - LLM-driven extraction of entities, facts, relations, episodes, procedures
//! - A derived knowledge graph and vector index, rebuilt lazily from the vault
//! - A hybrid retriever that assembles vector matches with graph expansion
//!   into a single natural-language context string
//!
//! ## Example
//!
//! ```rust,ignore
//! use mengram::{Memory, MemoryConfig};
//!
//! let memory = Memory::new(MemoryConfig::default())?;
//! memory.add("I work at Uzum Bank, backend on Spring Boot", "ali")?;
//! for row in memory.search("where does ali work?", "ali", 5)? {
//!     println!("{} (score {:.2}): {}", row.memory.name, row.score, row.context);
//! }
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

use thiserror::Error as ThisError;

pub mod brain;
pub mod cli;
pub mod config;
pub mod dedup;
pub mod embedding;
pub mod extraction;
pub mod graph;
pub mod llm;
pub mod markdown;
pub mod memory;
pub mod observability;
pub mod ratelimit;
pub mod retrieval;
pub mod vault;
pub mod vector;

pub use brain::Brain;
pub use config::{EmbeddingConfig, LlmConfig, MemoryConfig, RetrievalConfig};
pub use embedding::Embedder;
pub use llm::LlmProvider;
pub use memory::{Memory, MemoryItem, SearchResultRow};

/// Error type for mengram operations.
///
/// Uses `thiserror` for automatic `Display` and `Error` trait implementations.
///
/// # Error variant triggers
///
/// | Variant | Raised when |
/// |---------|-------------|
/// | `ConfigError` | Bad configuration, missing credentials |
/// | `LlmError` | LLM adapter HTTP failure after retries exhausted |
/// | `EmbeddingError` | Embedding adapter HTTP failure after retries exhausted |
/// | `IoError` | Vault read/write failure |
/// | `ParseError` | A note on disk could not be parsed |
/// | `NotFoundError` | Entity or tenant absent |
/// | `ExtractionError` | LLM response could not be parsed as the extraction schema |
#[derive(Debug, ThisError)]
pub enum Error {
    /// Bad configuration or missing credentials.
    ///
    /// Raised when a required configuration value is absent (e.g. no API
    /// key for the configured LLM/embedding provider) or a configured value
    /// is out of range.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// The LLM adapter failed after exhausting its retry budget.
    #[error("LLM request failed: {0}")]
    LlmError(String),

    /// The embedding adapter failed after exhausting its retry budget.
    #[error("embedding request failed: {0}")]
    EmbeddingError(String),

    /// A filesystem operation on the vault failed.
    #[error("vault I/O error: {0}")]
    IoError(String),

    /// A note on disk could not be parsed into its expected shape.
    #[error("parse error: {0}")]
    ParseError(String),

    /// The requested entity or tenant does not exist.
    #[error("not found: {0}")]
    NotFoundError(String),

    /// The LLM's extraction response could not be parsed as JSON after the
    /// defensive fallback. This variant is caught internally by the
    /// extraction orchestrator and degraded to an empty result with a
    /// logged warning. Not meant to propagate to callers, but kept as part
    /// of the error taxonomy for completeness and for direct testing of
    /// the orchestrator's parser.
    #[error("extraction parse error: {0}")]
    ExtractionError(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

/// Result type alias for mengram operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Returns the current timestamp formatted as `YYYY-MM-DD HH:MM` (UTC),
/// the stable timestamp format used throughout note front matter (§3.5).
#[must_use]
pub fn now_stamp() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M").to_string()
}

/// Returns today's date formatted as `YYYY-MM-DD` (UTC), used for knowledge
/// entry dates.
#[must_use]
pub fn today_stamp() -> String {
    chrono::Utc::now().format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::ConfigError("missing vault_path".to_string());
        assert_eq!(err.to_string(), "configuration error: missing vault_path");

        let err = Error::NotFoundError("PostgreSQL".to_string());
        assert_eq!(err.to_string(), "not found: PostgreSQL");
    }

    #[test]
    fn test_now_stamp_format() {
        let stamp = now_stamp();
        assert_eq!(stamp.len(), 16);
        assert_eq!(stamp.as_bytes()[4], b'-');
        assert_eq!(stamp.as_bytes()[10], b' ');
    }
}
