//! Configuration management.
//!
//! A typed, environment-overridable configuration surface covering every
//! knob named in the persisted-state/configuration contract: vault path,
//! LLM provider settings, embedding provider settings, retrieval defaults,
//! and extraction defaults. Environment variables use a stable
//! `MENGRAM_`-prefixed naming scheme, mirroring the layered
//! config-then-env-override pattern.

use secrecy::SecretString;
use std::borrow::Cow;
use std::path::PathBuf;

/// Expands `${VAR_NAME}` references in a string against the process
/// environment. Unset variables are left untouched.
///
/// Uses `Cow<str>` to avoid allocation when no expansion is needed.
fn expand_env_vars(input: &str) -> Cow<'_, str> {
    if !input.contains("${") {
        return Cow::Borrowed(input);
    }

    let mut result = input.to_string();
    let mut start = 0;

    while let Some(var_start) = result[start..].find("${") {
        let var_start = start + var_start;
        let Some(var_end) = result[var_start..].find('}') else {
            break;
        };
        let var_end = var_start + var_end;
        let var_name = &result[var_start + 2..var_end];

        if let Ok(value) = std::env::var(var_name) {
            result.replace_range(var_start..=var_end, &value);
            start = var_start + value.len();
        } else {
            start = var_end + 1;
        }
    }

    Cow::Owned(result)
}

/// Top-level configuration for a `Memory` instance.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Root directory under which every tenant gets a subdirectory vault.
    pub vault_path: PathBuf,
    /// LLM adapter configuration.
    pub llm: LlmConfig,
    /// Embedding adapter configuration.
    pub embedding: EmbeddingConfig,
    /// Hybrid retrieval defaults.
    pub retrieval: RetrievalConfig,
    /// Extraction orchestrator defaults.
    pub extraction: ExtractionConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            vault_path: default_vault_path(),
            llm: LlmConfig::default(),
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
            extraction: ExtractionConfig::default(),
        }
    }
}

impl MemoryConfig {
    /// Loads configuration from defaults with environment overrides applied.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Applies `MENGRAM_`-prefixed environment variable overrides.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(path) = std::env::var("MENGRAM_VAULT_PATH") {
            self.vault_path = PathBuf::from(expand_env_vars(&path).into_owned());
        }
        self.llm = self.llm.with_env_overrides();
        self.embedding = self.embedding.with_env_overrides();
        self.retrieval = self.retrieval.with_env_overrides();
        self.extraction = self.extraction.with_env_overrides();
        self
    }
}

/// Returns the platform default vault directory (`<data dir>/mengram/vault`).
fn default_vault_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "mengram")
        .map(|dirs| dirs.data_dir().join("vault"))
        .unwrap_or_else(|| PathBuf::from("./vault"))
}

/// Which LLM provider to use. Mirrors §4.2's three variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProviderKind {
    /// Hosted API A - Anthropic Claude.
    Anthropic,
    /// Hosted API B - `OpenAI` GPT.
    OpenAi,
    /// Local HTTP - Ollama.
    Ollama,
}

impl LlmProviderKind {
    fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "openai" => Self::OpenAi,
            "ollama" => Self::Ollama,
            _ => Self::Anthropic,
        }
    }
}

/// LLM adapter configuration.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Which provider to dispatch to.
    pub provider: LlmProviderKind,
    /// API key, if the provider requires one. Wrapped so it never leaks
    /// into `Debug` output.
    pub api_key: Option<SecretString>,
    /// Model identifier.
    pub model: String,
    /// Base URL override (used by Ollama, optionally by others).
    pub base_url: Option<String>,
    /// Request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Maximum retries for ingestion-path calls (§5 retry policy).
    pub max_retries: u32,
    /// Backoff steps in milliseconds, one per retry attempt.
    pub backoff_ms: Vec<u64>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProviderKind::Anthropic,
            api_key: std::env::var("ANTHROPIC_API_KEY").ok().map(Into::into),
            model: "claude-sonnet-4-20250514".to_string(),
            base_url: None,
            timeout_ms: 30_000,
            max_retries: 3,
            backoff_ms: vec![10_000, 20_000, 30_000],
        }
    }
}

impl LlmConfig {
    /// Applies `MENGRAM_LLM_*` environment variable overrides.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(provider) = std::env::var("MENGRAM_LLM_PROVIDER") {
            self.provider = LlmProviderKind::parse(&provider);
        }
        if let Ok(key) = std::env::var("MENGRAM_LLM_API_KEY") {
            self.api_key = Some(key.into());
        }
        if let Ok(model) = std::env::var("MENGRAM_LLM_MODEL") {
            self.model = model;
        }
        if let Ok(url) = std::env::var("MENGRAM_LLM_BASE_URL") {
            self.base_url = Some(url);
        }
        if let Some(timeout) = env_u64("MENGRAM_LLM_TIMEOUT_MS") {
            self.timeout_ms = timeout;
        }
        if let Some(retries) = env_u32("MENGRAM_LLM_MAX_RETRIES") {
            self.max_retries = retries;
        }
        self
    }
}

/// Embedding adapter configuration.
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    /// Provider name (free-form; the `HttpEmbedder` is OpenAI-shaped by default).
    pub provider: String,
    /// API key, if required.
    pub api_key: Option<SecretString>,
    /// Output vector dimensionality.
    pub dimensions: usize,
    /// Request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Maximum retries (§4.1: up to 2).
    pub max_retries: u32,
    /// Linear backoff steps in milliseconds.
    pub backoff_ms: Vec<u64>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            api_key: std::env::var("OPENAI_API_KEY").ok().map(Into::into),
            dimensions: 1536,
            timeout_ms: 30_000,
            max_retries: 2,
            backoff_ms: vec![1_000, 2_000],
        }
    }
}

impl EmbeddingConfig {
    /// Applies `MENGRAM_EMBEDDINGS_*` environment variable overrides.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(provider) = std::env::var("MENGRAM_EMBEDDINGS_PROVIDER") {
            self.provider = provider;
        }
        if let Ok(key) = std::env::var("MENGRAM_EMBEDDINGS_API_KEY") {
            self.api_key = Some(key.into());
        }
        if let Some(dims) = env_usize("MENGRAM_EMBEDDINGS_DIMENSIONS") {
            self.dimensions = dims;
        }
        self
    }
}

/// Hybrid retrieval defaults (§4.8, §6.4).
#[derive(Debug, Clone, Copy)]
pub struct RetrievalConfig {
    /// Default number of vector matches to retrieve.
    pub top_k: usize,
    /// Minimum cosine-similarity score for a vector match to count.
    pub min_score: f32,
    /// Default graph expansion depth.
    pub graph_depth: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_score: 0.15,
            graph_depth: 1,
        }
    }
}

impl RetrievalConfig {
    /// Applies `MENGRAM_RETRIEVAL_*` environment variable overrides.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(top_k) = env_usize("MENGRAM_RETRIEVAL_TOP_K") {
            self.top_k = top_k;
        }
        if let Ok(v) = std::env::var("MENGRAM_RETRIEVAL_MIN_SCORE") {
            if let Ok(parsed) = v.parse::<f32>() {
                self.min_score = parsed;
            }
        }
        if let Some(depth) = env_usize("MENGRAM_RETRIEVAL_GRAPH_DEPTH") {
            self.graph_depth = depth;
        }
        self
    }
}

/// Extraction orchestrator defaults (§4.7, §5, §6.4).
#[derive(Debug, Clone, Copy)]
pub struct ExtractionConfig {
    /// Chunk size in characters for the markdown codec (§4.3).
    pub chunk_size: usize,
    /// Shared token-bucket rate limit, requests per minute (§5).
    pub rate_per_minute: u32,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            rate_per_minute: 100,
        }
    }
}

impl ExtractionConfig {
    /// Applies `MENGRAM_EXTRACTION_*` environment variable overrides.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(size) = env_usize("MENGRAM_EXTRACTION_CHUNK_SIZE") {
            self.chunk_size = size;
        }
        if let Some(rate) = env_u32("MENGRAM_EXTRACTION_RATE_PER_MINUTE") {
            self.rate_per_minute = rate;
        }
        self
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_u32(name: &str) -> Option<u32> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = MemoryConfig::default();
        assert_eq!(config.retrieval.top_k, 5);
        assert!((config.retrieval.min_score - 0.15).abs() < f32::EPSILON);
        assert_eq!(config.retrieval.graph_depth, 1);
        assert_eq!(config.extraction.chunk_size, 500);
        assert_eq!(config.extraction.rate_per_minute, 100);
        assert_eq!(config.embedding.dimensions, 1536);
        assert_eq!(config.llm.max_retries, 3);
        assert_eq!(config.embedding.max_retries, 2);
    }

    #[test]
    fn test_expand_env_vars_no_pattern() {
        assert_eq!(expand_env_vars("plain text"), "plain text");
    }

    #[test]
    fn test_expand_env_vars_missing_var_preserved() {
        let expanded = expand_env_vars("${MENGRAM_DEFINITELY_UNSET_VAR_XYZ}");
        assert_eq!(expanded, "${MENGRAM_DEFINITELY_UNSET_VAR_XYZ}");
    }

    #[test]
    fn test_provider_kind_parse() {
        assert_eq!(LlmProviderKind::parse("openai"), LlmProviderKind::OpenAi);
        assert_eq!(LlmProviderKind::parse("OLLAMA"), LlmProviderKind::Ollama);
        assert_eq!(
            LlmProviderKind::parse("anything-else"),
            LlmProviderKind::Anthropic
        );
    }
}
