//! LLM client abstraction.
//!
//! Provides a unified interface over the three providers named in the
//! adapter contract (§4.2): Anthropic Claude, `OpenAI` GPT, and Ollama
//! (local). Extraction prompts run at temperature 0; every call is a single
//! round trip, no streaming.
//!
//! # Supported providers
//!
//! | Provider | Client | Environment variables |
//! |----------|--------|------------------------|
//! | Anthropic | [`AnthropicClient`] | `ANTHROPIC_API_KEY` |
//! | `OpenAI` | [`OpenAiClient`] | `OPENAI_API_KEY` |
//! | Ollama | [`OllamaClient`] | `OLLAMA_HOST`, `OLLAMA_MODEL` |
//!
//! # Example
//!
//! ```rust,ignore
//! use mengram::llm::{LlmProvider, AnthropicClient};
//!
//! let client = AnthropicClient::new();
//! let response = client.complete("Say hello", "")?;
//! println!("{response}");
//! ```

mod anthropic;
mod ollama;
mod openai;
mod resilience;

pub use anthropic::AnthropicClient;
pub use ollama::OllamaClient;
pub use openai::OpenAiClient;
pub use resilience::ResilientLlmProvider;

use crate::config::{LlmConfig, LlmProviderKind};
use crate::{Error, Result};
use std::time::Duration;

/// Trait implemented by every LLM provider adapter.
///
/// Every provider implements `complete`; `chat` has a uniform default that
/// finds the last `user`-role message and delegates to `complete`. Only
/// providers whose wire protocol has genuine multi-turn framing (all three
/// built-in ones do) override it to send the full transcript.
pub trait LlmProvider: Send + Sync {
    /// The provider name, e.g. `"anthropic"`.
    fn name(&self) -> &'static str;

    /// Generates a completion for a single prompt, with an optional system
    /// instruction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LlmError`] if the request fails or the provider
    /// returns a non-success status after retries are exhausted.
    fn complete(&self, prompt: &str, system: &str) -> Result<String>;

    /// Generates a completion for a multi-turn conversation.
    ///
    /// Default implementation: find the last message with role `user` and
    /// delegate to [`Self::complete`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::LlmError`] under the same conditions as `complete`.
    fn chat(&self, messages: &[ChatMessage], system: &str) -> Result<String> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map_or("", |m| m.content.as_str());
        self.complete(last_user, system)
    }
}

/// A single message in a multi-turn conversation.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    /// Role: `"user"`, `"assistant"`, or `"system"`.
    pub role: String,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// Builds a user-role message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    /// Builds an assistant-role message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// HTTP client configuration for LLM providers.
#[derive(Debug, Clone, Copy)]
pub struct LlmHttpConfig {
    /// Request timeout in milliseconds (0 to disable).
    pub timeout_ms: u64,
    /// Connect timeout in milliseconds (0 to disable).
    pub connect_timeout_ms: u64,
}

impl Default for LlmHttpConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            connect_timeout_ms: 3_000,
        }
    }
}

impl LlmHttpConfig {
    /// Derives HTTP timeouts from a [`LlmConfig`].
    #[must_use]
    pub fn from_config(config: &LlmConfig) -> Self {
        Self {
            timeout_ms: config.timeout_ms,
            ..Self::default()
        }
    }
}

/// Builds a blocking HTTP client for LLM requests with configured timeouts.
#[must_use]
pub fn build_http_client(config: LlmHttpConfig) -> reqwest::blocking::Client {
    let mut builder = reqwest::blocking::Client::builder();
    if config.timeout_ms > 0 {
        builder = builder.timeout(Duration::from_millis(config.timeout_ms));
    }
    if config.connect_timeout_ms > 0 {
        builder = builder.connect_timeout(Duration::from_millis(config.connect_timeout_ms));
    }

    builder.build().unwrap_or_else(|err| {
        tracing::warn!("failed to build LLM HTTP client: {err}");
        reqwest::blocking::Client::new()
    })
}

/// Builds an [`LlmProvider`] from configuration, dispatching on the
/// configured provider kind (§4.2, mirroring the reference factory's
/// `create_llm_client`).
///
/// # Errors
///
/// Returns [`Error::ConfigError`] if the selected provider requires an API
/// key and none is configured.
pub fn create_llm_client(config: &LlmConfig) -> Result<Box<dyn LlmProvider>> {
    match config.provider {
        LlmProviderKind::Anthropic => {
            let api_key = config
                .api_key
                .as_ref()
                .ok_or_else(|| Error::ConfigError("ANTHROPIC_API_KEY not set".to_string()))?;
            let mut client = AnthropicClient::new()
                .with_api_key(secrecy::ExposeSecret::expose_secret(api_key))
                .with_model(&config.model)
                .with_http_config(LlmHttpConfig::from_config(config));
            if let Some(base_url) = &config.base_url {
                client = client.with_endpoint(base_url);
            }
            Ok(Box::new(client))
        }
        LlmProviderKind::OpenAi => {
            let api_key = config
                .api_key
                .as_ref()
                .ok_or_else(|| Error::ConfigError("OPENAI_API_KEY not set".to_string()))?;
            let mut client = OpenAiClient::new()
                .with_api_key(secrecy::ExposeSecret::expose_secret(api_key))
                .with_model(&config.model)
                .with_http_config(LlmHttpConfig::from_config(config));
            if let Some(base_url) = &config.base_url {
                client = client.with_endpoint(base_url);
            }
            Ok(Box::new(client))
        }
        LlmProviderKind::Ollama => {
            let mut client =
                OllamaClient::new().with_http_config(LlmHttpConfig::from_config(config));
            if config.model != LlmConfig::default().model {
                client = client.with_model(&config.model);
            }
            if let Some(base_url) = &config.base_url {
                client = client.with_base_url(base_url);
            }
            Ok(Box::new(client))
        }
    }
}

pub(crate) fn sanitize_llm_response_for_error(response: &str) -> String {
    const MAX_CHARS: usize = 200;
    let trimmed = response.trim();
    if trimmed.chars().count() > MAX_CHARS {
        let truncated: String = trimmed.chars().take(MAX_CHARS).collect();
        format!("{truncated}...(truncated)")
    } else {
        trimmed.to_string()
    }
}

/// Extracts JSON from an LLM response, handling markdown code fences and
/// prose wrapped around the payload.
///
/// Order of attempts:
/// 1. ` ```json ... ``` ` fenced block
/// 2. ` ``` ... ``` ` fenced block (language marker skipped if present)
/// 3. Raw object: first `{` to last `}`
/// 4. Raw array: first `[` to last `]`
/// 5. The trimmed input, unchanged
#[must_use]
pub fn extract_json_from_response(response: &str) -> &str {
    let trimmed = response.trim();

    if let Some((json_start, end)) = trimmed.find("```json").and_then(|start| {
        let json_start = start + 7;
        trimmed[json_start..]
            .find("```")
            .map(|end| (json_start, end))
    }) {
        return trimmed[json_start..json_start + end].trim();
    }

    if let Some((json_start, end)) = trimmed.find("```").and_then(|start| {
        let content_start = start + 3;
        let after_marker = &trimmed[content_start..];
        let json_start = after_marker
            .find('{')
            .map_or(content_start, |pos| content_start + pos);
        trimmed[json_start..]
            .find("```")
            .map(|end| (json_start, end))
    }) {
        return trimmed[json_start..json_start + end].trim();
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            return &trimmed[start..=end];
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('['), trimmed.rfind(']')) {
        if start < end {
            return &trimmed[start..=end];
        }
    }

    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_raw() {
        let response = r#"{"key": "value"}"#;
        assert_eq!(extract_json_from_response(response), r#"{"key": "value"}"#);
    }

    #[test]
    fn test_extract_json_markdown_fence() {
        let response = "```json\n{\"key\": \"value\"}\n```";
        let json = extract_json_from_response(response);
        assert!(json.contains("\"key\""));
    }

    #[test]
    fn test_extract_json_with_surrounding_prose() {
        let response = "Here is the result: {\"key\": \"value\"} hope this helps";
        assert_eq!(extract_json_from_response(response), r#"{"key": "value"}"#);
    }

    #[test]
    fn test_extract_json_array() {
        let response = r#"["a", "b"]"#;
        assert_eq!(extract_json_from_response(response), r#"["a", "b"]"#);
    }

    #[test]
    fn test_chat_message_builders() {
        let msg = ChatMessage::user("hello");
        assert_eq!(msg.role, "user");
        assert_eq!(msg.content, "hello");
    }
}
