//! Anthropic Claude client.

use super::{LlmHttpConfig, LlmProvider, build_http_client, sanitize_llm_response_for_error};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Anthropic Claude LLM client.
pub struct AnthropicClient {
    api_key: Option<String>,
    endpoint: String,
    model: String,
    client: reqwest::blocking::Client,
}

impl AnthropicClient {
    /// Default API endpoint.
    pub const DEFAULT_ENDPOINT: &'static str = "https://api.anthropic.com/v1";

    /// Default model, matching the extraction orchestrator's default.
    pub const DEFAULT_MODEL: &'static str = "claude-sonnet-4-20250514";

    /// Creates a new client, reading `ANTHROPIC_API_KEY` from the environment.
    #[must_use]
    pub fn new() -> Self {
        Self {
            api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            endpoint: Self::DEFAULT_ENDPOINT.to_string(),
            model: Self::DEFAULT_MODEL.to_string(),
            client: build_http_client(LlmHttpConfig::default()),
        }
    }

    /// Sets the API key.
    #[must_use]
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Sets the API endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Sets the model.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Overrides the HTTP client's timeouts.
    #[must_use]
    pub fn with_http_config(mut self, config: LlmHttpConfig) -> Self {
        self.client = build_http_client(config);
        self
    }

    fn request(&self, messages: Vec<Message>, system: &str) -> Result<String> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| Error::LlmError("ANTHROPIC_API_KEY not set".to_string()))?;

        let system = if system.is_empty() {
            "You are a knowledge extraction assistant."
        } else {
            system
        };

        let request = MessagesRequest {
            model: self.model.clone(),
            max_tokens: 4096,
            system: system.to_string(),
            messages,
        };

        let response = self
            .client
            .post(format!("{}/messages", self.endpoint))
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .map_err(|e| Error::LlmError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(Error::LlmError(format!(
                "anthropic API returned {status}: {}",
                sanitize_llm_response_for_error(&body)
            )));
        }

        let body: MessagesResponse = response
            .json()
            .map_err(|e| Error::LlmError(format!("invalid anthropic response: {e}")))?;

        body.content
            .into_iter()
            .find(|block| block.block_type == "text")
            .map(|block| block.text)
            .ok_or_else(|| Error::LlmError("no text content in anthropic response".to_string()))
    }
}

impl Default for AnthropicClient {
    fn default() -> Self {
        Self::new()
    }
}

impl LlmProvider for AnthropicClient {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn complete(&self, prompt: &str, system: &str) -> Result<String> {
        let messages = vec![Message {
            role: "user".to_string(),
            content: prompt.to_string(),
        }];
        self.request(messages, system)
    }

    fn chat(&self, messages: &[super::ChatMessage], system: &str) -> Result<String> {
        let mapped = messages
            .iter()
            .map(|m| Message {
                role: m.role.clone(),
                content: m.content.clone(),
            })
            .collect();
        self.request(mapped, system)
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    system: String,
    messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_defaults() {
        let client = AnthropicClient {
            api_key: None,
            endpoint: AnthropicClient::DEFAULT_ENDPOINT.to_string(),
            model: AnthropicClient::DEFAULT_MODEL.to_string(),
            client: reqwest::blocking::Client::new(),
        };
        assert_eq!(client.name(), "anthropic");
        assert_eq!(client.model, AnthropicClient::DEFAULT_MODEL);
    }

    #[test]
    fn test_client_configuration() {
        let client = AnthropicClient::new()
            .with_api_key("test-key")
            .with_endpoint("https://custom.endpoint")
            .with_model("claude-3-opus-20240229");

        assert_eq!(client.api_key, Some("test-key".to_string()));
        assert_eq!(client.endpoint, "https://custom.endpoint");
        assert_eq!(client.model, "claude-3-opus-20240229");
    }

    #[test]
    fn test_request_fails_without_key() {
        let client = AnthropicClient {
            api_key: None,
            endpoint: AnthropicClient::DEFAULT_ENDPOINT.to_string(),
            model: AnthropicClient::DEFAULT_MODEL.to_string(),
            client: reqwest::blocking::Client::new(),
        };
        let result = client.complete("hello", "");
        assert!(result.is_err());
    }
}
