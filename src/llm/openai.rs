//! `OpenAI` GPT client.

use super::{LlmHttpConfig, LlmProvider, build_http_client, sanitize_llm_response_for_error};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// `OpenAI`-compatible chat completions client.
pub struct OpenAiClient {
    api_key: Option<String>,
    endpoint: String,
    model: String,
    client: reqwest::blocking::Client,
}

impl OpenAiClient {
    /// Default API endpoint.
    pub const DEFAULT_ENDPOINT: &'static str = "https://api.openai.com/v1";

    /// Default model.
    pub const DEFAULT_MODEL: &'static str = "gpt-4o-mini";

    /// Creates a new client, reading `OPENAI_API_KEY` from the environment.
    #[must_use]
    pub fn new() -> Self {
        Self {
            api_key: std::env::var("OPENAI_API_KEY").ok(),
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

    fn request(&self, mut messages: Vec<ChatCompletionMessage>, system: &str) -> Result<String> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| Error::LlmError("OPENAI_API_KEY not set".to_string()))?;

        let system = if system.is_empty() {
            "You are a knowledge extraction assistant."
        } else {
            system
        };
        messages.insert(
            0,
            ChatCompletionMessage {
                role: "system".to_string(),
                content: system.to_string(),
            },
        );

        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .map_err(|e| Error::LlmError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(Error::LlmError(format!(
                "openai API returned {status}: {}",
                sanitize_llm_response_for_error(&body)
            )));
        }

        let body: ChatCompletionResponse = response
            .json()
            .map_err(|e| Error::LlmError(format!("invalid openai response: {e}")))?;

        body.choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| Error::LlmError("no choices in openai response".to_string()))
    }
}

impl Default for OpenAiClient {
    fn default() -> Self {
        Self::new()
    }
}

impl LlmProvider for OpenAiClient {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn complete(&self, prompt: &str, system: &str) -> Result<String> {
        let messages = vec![ChatCompletionMessage {
            role: "user".to_string(),
            content: prompt.to_string(),
        }];
        self.request(messages, system)
    }

    fn chat(&self, messages: &[super::ChatMessage], system: &str) -> Result<String> {
        let mapped = messages
            .iter()
            .map(|m| ChatCompletionMessage {
                role: m.role.clone(),
                content: m.content.clone(),
            })
            .collect();
        self.request(mapped, system)
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatCompletionMessage>,
}

#[derive(Debug, Serialize)]
struct ChatCompletionMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_defaults() {
        let client = OpenAiClient::new();
        assert_eq!(client.name(), "openai");
        assert_eq!(client.model, OpenAiClient::DEFAULT_MODEL);
    }

    #[test]
    fn test_client_configuration() {
        let client = OpenAiClient::new()
            .with_api_key("test-key")
            .with_endpoint("https://custom.endpoint")
            .with_model("gpt-4o");

        assert_eq!(client.api_key, Some("test-key".to_string()));
        assert_eq!(client.endpoint, "https://custom.endpoint");
        assert_eq!(client.model, "gpt-4o");
    }

    #[test]
    fn test_request_fails_without_key() {
        let client = OpenAiClient {
            api_key: None,
            endpoint: OpenAiClient::DEFAULT_ENDPOINT.to_string(),
            model: OpenAiClient::DEFAULT_MODEL.to_string(),
            client: reqwest::blocking::Client::new(),
        };
        let result = client.complete("hello", "");
        assert!(result.is_err());
    }
}
