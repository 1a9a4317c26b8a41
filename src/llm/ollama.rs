//! Ollama (local) client.

use super::{LlmHttpConfig, LlmProvider, build_http_client, sanitize_llm_response_for_error};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Local Ollama HTTP client.
pub struct OllamaClient {
    base_url: String,
    model: String,
    client: reqwest::blocking::Client,
}

impl OllamaClient {
    /// Default base URL.
    pub const DEFAULT_BASE_URL: &'static str = "http://localhost:11434";

    /// Default model.
    pub const DEFAULT_MODEL: &'static str = "llama3.2";

    /// Creates a new client, reading `OLLAMA_HOST`/`OLLAMA_MODEL` from the
    /// environment if present.
    #[must_use]
    pub fn new() -> Self {
        Self {
            base_url: std::env::var("OLLAMA_HOST")
                .unwrap_or_else(|_| Self::DEFAULT_BASE_URL.to_string()),
            model: std::env::var("OLLAMA_MODEL").unwrap_or_else(|_| Self::DEFAULT_MODEL.to_string()),
            client: build_http_client(LlmHttpConfig::default()),
        }
    }

    /// Sets the base URL.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
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
}

impl Default for OllamaClient {
    fn default() -> Self {
        Self::new()
    }
}

impl LlmProvider for OllamaClient {
    fn name(&self) -> &'static str {
        "ollama"
    }

    fn complete(&self, prompt: &str, system: &str) -> Result<String> {
        let system = if system.is_empty() {
            "You are a knowledge extraction assistant."
        } else {
            system
        };

        let request = GenerateRequest {
            model: self.model.clone(),
            prompt: prompt.to_string(),
            system: system.to_string(),
            stream: false,
        };

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&request)
            .send()
            .map_err(|e| Error::LlmError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(Error::LlmError(format!(
                "ollama returned {status}: {}",
                sanitize_llm_response_for_error(&body)
            )));
        }

        let body: GenerateResponse = response
            .json()
            .map_err(|e| Error::LlmError(format!("invalid ollama response: {e}")))?;
        Ok(body.response)
    }

    fn chat(&self, messages: &[super::ChatMessage], system: &str) -> Result<String> {
        let system = if system.is_empty() {
            "You are a helpful assistant."
        } else {
            system
        };

        let mut wire_messages = vec![OllamaMessage {
            role: "system".to_string(),
            content: system.to_string(),
        }];
        wire_messages.extend(messages.iter().map(|m| OllamaMessage {
            role: m.role.clone(),
            content: m.content.clone(),
        }));

        let request = ChatRequest {
            model: self.model.clone(),
            messages: wire_messages,
            stream: false,
        };

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&request)
            .send()
            .map_err(|e| Error::LlmError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(Error::LlmError(format!(
                "ollama returned {status}: {}",
                sanitize_llm_response_for_error(&body)
            )));
        }

        let body: ChatResponse = response
            .json()
            .map_err(|e| Error::LlmError(format!("invalid ollama response: {e}")))?;
        Ok(body.message.content)
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    system: String,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: OllamaMessage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_defaults() {
        let client = OllamaClient {
            base_url: OllamaClient::DEFAULT_BASE_URL.to_string(),
            model: OllamaClient::DEFAULT_MODEL.to_string(),
            client: reqwest::blocking::Client::new(),
        };
        assert_eq!(client.name(), "ollama");
        assert_eq!(client.model, OllamaClient::DEFAULT_MODEL);
    }

    #[test]
    fn test_with_base_url_strips_trailing_slash() {
        let client = OllamaClient::new().with_base_url("http://example.com:11434/");
        assert_eq!(client.base_url, "http://example.com:11434");
    }
}
