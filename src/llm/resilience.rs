//! Bounded retry wrapper for LLM providers.
//!
//! Ingestion-path calls retry up to 3 times with backoff 10s/20s/30s (§5);
//! the backoff steps live on [`crate::config::LlmConfig`] so callers that
//! need a different policy (e.g. tests) can override them without touching
//! this wrapper.

use super::{ChatMessage, LlmProvider};
use crate::{Error, Result};
use std::time::Duration;

/// Wraps an [`LlmProvider`] with bounded retries and fixed backoff.
pub struct ResilientLlmProvider<P: LlmProvider> {
    inner: P,
    max_retries: u32,
    backoff_ms: Vec<u64>,
}

impl<P: LlmProvider> ResilientLlmProvider<P> {
    /// Wraps `inner`, retrying up to `max_retries` times with the given
    /// per-attempt backoff in milliseconds.
    #[must_use]
    pub fn new(inner: P, max_retries: u32, backoff_ms: Vec<u64>) -> Self {
        Self {
            inner,
            max_retries,
            backoff_ms,
        }
    }

    fn backoff_for_attempt(&self, attempt: usize) -> Duration {
        let ms = self
            .backoff_ms
            .get(attempt)
            .or_else(|| self.backoff_ms.last())
            .copied()
            .unwrap_or(0);
        Duration::from_millis(ms)
    }

    fn execute<T>(&self, operation: &'static str, mut call: impl FnMut() -> Result<T>) -> Result<T> {
        let provider = self.inner.name();
        let mut attempt = 0;
        let mut last_error = None;

        loop {
            match call() {
                Ok(value) => {
                    metrics::counter!(
                        "llm_requests_total",
                        "provider" => provider,
                        "operation" => operation,
                        "status" => "ok"
                    )
                    .increment(1);
                    return Ok(value);
                },
                Err(err) => {
                    tracing::warn!(
                        provider,
                        operation,
                        attempt,
                        error = %err,
                        "LLM call failed"
                    );
                    metrics::counter!(
                        "llm_requests_total",
                        "provider" => provider,
                        "operation" => operation,
                        "status" => "error"
                    )
                    .increment(1);
                    last_error = Some(err);
                    if attempt >= self.max_retries as usize {
                        break;
                    }
                    std::thread::sleep(self.backoff_for_attempt(attempt));
                    attempt += 1;
                },
            }
        }

        metrics::counter!(
            "llm_requests_exhausted_total",
            "provider" => provider,
            "operation" => operation
        )
        .increment(1);
        Err(last_error.unwrap_or_else(|| Error::LlmError(format!("{operation} exhausted retries"))))
    }
}

impl<P: LlmProvider> LlmProvider for ResilientLlmProvider<P> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn complete(&self, prompt: &str, system: &str) -> Result<String> {
        self.execute("complete", || self.inner.complete(prompt, system))
    }

    fn chat(&self, messages: &[ChatMessage], system: &str) -> Result<String> {
        self.execute("chat", || self.inner.chat(messages, system))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyProvider {
        failures_remaining: AtomicU32,
    }

    impl LlmProvider for FlakyProvider {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn complete(&self, _prompt: &str, _system: &str) -> Result<String> {
            let remaining = self.failures_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
                Err(Error::LlmError("simulated failure".to_string()))
            } else {
                Ok("ok".to_string())
            }
        }
    }

    #[test]
    fn test_retries_until_success() {
        let provider = FlakyProvider {
            failures_remaining: AtomicU32::new(2),
        };
        let resilient = ResilientLlmProvider::new(provider, 3, vec![0, 0, 0]);
        let result = resilient.complete("hi", "");
        assert_eq!(result.unwrap(), "ok");
    }

    #[test]
    fn test_fails_after_exhausting_retries() {
        let provider = FlakyProvider {
            failures_remaining: AtomicU32::new(10),
        };
        let resilient = ResilientLlmProvider::new(provider, 2, vec![0, 0]);
        assert!(resilient.complete("hi", "").is_err());
    }
}
