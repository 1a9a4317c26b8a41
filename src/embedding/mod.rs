//! Embedding generation.
//!
//! Exposes a uniform [`Embedder`] trait over an `OpenAI`-shaped HTTP provider
//! and a dependency-free hash-based fallback, both returning unit-norm
//! vectors of a fixed dimension (§4.1).

// Allow cast precision loss for hash-based embedding calculations.
#![allow(clippy::cast_precision_loss)]
// Allow cast possible truncation for hash index calculations on 32-bit platforms.
#![allow(clippy::cast_possible_truncation)]

mod fallback;
mod http;

pub use fallback::FallbackEmbedder;
pub use http::HttpEmbedder;

use crate::config::EmbeddingConfig;
use crate::Result;

/// Trait for embedding generators.
pub trait Embedder: Send + Sync {
    /// Returns the embedding dimensions.
    fn dimensions(&self) -> usize;

    /// Generates a unit-norm embedding for the given text.
    ///
    /// # Errors
    ///
    /// Returns an error if embedding generation fails.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Generates embeddings for multiple texts, preserving input order even
    /// if the upstream reorders results.
    ///
    /// # Errors
    ///
    /// Returns an error if embedding generation fails.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }
}

/// Computes the cosine similarity between two vectors.
///
/// Assumes both vectors are unit-norm, in which case this reduces to a plain
/// dot product (§4.1, §4.6).
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Builds an [`Embedder`] from configuration, mirroring
/// [`crate::llm::create_llm_client`]'s dispatch style.
///
/// Unlike the LLM factory, this never fails: with no API key configured it
/// falls back to the dependency-free [`FallbackEmbedder`] rather than
/// erroring, so ingestion stays exercisable without an embedding provider
/// (§4.1).
#[must_use]
pub fn create_embedder(config: &EmbeddingConfig) -> Box<dyn Embedder> {
    if config.api_key.is_some() {
        match HttpEmbedder::from_config(config) {
            Ok(client) => return Box::new(client),
            Err(err) => tracing::warn!("failed to build HTTP embedder, falling back: {err}"),
        }
    }
    Box::new(FallbackEmbedder::new(config.dimensions))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_embedder_falls_back_without_api_key() {
        let mut config = EmbeddingConfig::default();
        config.api_key = None;
        let embedder = create_embedder(&config);
        assert_eq!(embedder.dimensions(), config.dimensions);
    }

    #[test]
    fn test_cosine_similarity_identical_unit_vectors() {
        let v = vec![0.6, 0.8];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }
}
