//! Hash-based fallback embedder.

use super::Embedder;
use crate::Result;
use sha2::{Digest, Sha256};

/// Deterministic, dependency-free embedder used for tests and for operation
/// without a configured provider.
///
/// Hashes the input text with SHA-256 and expands the digest into a
/// fixed-dimension vector via repeated re-hashing, then normalizes it to
/// unit length. Not a stub that errors, so the rest of the pipeline stays
/// exercisable offline.
pub struct FallbackEmbedder {
    dimensions: usize,
}

impl FallbackEmbedder {
    /// Creates a new fallback embedder with the given output dimensionality.
    #[must_use]
    pub const fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }
}

impl Default for FallbackEmbedder {
    fn default() -> Self {
        Self::new(1536)
    }
}

impl Embedder for FallbackEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if self.dimensions == 0 {
            return Ok(Vec::new());
        }

        let mut values = Vec::with_capacity(self.dimensions);
        let mut seed = Sha256::digest(text.as_bytes()).to_vec();

        while values.len() < self.dimensions {
            for byte in &seed {
                if values.len() >= self.dimensions {
                    break;
                }
                // Map each byte to [-1.0, 1.0].
                values.push((f32::from(*byte) / 127.5) - 1.0);
            }
            seed = Sha256::digest(&seed).to_vec();
        }

        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut values {
                *v /= norm;
            }
        }

        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embed_is_unit_norm() {
        let embedder = FallbackEmbedder::new(32);
        let vector = embedder.embed("hello world").unwrap();
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_embed_is_deterministic() {
        let embedder = FallbackEmbedder::new(16);
        let a = embedder.embed("same text").unwrap();
        let b = embedder.embed("same text").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_embed_differs_for_different_text() {
        let embedder = FallbackEmbedder::new(16);
        let a = embedder.embed("text one").unwrap();
        let b = embedder.embed("text two").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_embed_respects_requested_dimensions() {
        let embedder = FallbackEmbedder::new(64);
        let vector = embedder.embed("dimension check").unwrap();
        assert_eq!(vector.len(), 64);
    }
}
