//! Query embedding seam.
//!
//! Corpus chunks arrive pre-embedded; only the query needs a vector at
//! serving time. The embedding model is an external collaborator behind
//! [`QueryEmbedder`]. The hashing embedder is the in-process stand-in for
//! development and tests: feature-hashed bag of words, unit-normalized,
//! deterministic, and dimensioned to match the partition it queries.

use crate::error::StorageError;
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Produces the query vector for a similarity search.
#[async_trait]
pub trait QueryEmbedder: Send + Sync + std::fmt::Debug {
    /// Embed one query string.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, StorageError>;

    /// Dimensionality of produced vectors.
    fn dimension(&self) -> usize;
}

/// Deterministic feature-hashing embedder.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    /// Create an embedder with the given output dimensionality.
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    /// Embed synchronously (used at chunk-seeding time in tests).
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in tokenize(text) {
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            let index = (hasher.finish() as usize) % self.dimension;
            vector[index] += 1.0;
        }
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl QueryEmbedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, StorageError> {
        Ok(self.embed_sync(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_embedding_is_deterministic_and_normalized() {
        let embedder = HashingEmbedder::new(128);
        let a = embedder.embed("What is my duty?").await.unwrap();
        let b = embedder.embed("What is my duty?").await.unwrap();
        assert_eq!(a, b);

        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_shared_terms_raise_similarity() {
        let embedder = HashingEmbedder::new(128);
        let query = embedder.embed("What is my duty?").await.unwrap();
        let related = embedder
            .embed("You have a right to perform your prescribed duty")
            .await
            .unwrap();
        let unrelated = embedder
            .embed("electromagnetic induction and resonance")
            .await
            .unwrap();

        let dot = |a: &[f32], b: &[f32]| a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>();
        assert!(dot(&query, &related) > dot(&query, &unrelated));
    }
}
