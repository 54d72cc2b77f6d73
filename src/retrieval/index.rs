//! Partitioned nearest-neighbor search.
//!
//! Each partition corresponds to one personality or domain namespace; all
//! vectors within a partition share dimensionality, and a search never
//! crosses partitions. Score is cosine similarity on unit-normalized
//! vectors, so ranking reduces to a dot product.
//!
//! Implementations are pluggable behind [`VectorSearcher`]: the in-process
//! flat index suits corpora up to ~10^5 chunks per partition; the remote
//! index speaks the same contract over HTTP. The pipeline does not know
//! which is in use.

use crate::error::StorageError;
use crate::logging::{log_debug, log_warn};
use crate::records::{Chunk, StoredRecord};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

/// Optional secondary filter applied after similarity ranking.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilter {
    /// Keep only chunks from this source document.
    pub source: Option<String>,
    /// Keep only chunks carrying this key term.
    pub key_term: Option<String>,
}

impl SearchFilter {
    fn matches(&self, chunk: &Chunk) -> bool {
        if let Some(source) = &self.source {
            if &chunk.source != source {
                return false;
            }
        }
        if let Some(term) = &self.key_term {
            if !chunk.key_terms.iter().any(|t| t == term) {
                return false;
            }
        }
        true
    }
}

/// One ranked search result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    /// The matching chunk.
    pub chunk: Chunk,
    /// Cosine similarity in [-1, 1].
    pub score: f32,
}

/// Contract every vector index implementation satisfies.
#[async_trait]
pub trait VectorSearcher: Send + Sync + std::fmt::Debug {
    /// Rank the `k` most similar chunks within `partition`, dropping hits
    /// below `min_score` and outside `filter`.
    async fn search(
        &self,
        query: &[f32],
        k: usize,
        partition: &str,
        min_score: f32,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<SearchHit>, StorageError>;
}

#[derive(Debug, Default)]
struct Partition {
    dimension: usize,
    ids: HashSet<String>,
    chunks: Vec<Chunk>,
}

/// In-process flat index over unit-normalized embeddings.
#[derive(Debug, Default)]
pub struct FlatVectorIndex {
    partitions: RwLock<HashMap<String, Partition>>,
}

impl FlatVectorIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest one chunk, normalizing its embedding.
    ///
    /// # Errors
    ///
    /// Rejects chunks whose dimensionality differs from the partition's
    /// declared dimensionality, duplicate chunk ids, and zero vectors.
    pub async fn add(&self, mut chunk: Chunk) -> Result<(), StorageError> {
        if chunk.embedding.is_empty() {
            return Err(StorageError::unavailable(format!(
                "chunk {} has an empty embedding",
                chunk.id
            )));
        }
        normalize(&mut chunk.embedding).ok_or_else(|| {
            StorageError::unavailable(format!("chunk {} has a zero embedding", chunk.id))
        })?;

        let mut partitions = self.partitions.write().await;
        let partition = partitions.entry(chunk.partition.clone()).or_default();

        if partition.dimension == 0 {
            partition.dimension = chunk.embedding.len();
        } else if partition.dimension != chunk.embedding.len() {
            return Err(StorageError::unavailable(format!(
                "chunk {} dimension {} does not match partition {} dimension {}",
                chunk.id,
                chunk.embedding.len(),
                chunk.partition,
                partition.dimension
            )));
        }

        if !partition.ids.insert(chunk.id.clone()) {
            return Err(StorageError::Conflict {
                collection: chunk.partition.clone(),
            });
        }
        partition.chunks.push(chunk);
        Ok(())
    }

    /// Replace a partition's contents (batch corpus swap).
    pub async fn swap_partition(
        &self,
        partition: &str,
        chunks: Vec<Chunk>,
    ) -> Result<(), StorageError> {
        {
            let mut partitions = self.partitions.write().await;
            partitions.remove(partition);
        }
        for chunk in chunks {
            if chunk.partition != partition {
                return Err(StorageError::unavailable(format!(
                    "chunk {} belongs to partition {}, not {partition}",
                    chunk.id, chunk.partition
                )));
            }
            self.add(chunk).await?;
        }
        Ok(())
    }

    /// Load every chunk from a store's texts collection.
    pub async fn load_from_records(&self, records: Vec<StoredRecord>) -> usize {
        let mut loaded = 0;
        for record in records {
            if let StoredRecord::SpiritualText(chunk) = record {
                match self.add(chunk).await {
                    Ok(()) => loaded += 1,
                    Err(e) => log_warn!(error = %e, "Skipping unloadable chunk"),
                }
            }
        }
        log_debug!(loaded = loaded, "Vector index loaded from store records");
        loaded
    }

    /// Fetch a chunk by id across partitions.
    pub async fn get_by_id(&self, id: &str) -> Option<Chunk> {
        let partitions = self.partitions.read().await;
        partitions
            .values()
            .flat_map(|p| p.chunks.iter())
            .find(|c| c.id == id)
            .cloned()
    }

    /// Number of chunks in a partition.
    pub async fn partition_len(&self, partition: &str) -> usize {
        self.partitions
            .read()
            .await
            .get(partition)
            .map_or(0, |p| p.chunks.len())
    }
}

#[async_trait]
impl VectorSearcher for FlatVectorIndex {
    async fn search(
        &self,
        query: &[f32],
        k: usize,
        partition: &str,
        min_score: f32,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<SearchHit>, StorageError> {
        let mut query = query.to_vec();
        normalize(&mut query)
            .ok_or_else(|| StorageError::unavailable("zero query vector"))?;

        let partitions = self.partitions.read().await;
        let Some(part) = partitions.get(partition) else {
            return Ok(Vec::new());
        };
        if part.dimension != query.len() {
            return Err(StorageError::unavailable(format!(
                "query dimension {} does not match partition {partition} dimension {}",
                query.len(),
                part.dimension
            )));
        }

        let mut hits: Vec<SearchHit> = part
            .chunks
            .iter()
            .filter(|chunk| filter.map_or(true, |f| f.matches(chunk)))
            .map(|chunk| SearchHit {
                score: dot(&query, &chunk.embedding),
                chunk: chunk.clone(),
            })
            .filter(|hit| hit.score >= min_score)
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }
}

/// Remote service-backed index with the same contract.
#[derive(Debug, Clone)]
pub struct RemoteVectorIndex {
    endpoint: String,
    key: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct RemoteSearchRequest<'a> {
    query: &'a [f32],
    k: usize,
    partition: &'a str,
    min_score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<&'a SearchFilter>,
}

impl RemoteVectorIndex {
    /// Create a client for the given search endpoint.
    pub fn new(endpoint: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            key: key.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl VectorSearcher for RemoteVectorIndex {
    async fn search(
        &self,
        query: &[f32],
        k: usize,
        partition: &str,
        min_score: f32,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<SearchHit>, StorageError> {
        let response = self
            .client
            .post(format!("{}/search", self.endpoint))
            .bearer_auth(&self.key)
            .json(&RemoteSearchRequest {
                query,
                k,
                partition,
                min_score,
                filter,
            })
            .send()
            .await
            .map_err(|e| StorageError::unavailable(format!("remote search: {e}")))?;

        if !response.status().is_success() {
            return Err(StorageError::unavailable(format!(
                "remote search returned {}",
                response.status()
            )));
        }
        let hits: Vec<SearchHit> = response
            .json()
            .await
            .map_err(|e| StorageError::unavailable(format!("remote search decode: {e}")))?;

        // The partition invariant holds regardless of which side ranked.
        Ok(hits
            .into_iter()
            .filter(|hit| hit.chunk.partition == partition)
            .collect())
    }
}

fn normalize(vector: &mut [f32]) -> Option<()> {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return None;
    }
    for x in vector.iter_mut() {
        *x /= norm;
    }
    Some(())
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn chunk(id: &str, partition: &str, embedding: Vec<f32>) -> Chunk {
        Chunk {
            id: id.to_string(),
            text: format!("text for {id}"),
            source: "Bhagavad Gita 2.47".to_string(),
            section: None,
            key_terms: vec!["duty".to_string()],
            citations: vec!["Bhagavad Gita 2.47".to_string()],
            quality_score: 1.0,
            embedding,
            partition: partition.to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_search_ranks_by_cosine_similarity() {
        let index = FlatVectorIndex::new();
        index.add(chunk("close", "krishna", vec![1.0, 0.1, 0.0])).await.unwrap();
        index.add(chunk("far", "krishna", vec![0.0, 1.0, 0.0])).await.unwrap();

        let hits = index
            .search(&[1.0, 0.0, 0.0], 2, "krishna", 0.0, None)
            .await
            .unwrap();

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk.id, "close");
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn test_search_never_crosses_partitions() {
        let index = FlatVectorIndex::new();
        index.add(chunk("k1", "krishna", vec![1.0, 0.0])).await.unwrap();
        index.add(chunk("e1", "einstein", vec![1.0, 0.0])).await.unwrap();

        let hits = index
            .search(&[1.0, 0.0], 10, "krishna", 0.0, None)
            .await
            .unwrap();

        assert!(hits.iter().all(|h| h.chunk.partition == "krishna"));
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected_at_ingest() {
        let index = FlatVectorIndex::new();
        index.add(chunk("k1", "krishna", vec![1.0, 0.0, 0.0])).await.unwrap();

        let err = index.add(chunk("k2", "krishna", vec![1.0, 0.0])).await;
        assert!(err.is_err(), "Mismatched dimensionality must be rejected");
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected_at_ingest() {
        let index = FlatVectorIndex::new();
        index.add(chunk("k1", "krishna", vec![1.0, 0.0])).await.unwrap();

        let err = index.add(chunk("k1", "krishna", vec![0.0, 1.0])).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_min_score_and_k_bound_results() {
        let index = FlatVectorIndex::new();
        index.add(chunk("a", "krishna", vec![1.0, 0.0])).await.unwrap();
        index.add(chunk("b", "krishna", vec![0.9, 0.1])).await.unwrap();
        index.add(chunk("c", "krishna", vec![0.0, 1.0])).await.unwrap();

        let hits = index
            .search(&[1.0, 0.0], 2, "krishna", 0.5, None)
            .await
            .unwrap();

        assert!(hits.len() <= 2);
        assert!(hits.iter().all(|h| h.score >= 0.5));
        assert!(hits.iter().all(|h| h.chunk.id != "c"));
    }

    #[tokio::test]
    async fn test_source_filter_applies() {
        let index = FlatVectorIndex::new();
        let mut other = chunk("b", "krishna", vec![1.0, 0.0]);
        other.source = "Mahabharata".to_string();
        index.add(chunk("a", "krishna", vec![1.0, 0.0])).await.unwrap();
        index.add(other).await.unwrap();

        let filter = SearchFilter {
            source: Some("Bhagavad Gita 2.47".to_string()),
            key_term: None,
        };
        let hits = index
            .search(&[1.0, 0.0], 10, "krishna", 0.0, Some(&filter))
            .await
            .unwrap();

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.id, "a");
    }

    #[tokio::test]
    async fn test_get_by_id_round_trip() {
        let index = FlatVectorIndex::new();
        index.add(chunk("k1", "krishna", vec![1.0, 0.0])).await.unwrap();

        let got = index.get_by_id("k1").await.unwrap();
        assert_eq!(got.id, "k1");
        assert!(index.get_by_id("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_swap_partition_replaces_contents() {
        let index = FlatVectorIndex::new();
        index.add(chunk("old", "krishna", vec![1.0, 0.0])).await.unwrap();

        index
            .swap_partition("krishna", vec![chunk("new", "krishna", vec![0.0, 1.0])])
            .await
            .unwrap();

        assert!(index.get_by_id("old").await.is_none());
        assert!(index.get_by_id("new").await.is_some());
        assert_eq!(index.partition_len("krishna").await, 1);
    }

    #[tokio::test]
    async fn test_empty_partition_returns_empty() {
        let index = FlatVectorIndex::new();
        let hits = index
            .search(&[1.0, 0.0], 5, "nobody", 0.0, None)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }
}
