//! Personality-partitioned similarity search over pre-embedded chunks.

pub mod embed;
pub mod index;

pub use embed::{HashingEmbedder, QueryEmbedder};
pub use index::{FlatVectorIndex, RemoteVectorIndex, SearchFilter, SearchHit, VectorSearcher};
