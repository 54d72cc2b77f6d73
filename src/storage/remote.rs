//! Remote document store contract and implementations.
//!
//! The concrete document store is an external collaborator; the core only
//! depends on this trait. Two implementations ship: an HTTP-backed client
//! for the partitioned document API, and an in-memory store used in
//! development and tests (with failure injection for rollback paths).

use crate::error::StorageError;
use crate::logging::{log_debug, log_warn};
use crate::records::StoredRecord;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Contract the dual store requires from the remote document store.
///
/// Upserts are keyed by document id within a partition; the store is
/// last-writer-wins for same-id upserts.
#[async_trait]
pub trait RemoteStore: Send + Sync + std::fmt::Debug {
    /// Insert or replace a document.
    async fn upsert(
        &self,
        collection: &str,
        partition_key: &str,
        record: StoredRecord,
    ) -> Result<(), StorageError>;

    /// Fetch one document by id.
    async fn get(&self, collection: &str, id: &str) -> Result<StoredRecord, StorageError>;

    /// Read every document in a collection.
    async fn read_all(&self, collection: &str) -> Result<Vec<StoredRecord>, StorageError>;

    /// Delete a document by id. Deleting a missing id is a no-op.
    async fn delete(&self, collection: &str, id: &str) -> Result<(), StorageError>;
}

/// HTTP-backed client for the partitioned document API.
#[derive(Debug, Clone)]
pub struct HttpRemoteStore {
    endpoint: String,
    key: String,
    client: reqwest::Client,
}

impl HttpRemoteStore {
    /// Create a client for the given endpoint and access key.
    pub fn new(endpoint: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            key: key.into(),
            client: reqwest::Client::new(),
        }
    }

    fn doc_url(&self, collection: &str, id: &str) -> String {
        format!("{}/collections/{collection}/docs/{id}", self.endpoint)
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn upsert(
        &self,
        collection: &str,
        partition_key: &str,
        record: StoredRecord,
    ) -> Result<(), StorageError> {
        let url = self.doc_url(collection, record.id());
        let response = self
            .client
            .put(&url)
            .bearer_auth(&self.key)
            .header("x-partition-key", partition_key)
            .json(&record)
            .send()
            .await
            .map_err(|e| StorageError::unavailable(format!("remote upsert: {e}")))?;

        if !response.status().is_success() {
            return Err(StorageError::unavailable(format!(
                "remote upsert returned {}",
                response.status()
            )));
        }
        log_debug!(collection = collection, id = record.id(), "Remote upsert durable");
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<StoredRecord, StorageError> {
        let response = self
            .client
            .get(self.doc_url(collection, id))
            .bearer_auth(&self.key)
            .send()
            .await
            .map_err(|e| StorageError::unavailable(format!("remote get: {e}")))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }
        if !response.status().is_success() {
            return Err(StorageError::unavailable(format!(
                "remote get returned {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| StorageError::unavailable(format!("remote get decode: {e}")))
    }

    async fn read_all(&self, collection: &str) -> Result<Vec<StoredRecord>, StorageError> {
        let url = format!("{}/collections/{collection}/docs", self.endpoint);
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.key)
            .send()
            .await
            .map_err(|e| StorageError::unavailable(format!("remote read: {e}")))?;

        if !response.status().is_success() {
            return Err(StorageError::unavailable(format!(
                "remote read returned {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| StorageError::unavailable(format!("remote read decode: {e}")))
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StorageError> {
        let response = self
            .client
            .delete(self.doc_url(collection, id))
            .bearer_auth(&self.key)
            .send()
            .await
            .map_err(|e| StorageError::unavailable(format!("remote delete: {e}")))?;

        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(StorageError::unavailable(format!(
                "remote delete returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// In-memory remote store for development and tests.
///
/// `fail_next_writes(n)` makes the next `n` write operations fail with
/// `StorageError::Unavailable`, which exercises the compensating rollback
/// path without a network.
#[derive(Debug, Default)]
pub struct MemoryRemoteStore {
    collections: RwLock<HashMap<String, Vec<StoredRecord>>>,
    writes_before_failure: AtomicU32,
    failures_remaining: AtomicU32,
}

impl MemoryRemoteStore {
    /// Create an empty store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `n` writes fail.
    pub fn fail_next_writes(&self, n: u32) {
        self.writes_before_failure.store(0, Ordering::SeqCst);
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    /// Let `skip` writes succeed, then fail the following `n`.
    pub fn fail_after_writes(&self, skip: u32, n: u32) {
        self.writes_before_failure.store(skip, Ordering::SeqCst);
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    fn consume_failure(&self) -> Result<(), StorageError> {
        let skip = self.writes_before_failure.load(Ordering::SeqCst);
        if skip > 0 {
            self.writes_before_failure.store(skip - 1, Ordering::SeqCst);
            return Ok(());
        }
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            log_warn!(remaining = remaining - 1, "Injected remote-store write failure");
            return Err(StorageError::unavailable("injected remote failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn upsert(
        &self,
        collection: &str,
        _partition_key: &str,
        record: StoredRecord,
    ) -> Result<(), StorageError> {
        self.consume_failure()?;
        let mut collections = self.collections.write().await;
        let records = collections.entry(collection.to_string()).or_default();
        records.retain(|r| r.id() != record.id());
        records.push(record);
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<StoredRecord, StorageError> {
        self.collections
            .read()
            .await
            .get(collection)
            .and_then(|records| records.iter().find(|r| r.id() == id))
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })
    }

    async fn read_all(&self, collection: &str) -> Result<Vec<StoredRecord>, StorageError> {
        Ok(self
            .collections
            .read()
            .await
            .get(collection)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StorageError> {
        self.consume_failure()?;
        if let Some(records) = self.collections.write().await.get_mut(collection) {
            records.retain(|r| r.id() != id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{Conversation, StoredRecord};
    use chrono::Utc;

    fn record(id: &str) -> StoredRecord {
        StoredRecord::Conversation(Conversation {
            id: id.to_string(),
            user_id: "u1".to_string(),
            session_id: "s1".to_string(),
            timestamp: Utc::now(),
            question: "q".to_string(),
            response: "r".to_string(),
            citations: vec![],
            personality: "krishna".to_string(),
        })
    }

    #[tokio::test]
    async fn test_memory_store_upsert_get() {
        let store = MemoryRemoteStore::new();
        store.upsert("conversations", "u1", record("c1")).await.unwrap();

        let got = store.get("conversations", "c1").await.unwrap();
        assert_eq!(got.id(), "c1");
    }

    #[tokio::test]
    async fn test_failure_injection_exhausts() {
        let store = MemoryRemoteStore::new();
        store.fail_next_writes(1);

        assert!(store.upsert("c", "p", record("c1")).await.is_err());
        assert!(store.upsert("c", "p", record("c1")).await.is_ok());
    }
}
