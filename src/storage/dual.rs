//! TokenStore: one logical collection API over the dual physical stores.
//!
//! In `LocalOnly` mode (development) writes hit the local JSON store only.
//! In `RemotePrimary` mode a write is durable once the remote accepts it;
//! the local mirror is best-effort and reconciled by the transaction
//! manager's rollback when needed.

use crate::config::StorageConfig;
use crate::error::StorageError;
use crate::logging::{log_info, log_warn};
use crate::records::StoredRecord;
use crate::storage::local::LocalStore;
use crate::storage::remote::{HttpRemoteStore, RemoteStore};
use std::sync::Arc;

/// Which physical stores a write must reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Development: local JSON files only.
    LocalOnly,
    /// Production: remote is the durability authority, local is a mirror.
    RemotePrimary,
}

/// The logical collection API used by everything above storage.
#[derive(Debug, Clone)]
pub struct TokenStore {
    mode: StoreMode,
    local: LocalStore,
    remote: Option<Arc<dyn RemoteStore>>,
}

impl TokenStore {
    /// Build the store for the configured endpoints.
    pub fn from_config(storage: &StorageConfig) -> Result<Self, StorageError> {
        let local = LocalStore::new(&storage.local_dir)?;
        match (&storage.remote_endpoint, &storage.remote_key) {
            (Some(endpoint), Some(key)) => {
                log_info!(mode = "remote_primary", "Token store initialized");
                Ok(Self {
                    mode: StoreMode::RemotePrimary,
                    local,
                    remote: Some(Arc::new(HttpRemoteStore::new(endpoint, key))),
                })
            }
            _ => {
                log_info!(mode = "local_only", "Token store initialized");
                Ok(Self {
                    mode: StoreMode::LocalOnly,
                    local,
                    remote: None,
                })
            }
        }
    }

    /// Build a local-only store (development and tests).
    pub fn local_only(local: LocalStore) -> Self {
        Self {
            mode: StoreMode::LocalOnly,
            local,
            remote: None,
        }
    }

    /// Build a remote-primary store with an explicit remote implementation.
    pub fn remote_primary(local: LocalStore, remote: Arc<dyn RemoteStore>) -> Self {
        Self {
            mode: StoreMode::RemotePrimary,
            local,
            remote: Some(remote),
        }
    }

    /// The active store mode.
    pub fn mode(&self) -> StoreMode {
        self.mode
    }

    /// Direct access to the local store (transaction rollback mirrors).
    pub fn local(&self) -> &LocalStore {
        &self.local
    }

    /// Insert or replace a record.
    ///
    /// In `RemotePrimary` mode the write is durable once the remote accepts
    /// it; a local mirror failure is logged and swallowed. In `LocalOnly`
    /// mode the local write is authoritative.
    pub async fn upsert(
        &self,
        collection: &str,
        record: StoredRecord,
    ) -> Result<(), StorageError> {
        match (self.mode, &self.remote) {
            (StoreMode::RemotePrimary, Some(remote)) => {
                remote
                    .upsert(collection, record.partition_key(), record.clone())
                    .await?;
                if let Err(e) = self.local.upsert(collection, record).await {
                    log_warn!(
                        collection = collection,
                        error = %e,
                        "Local mirror write failed after durable remote write"
                    );
                }
                Ok(())
            }
            _ => self.local.upsert(collection, record).await,
        }
    }

    /// Fetch one record by id, falling back from local to remote.
    pub async fn get(&self, collection: &str, id: &str) -> Result<StoredRecord, StorageError> {
        match self.local.get(collection, id).await {
            Ok(record) => Ok(record),
            Err(StorageError::NotFound { .. }) => match &self.remote {
                Some(remote) => remote.get(collection, id).await,
                None => Err(StorageError::NotFound {
                    collection: collection.to_string(),
                    id: id.to_string(),
                }),
            },
            Err(e) => Err(e),
        }
    }

    /// Read a whole collection from the authoritative store.
    pub async fn read_all(&self, collection: &str) -> Result<Vec<StoredRecord>, StorageError> {
        match (self.mode, &self.remote) {
            (StoreMode::RemotePrimary, Some(remote)) => remote.read_all(collection).await,
            _ => self.local.read_all(collection).await,
        }
    }

    /// Delete a record from both stores.
    pub async fn delete(&self, collection: &str, id: &str) -> Result<(), StorageError> {
        match (self.mode, &self.remote) {
            (StoreMode::RemotePrimary, Some(remote)) => {
                remote.delete(collection, id).await?;
                if let Err(e) = self.local.delete(collection, id).await {
                    log_warn!(
                        collection = collection,
                        id = id,
                        error = %e,
                        "Local mirror delete failed"
                    );
                }
                Ok(())
            }
            _ => self.local.delete(collection, id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{Conversation, StoredRecord};
    use crate::storage::remote::MemoryRemoteStore;
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
    async fn test_remote_primary_write_is_durable_on_remote() {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalStore::new(dir.path()).unwrap();
        let remote = MemoryRemoteStore::new();
        let store = TokenStore::remote_primary(local, remote.clone());

        store.upsert("conversations", record("c1")).await.unwrap();

        assert!(remote.get("conversations", "c1").await.is_ok());
        // Mirror also landed
        assert!(store.local().get("conversations", "c1").await.is_ok());
    }

    #[tokio::test]
    async fn test_remote_primary_fails_when_remote_rejects() {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalStore::new(dir.path()).unwrap();
        let remote = MemoryRemoteStore::new();
        remote.fail_next_writes(1);
        let store = TokenStore::remote_primary(local, remote);

        let result = store.upsert("conversations", record("c1")).await;

        assert!(result.is_err(), "Remote failure must fail the write");
        assert!(
            store.local().get("conversations", "c1").await.is_err(),
            "No local mirror write may happen before remote durability"
        );
    }

    #[tokio::test]
    async fn test_local_only_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::local_only(LocalStore::new(dir.path()).unwrap());

        store.upsert("conversations", record("c1")).await.unwrap();
        assert_eq!(store.get("conversations", "c1").await.unwrap().id(), "c1");
    }
}
