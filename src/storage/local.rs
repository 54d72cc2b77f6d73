//! Local JSON file store.
//!
//! One JSON array per collection under a known directory, read whole and
//! rewritten whole. In-process writers serialize on a per-collection mutex;
//! cross-process writers are excluded by an OS file lock held for the whole
//! read-modify-write.

use crate::error::StorageError;
use crate::logging::{log_debug, log_warn};
use crate::records::StoredRecord;
use fs2::FileExt;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// File-backed store of JSON-array collections.
///
/// Collections are created lazily on first write. Records are keyed by
/// [`StoredRecord::id`]; an upsert replaces any record with the same id.
#[derive(Debug, Clone)]
pub struct LocalStore {
    dir: PathBuf,
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl LocalStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| StorageError::unavailable(format!("cannot create {dir:?}: {e}")))?;
        Ok(Self {
            dir,
            locks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn collection_path(&self, collection: &str) -> PathBuf {
        self.dir.join(format!("{collection}.json"))
    }

    async fn collection_lock(&self, collection: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(collection.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Read an entire collection. A missing file is an empty collection.
    pub async fn read_all(&self, collection: &str) -> Result<Vec<StoredRecord>, StorageError> {
        let path = self.collection_path(collection);
        let collection = collection.to_string();
        tokio::task::spawn_blocking(move || read_records(&path, &collection))
            .await
            .map_err(|e| StorageError::unavailable(format!("read task failed: {e}")))?
    }

    /// Fetch one record by id.
    pub async fn get(&self, collection: &str, id: &str) -> Result<StoredRecord, StorageError> {
        self.read_all(collection)
            .await?
            .into_iter()
            .find(|r| r.id() == id)
            .ok_or_else(|| StorageError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })
    }

    /// Insert or replace a record, rewriting the collection file under lock.
    pub async fn upsert(
        &self,
        collection: &str,
        record: StoredRecord,
    ) -> Result<(), StorageError> {
        self.rewrite(collection, move |records| {
            records.retain(|r| r.id() != record.id());
            records.push(record);
        })
        .await
    }

    /// Delete a record by id. Deleting a missing id is a no-op.
    pub async fn delete(&self, collection: &str, id: &str) -> Result<(), StorageError> {
        let id = id.to_string();
        self.rewrite(collection, move |records| {
            records.retain(|r| r.id() != id);
        })
        .await
    }

    /// Replace the entire collection (batch corpus swaps).
    pub async fn replace_all(
        &self,
        collection: &str,
        new_records: Vec<StoredRecord>,
    ) -> Result<(), StorageError> {
        self.rewrite(collection, move |records| {
            *records = new_records;
        })
        .await
    }

    async fn rewrite<F>(&self, collection: &str, mutate: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut Vec<StoredRecord>) + Send + 'static,
    {
        let lock = self.collection_lock(collection).await;
        let _guard = lock.lock().await;

        let path = self.collection_path(collection);
        let collection = collection.to_string();
        tokio::task::spawn_blocking(move || rewrite_locked(&path, &collection, mutate))
            .await
            .map_err(|e| StorageError::unavailable(format!("rewrite task failed: {e}")))?
    }
}

fn read_records(path: &Path, collection: &str) -> Result<Vec<StoredRecord>, StorageError> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(StorageError::unavailable(format!(
                "cannot open {collection}: {e}"
            )))
        }
    };

    file.lock_shared()
        .map_err(|e| StorageError::unavailable(format!("cannot lock {collection}: {e}")))?;
    let mut raw = String::new();
    let result = file.read_to_string(&mut raw);
    let _ = fs2::FileExt::unlock(&file);
    result.map_err(|e| StorageError::unavailable(format!("cannot read {collection}: {e}")))?;

    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }

    serde_json::from_str(&raw).map_err(|e| {
        log_warn!(
            collection = collection,
            error = %e,
            "Local collection holds malformed JSON"
        );
        StorageError::unavailable(format!("malformed collection {collection}: {e}"))
    })
}

fn rewrite_locked<F>(path: &Path, collection: &str, mutate: F) -> Result<(), StorageError>
where
    F: FnOnce(&mut Vec<StoredRecord>),
{
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| StorageError::unavailable(format!("cannot open {collection}: {e}")))?;

    // A writer elsewhere holding the lock means a concurrent rewrite.
    if file.try_lock_exclusive().is_err() {
        file.lock_exclusive().map_err(|_| StorageError::Conflict {
            collection: collection.to_string(),
        })?;
    }

    let result = (|| {
        let mut raw = String::new();
        file.read_to_string(&mut raw)
            .map_err(|e| StorageError::unavailable(format!("cannot read {collection}: {e}")))?;
        let mut records: Vec<StoredRecord> = if raw.trim().is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&raw).map_err(|_| StorageError::Conflict {
                collection: collection.to_string(),
            })?
        };

        mutate(&mut records);

        let serialized = serde_json::to_string_pretty(&records)
            .map_err(|e| StorageError::unavailable(format!("cannot serialize: {e}")))?;
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.set_len(0))
            .and_then(|_| file.write_all(serialized.as_bytes()))
            .and_then(|_| file.flush())
            .map_err(|e| StorageError::unavailable(format!("cannot write {collection}: {e}")))?;

        log_debug!(
            collection = collection,
            records = records.len(),
            "Local collection rewritten"
        );
        Ok(())
    })();

    let _ = fs2::FileExt::unlock(&file);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{Conversation, StoredRecord};
    use chrono::{DateTime, Utc};

    fn conversation(id: &str) -> StoredRecord {
        let timestamp: DateTime<Utc> = DateTime::parse_from_rfc3339("2026-01-15T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        StoredRecord::Conversation(Conversation {
            id: id.to_string(),
            user_id: "u1".to_string(),
            session_id: "s1".to_string(),
            timestamp,
            question: "What is my duty?".to_string(),
            response: "Act without attachment.".to_string(),
            citations: vec!["Bhagavad Gita 2.47".to_string()],
            personality: "krishna".to_string(),
        })
    }

    #[tokio::test]
    async fn test_upsert_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();

        store
            .upsert("conversations", conversation("c1"))
            .await
            .unwrap();

        let got = store.get("conversations", "c1").await.unwrap();
        assert_eq!(got, conversation("c1"));
    }

    #[tokio::test]
    async fn test_missing_collection_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();

        let records = store.read_all("conversations").await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_get_missing_record_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();

        let err = store.get("conversations", "absent").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_upsert_replaces_same_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();

        store
            .upsert("conversations", conversation("c1"))
            .await
            .unwrap();
        store
            .upsert("conversations", conversation("c1"))
            .await
            .unwrap();

        let records = store.read_all("conversations").await.unwrap();
        assert_eq!(records.len(), 1, "Upsert must replace, not append");
    }

    #[tokio::test]
    async fn test_concurrent_writers_serialize() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();

        let mut handles = Vec::new();
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .upsert("conversations", conversation(&format!("c{i}")))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let records = store.read_all("conversations").await.unwrap();
        assert_eq!(records.len(), 10, "Every serialized write must survive");
    }

    #[tokio::test]
    async fn test_delete_removes_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();

        store
            .upsert("conversations", conversation("c1"))
            .await
            .unwrap();
        store.delete("conversations", "c1").await.unwrap();

        assert!(store.get("conversations", "c1").await.is_err());
    }
}
