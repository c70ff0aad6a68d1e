//! Library persistence:
//! a crash-safe file-backed key/value store, one JSON file per collection,
//! written atomically via a temp-file-then-rename so a crash mid-write never
//! corrupts the on-disk library.

use crate::sequence::SequenceDefinition;
use crate::trigger::TriggerScript;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::warn;

/// Failures raised by a [`KeyValueStore`].
#[derive(Error, Debug)]
pub enum StoreError {
    /// The collection file couldn't be read or written.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The collection file's contents didn't parse.
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// A record with a stable library id, usable as a [`KeyValueStore`] element.
pub trait Identified {
    /// The record's library id, unique within its collection.
    fn id(&self) -> &str;
}

impl Identified for SequenceDefinition {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Identified for TriggerScript {
    fn id(&self) -> &str {
        &self.id
    }
}

/// A human-readable name bound to a device id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAlias {
    /// The device this alias names.
    pub device_id: String,
    /// The display name.
    pub alias: String,
}

impl Identified for DeviceAlias {
    fn id(&self) -> &str {
        &self.device_id
    }
}

/// Async CRUD surface over a persisted collection of `T`.
#[async_trait]
pub trait KeyValueStore<T>: Send + Sync {
    /// All records currently in the collection.
    async fn list(&self) -> Result<Vec<T>, StoreError>;
    /// A single record by id.
    async fn get(&self, id: &str) -> Result<Option<T>, StoreError>;
    /// Inserts or replaces a record.
    async fn set(&self, item: T) -> Result<(), StoreError>;
    /// Removes a record; returns whether one was present.
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;
    /// Atomically replaces the entire collection.
    async fn replace_all(&self, items: Vec<T>) -> Result<(), StoreError>;
}

/// A [`KeyValueStore`] backed by a single JSON file holding the whole
/// collection, guarded by an in-process lock and written atomically.
pub struct FileStore<T> {
    path: PathBuf,
    cache: RwLock<Vec<T>>,
}

impl<T> FileStore<T>
where
    T: Identified + Clone + Serialize + for<'de> Deserialize<'de> + Send + Sync,
{
    /// Loads (or lazily creates) the collection file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let items = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, cache: RwLock::new(items) })
    }

    async fn flush(&self, items: &[T]) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(items)?;
        let tmp = self.path.with_extension("tmp");
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl<T> KeyValueStore<T> for FileStore<T>
where
    T: Identified + Clone + Serialize + for<'de> Deserialize<'de> + Send + Sync,
{
    async fn list(&self) -> Result<Vec<T>, StoreError> {
        Ok(self.cache.read().await.clone())
    }

    async fn get(&self, id: &str) -> Result<Option<T>, StoreError> {
        Ok(self.cache.read().await.iter().find(|item| item.id() == id).cloned())
    }

    async fn set(&self, item: T) -> Result<(), StoreError> {
        let mut items = self.cache.write().await;
        match items.iter_mut().find(|existing| existing.id() == item.id()) {
            Some(slot) => *slot = item,
            None => items.push(item),
        }
        self.flush(&items).await
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut items = self.cache.write().await;
        let before = items.len();
        items.retain(|item| item.id() != id);
        let removed = items.len() != before;
        if removed {
            self.flush(&items).await?;
        }
        Ok(removed)
    }

    async fn replace_all(&self, new_items: Vec<T>) -> Result<(), StoreError> {
        self.flush(&new_items).await?;
        *self.cache.write().await = new_items;
        Ok(())
    }
}

/// A [`KeyValueStore`] backed by an in-process `Vec`, for tests and demos
/// that don't want the collection to outlive the process.
pub struct InMemoryStore<T> {
    items: RwLock<Vec<T>>,
}

impl<T> InMemoryStore<T> {
    /// An empty store.
    pub fn new() -> Self {
        Self { items: RwLock::new(Vec::new()) }
    }

    /// A store pre-populated with `items`.
    pub fn with_items(items: Vec<T>) -> Self {
        Self { items: RwLock::new(items) }
    }
}

impl<T> Default for InMemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> KeyValueStore<T> for InMemoryStore<T>
where
    T: Identified + Clone + Send + Sync,
{
    async fn list(&self) -> Result<Vec<T>, StoreError> {
        Ok(self.items.read().await.clone())
    }

    async fn get(&self, id: &str) -> Result<Option<T>, StoreError> {
        Ok(self.items.read().await.iter().find(|item| item.id() == id).cloned())
    }

    async fn set(&self, item: T) -> Result<(), StoreError> {
        let mut items = self.items.write().await;
        match items.iter_mut().find(|existing| existing.id() == item.id()) {
            Some(slot) => *slot = item,
            None => items.push(item),
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut items = self.items.write().await;
        let before = items.len();
        items.retain(|item| item.id() != id);
        Ok(items.len() != before)
    }

    async fn replace_all(&self, new_items: Vec<T>) -> Result<(), StoreError> {
        *self.items.write().await = new_items;
        Ok(())
    }
}

/// Bridges the sequence library store to [`crate::trigger::SequenceSource`]
/// so the trigger engine can resolve `startSequence` actions without a
/// compile-time dependency on [`super::router`].
pub struct SequenceLibrarySource<S> {
    store: std::sync::Arc<S>,
}

impl<S> SequenceLibrarySource<S> {
    /// Wraps a sequence library store for injection into the trigger engine.
    pub fn new(store: std::sync::Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S> crate::trigger::SequenceSource for SequenceLibrarySource<S>
where
    S: KeyValueStore<SequenceDefinition>,
{
    async fn get(&self, id: &str) -> Option<SequenceDefinition> {
        match self.store.get(id).await {
            Ok(def) => def,
            Err(e) => {
                warn!(error = %e, sequence_id = id, "failed to read sequence library while resolving trigger action");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::Waveform;
    use tempfile::tempdir;

    fn def(id: &str) -> SequenceDefinition {
        SequenceDefinition {
            id: id.to_string(),
            name: "ramp".to_string(),
            unit: crate::sequence::Unit::A,
            waveform: Waveform::Standard {
                shape: crate::sequence::StandardType::Triangle,
                min: 0.0,
                max: 1.0,
                points_per_cycle: 10,
                interval_ms: 100,
            },
            pre_value: None,
            post_value: None,
            scale: None,
            offset: None,
            min_clamp: None,
            max_clamp: None,
            max_slew_rate: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path().join("sequences.json")).await.unwrap();
        store.set(def("ramp-1")).await.unwrap();
        let found = store.get("ramp-1").await.unwrap();
        assert_eq!(found.unwrap().id, "ramp-1");
    }

    #[tokio::test]
    async fn delete_reports_whether_a_record_was_present() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path().join("sequences.json")).await.unwrap();
        store.set(def("ramp-1")).await.unwrap();
        assert!(store.delete("ramp-1").await.unwrap());
        assert!(!store.delete("ramp-1").await.unwrap());
    }

    #[tokio::test]
    async fn reopening_the_same_file_recovers_persisted_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sequences.json");
        {
            let store = FileStore::open(&path).await.unwrap();
            store.set(def("ramp-1")).await.unwrap();
        }
        let reopened: FileStore<SequenceDefinition> = FileStore::open(&path).await.unwrap();
        assert_eq!(reopened.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn in_memory_store_supports_the_same_crud_surface() {
        let store = InMemoryStore::new();
        store.set(def("ramp-1")).await.unwrap();
        store.set(def("ramp-2")).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 2);
        assert!(store.delete("ramp-1").await.unwrap());
        assert!(store.get("ramp-1").await.unwrap().is_none());
        store.replace_all(vec![def("ramp-3")]).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sequence_library_source_resolves_via_the_store() {
        let dir = tempdir().unwrap();
        let store = std::sync::Arc::new(FileStore::open(dir.path().join("sequences.json")).await.unwrap());
        store.set(def("ramp-1")).await.unwrap();
        let source = SequenceLibrarySource::new(store);
        use crate::trigger::SequenceSource;
        assert!(source.get("ramp-1").await.is_some());
        assert!(source.get("missing").await.is_none());
    }
}
