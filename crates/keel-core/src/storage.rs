//! Persistence contract consumed by the scheduler core.
//!
//! The store is an ordered key/value map with whole-value replacement. The
//! engine behind it (ZooKeeper, etcd, a database) is an external collaborator;
//! keel only relies on the four operations of [`PersistentStore`].
//!
//! [`MemoryStore`] is a process-local implementation for tests and
//! single-node development.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{Error, Result};

/// Ordered key/value persistence used for instance and framework records.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` so one store can be shared by every
/// scheduler component.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// Reads the value stored under `key`, or `None` when absent.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Stores `value` under `key`, replacing any previous value.
    async fn update(&self, key: &str, value: Bytes) -> Result<()>;

    /// Removes `key`. Deleting an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Lists the ids of every key starting with `prefix`, with the prefix
    /// stripped, in key order.
    async fn all_ids(&self, prefix: &str) -> Result<Vec<String>>;
}

/// In-memory [`PersistentStore`].
///
/// ## Limitations
///
/// - **NOT suitable for production**: no durability
/// - **Single-process only**: state is not shared across processes
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Bytes>>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored keys.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.entries.read().map_err(poison_err)?.len())
    }

    /// Returns true when no keys are stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let entries = self.entries.read().map_err(poison_err)?;
        Ok(entries.get(key).cloned())
    }

    async fn update(&self, key: &str, value: Bytes) -> Result<()> {
        self.entries
            .write()
            .map_err(poison_err)?
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().map_err(poison_err)?.remove(key);
        Ok(())
    }

    async fn all_ids(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.entries.read().map_err(poison_err)?;
        let ids = entries
            .range(prefix.to_string()..)
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(prefix))
            .map(|key| key[prefix.len()..].to_string())
            .collect();
        Ok(ids)
    }
}

/// Well-known key layout of the persistent store.
pub mod keys {
    /// Prefix of every instance record; the instance id follows it.
    pub const INSTANCE_PREFIX: &str = "instance:";
    /// Key of the framework id record.
    pub const FRAMEWORK_ID: &str = "framework:id";
    /// Key of the persisted schema version.
    pub const STORAGE_VERSION: &str = "storage:version";

    /// Returns the record key of an instance.
    #[must_use]
    pub fn instance(instance_id: &impl std::fmt::Display) -> String {
        format!("{INSTANCE_PREFIX}{instance_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn update_get_delete() -> Result<()> {
        let store = MemoryStore::new();
        assert_eq!(store.get("instance:a").await?, None);

        store.update("instance:a", Bytes::from_static(b"v1")).await?;
        store.update("instance:a", Bytes::from_static(b"v2")).await?;
        assert_eq!(store.get("instance:a").await?, Some(Bytes::from_static(b"v2")));

        store.delete("instance:a").await?;
        store.delete("instance:a").await?;
        assert!(store.is_empty()?);
        Ok(())
    }

    #[tokio::test]
    async fn all_ids_strips_prefix_and_filters() -> Result<()> {
        let store = MemoryStore::new();
        store.update("framework:id", Bytes::from_static(b"fw")).await?;
        store.update("instance:b", Bytes::new()).await?;
        store.update("instance:a", Bytes::new()).await?;
        store.update("instancez", Bytes::new()).await?;

        let ids = store.all_ids(keys::INSTANCE_PREFIX).await?;
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
        Ok(())
    }
}
