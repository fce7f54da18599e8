//! Typed access to instance records in the persistent store.

use std::sync::Arc;

use bytes::Bytes;

use keel_core::{InstanceId, PersistentStore, keys};

use crate::error::Result;
use crate::instance::Instance;

/// JSON-encoded instance records keyed by `instance:<id>`.
#[derive(Clone)]
pub struct InstanceRepository {
    store: Arc<dyn PersistentStore>,
}

impl std::fmt::Debug for InstanceRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRepository").finish_non_exhaustive()
    }
}

impl InstanceRepository {
    /// Creates a repository over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn PersistentStore>) -> Self {
        Self { store }
    }

    /// Reads one instance record.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails or the record cannot be decoded.
    pub async fn get(&self, instance_id: &InstanceId) -> Result<Option<Instance>> {
        let Some(bytes) = self.store.get(&keys::instance(instance_id)).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Reads one instance record, treating an undecodable record as absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn get_decodable(&self, instance_id: &InstanceId) -> Result<Option<Instance>> {
        let Some(bytes) = self.store.get(&keys::instance(instance_id)).await? else {
            return Ok(None);
        };
        Ok(decode_or_skip(instance_id, &bytes))
    }

    /// Replaces the record of `instance`.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the store write fails.
    pub async fn store(&self, instance: &Instance) -> Result<()> {
        let bytes = Bytes::from(serde_json::to_vec(instance)?);
        self.store
            .update(&keys::instance(&instance.instance_id), bytes)
            .await?;
        Ok(())
    }

    /// Deletes the record of `instance_id`. Absent records are not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the store delete fails.
    pub async fn delete(&self, instance_id: &InstanceId) -> Result<()> {
        self.store.delete(&keys::instance(instance_id)).await?;
        Ok(())
    }

    /// Lists the ids of every persisted instance.
    ///
    /// Keys that do not parse as instance ids are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the store listing fails.
    pub async fn ids(&self) -> Result<Vec<InstanceId>> {
        let raw = self.store.all_ids(keys::INSTANCE_PREFIX).await?;
        Ok(raw
            .into_iter()
            .filter_map(|id| match id.parse::<InstanceId>() {
                Ok(parsed) => Some(parsed),
                Err(err) => {
                    tracing::warn!(key = %id, error = %err, "skipping unparsable instance key");
                    None
                }
            })
            .collect())
    }

    /// Loads every persisted instance.
    ///
    /// Records that fail to decode are logged and skipped, as are records
    /// deleted between listing and reading.
    ///
    /// # Errors
    ///
    /// Returns an error if the store listing or a read fails.
    pub async fn all(&self) -> Result<Vec<Instance>> {
        let ids = self.ids().await?;
        let mut instances = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(instance) = self.get_decodable(&id).await? {
                instances.push(instance);
            }
        }
        Ok(instances)
    }
}

fn decode_or_skip(instance_id: &InstanceId, bytes: &[u8]) -> Option<Instance> {
    match serde_json::from_slice(bytes) {
        Ok(instance) => Some(instance),
        Err(err) => {
            tracing::warn!(%instance_id, error = %err, "skipping undecodable instance record");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use keel_core::{MemoryStore, PathId, TaskId};

    use super::*;
    use crate::instance::{AgentInfo, Task};

    fn instance(spec: &str) -> Instance {
        let spec: PathId = spec.parse().unwrap();
        let id = InstanceId::for_spec(&spec);
        let now = Utc::now();
        let task = Task::launched_ephemeral(TaskId::for_instance(&id), now, now);
        Instance::new(id, AgentInfo::on_host("agent-1"), [task], now, now)
    }

    #[tokio::test]
    async fn store_get_delete() -> Result<()> {
        let repo = InstanceRepository::new(Arc::new(MemoryStore::new()));
        let web = instance("/web");

        repo.store(&web).await?;
        assert_eq!(repo.get(&web.instance_id).await?, Some(web.clone()));

        repo.delete(&web.instance_id).await?;
        assert_eq!(repo.get(&web.instance_id).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn all_skips_foreign_keys() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        store
            .update("instance:not-an-instance", Bytes::from_static(b"{}"))
            .await?;
        let repo = InstanceRepository::new(store);
        let a = instance("/a");
        let b = instance("/b/c");
        repo.store(&a).await?;
        repo.store(&b).await?;

        let mut ids = repo.ids().await?;
        ids.sort();
        let mut expected = vec![a.instance_id.clone(), b.instance_id.clone()];
        expected.sort();
        assert_eq!(ids, expected);
        assert_eq!(repo.all().await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn undecodable_records_are_skipped_by_lenient_reads() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let repo = InstanceRepository::new(store.clone());
        let good = instance("/web");
        let broken = instance("/web").instance_id;
        repo.store(&good).await?;
        store
            .update(&keys::instance(&broken), Bytes::from_static(b"garbage"))
            .await?;

        assert!(repo.get(&broken).await.is_err());
        assert_eq!(repo.get_decodable(&broken).await?, None);
        assert_eq!(repo.all().await?, vec![good]);
        Ok(())
    }
}
