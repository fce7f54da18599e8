//! Persisted framework identity.

use std::sync::Arc;

use bytes::Bytes;

use keel_core::{FrameworkId, PersistentStore, keys};

use crate::error::Result;

/// Reads and writes the framework id record.
#[derive(Clone)]
pub struct FrameworkIdRepository {
    store: Arc<dyn PersistentStore>,
}

impl FrameworkIdRepository {
    /// Creates a repository over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn PersistentStore>) -> Self {
        Self { store }
    }

    /// Reads the framework id. Every call goes to the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or the record is not UTF-8.
    pub async fn get(&self) -> Result<Option<FrameworkId>> {
        let Some(bytes) = self.store.get(keys::FRAMEWORK_ID).await? else {
            return Ok(None);
        };
        let id = std::str::from_utf8(&bytes).map_err(|err| keel_core::Error::Serialization {
            message: format!("framework id is not UTF-8: {err}"),
        })?;
        Ok(Some(FrameworkId::new(id)))
    }

    /// Stores the framework id.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn store(&self, id: &FrameworkId) -> Result<()> {
        self.store
            .update(keys::FRAMEWORK_ID, Bytes::copy_from_slice(id.as_str().as_bytes()))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use keel_core::MemoryStore;

    use super::*;

    #[tokio::test]
    async fn reads_back_stored_id() -> Result<()> {
        let store: Arc<dyn PersistentStore> = Arc::new(MemoryStore::new());
        let repo = FrameworkIdRepository::new(Arc::clone(&store));
        assert_eq!(repo.get().await?, None);

        repo.store(&FrameworkId::new("fw-1")).await?;
        assert_eq!(repo.get().await?, Some(FrameworkId::new("fw-1")));

        store
            .update(keys::FRAMEWORK_ID, Bytes::from_static(b"fw-2"))
            .await?;
        assert_eq!(repo.get().await?, Some(FrameworkId::new("fw-2")));
        Ok(())
    }
}
