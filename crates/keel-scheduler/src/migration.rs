//! Schema migration run at the start of every leadership term.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use keel_core::{PersistentStore, keys};

use crate::error::{Error, Result};

/// Version of the persisted schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StorageVersion {
    /// Major version; incompatible layout changes.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
    /// Patch version.
    pub patch: u32,
}

impl StorageVersion {
    /// The schema version written by this build.
    pub const CURRENT: Self = Self::new(1, 0, 0);

    /// Creates a version.
    #[must_use]
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for StorageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Brings the persisted schema up to date.
#[async_trait]
pub trait Migration: Send + Sync {
    /// Runs the migration and returns the resulting schema version.
    ///
    /// # Errors
    ///
    /// Any error is fatal to the leadership term that triggered it.
    async fn migrate(&self) -> Result<StorageVersion>;
}

/// [`Migration`] that records the schema version and refuses downgrades.
pub struct StorageVersionMigration {
    store: Arc<dyn PersistentStore>,
    current: StorageVersion,
}

impl StorageVersionMigration {
    /// Creates a migration to [`StorageVersion::CURRENT`].
    #[must_use]
    pub fn new(store: Arc<dyn PersistentStore>) -> Self {
        Self::to_version(store, StorageVersion::CURRENT)
    }

    /// Creates a migration to `current`.
    #[must_use]
    pub fn to_version(store: Arc<dyn PersistentStore>, current: StorageVersion) -> Self {
        Self { store, current }
    }

    /// Reads the persisted version, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails or the record is malformed.
    pub async fn stored_version(&self) -> Result<Option<StorageVersion>> {
        match self.store.get(keys::STORAGE_VERSION).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Migration for StorageVersionMigration {
    #[tracing::instrument(skip(self), fields(target = %self.current))]
    async fn migrate(&self) -> Result<StorageVersion> {
        match self.stored_version().await? {
            Some(stored) if stored > self.current => Err(Error::MigrationFailed(Box::new(
                Error::configuration(format!(
                    "stored schema {stored} is newer than supported {}",
                    self.current
                )),
            ))),
            Some(stored) if stored == self.current => {
                tracing::debug!(version = %stored, "schema up to date");
                Ok(stored)
            }
            stored => {
                let bytes = Bytes::from(serde_json::to_vec(&self.current)?);
                self.store.update(keys::STORAGE_VERSION, bytes).await?;
                tracing::info!(
                    from = ?stored.map(|v| v.to_string()),
                    to = %self.current,
                    "schema migrated"
                );
                Ok(self.current)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use keel_core::MemoryStore;

    use super::*;

    #[tokio::test]
    async fn fresh_store_is_stamped() -> Result<()> {
        let store: Arc<dyn PersistentStore> = Arc::new(MemoryStore::new());
        let migration = StorageVersionMigration::new(Arc::clone(&store));

        assert_eq!(migration.stored_version().await?, None);
        assert_eq!(migration.migrate().await?, StorageVersion::CURRENT);
        assert_eq!(migration.stored_version().await?, Some(StorageVersion::CURRENT));
        assert_eq!(migration.migrate().await?, StorageVersion::CURRENT);
        Ok(())
    }

    #[tokio::test]
    async fn older_schema_is_upgraded() -> Result<()> {
        let store: Arc<dyn PersistentStore> = Arc::new(MemoryStore::new());
        StorageVersionMigration::to_version(Arc::clone(&store), StorageVersion::new(0, 9, 0))
            .migrate()
            .await?;

        let migration = StorageVersionMigration::to_version(store, StorageVersion::new(1, 2, 0));
        assert_eq!(migration.migrate().await?, StorageVersion::new(1, 2, 0));
        Ok(())
    }

    #[tokio::test]
    async fn newer_schema_is_refused() -> Result<()> {
        let store: Arc<dyn PersistentStore> = Arc::new(MemoryStore::new());
        StorageVersionMigration::to_version(Arc::clone(&store), StorageVersion::new(2, 0, 0))
            .migrate()
            .await?;

        let err = StorageVersionMigration::new(store).migrate().await.unwrap_err();
        assert!(matches!(err, Error::MigrationFailed(_)));
        assert!(err.to_string().contains("newer than supported"));
        Ok(())
    }
}
