//! Store implementation with operation tracing.
//!
//! Records every call for assertions on write discipline.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use keel_core::error::{Error, Result};
use keel_core::storage::PersistentStore;

/// Record of a store call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// Read of one key.
    Get {
        /// Key that was read.
        key: String,
    },
    /// Whole-value replacement.
    Update {
        /// Key that was written.
        key: String,
        /// Size of the written value.
        size: usize,
    },
    /// Deletion of one key.
    Delete {
        /// Key that was deleted.
        key: String,
    },
    /// Listing by prefix.
    AllIds {
        /// Prefix that was listed.
        prefix: String,
    },
}

/// In-memory [`PersistentStore`] with operation tracing.
#[derive(Debug, Clone, Default)]
pub struct TracingMemoryStore {
    data: Arc<Mutex<BTreeMap<String, Bytes>>>,
    operations: Arc<Mutex<Vec<StoreOp>>>,
    fail_keys: Arc<Mutex<Vec<String>>>,
    latency: Option<Duration>,
    commit_latency: Option<Duration>,
}

impl TracingMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that sleeps `latency` before every call.
    #[must_use]
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Creates a store whose writes apply at once but only return after
    /// `latency`, like a commit whose acknowledgement is slow.
    #[must_use]
    pub fn with_commit_latency(latency: Duration) -> Self {
        Self {
            commit_latency: Some(latency),
            ..Self::default()
        }
    }

    /// Returns all recorded operations.
    #[must_use]
    pub fn operations(&self) -> Vec<StoreOp> {
        self.operations.lock().expect("lock").clone()
    }

    /// Clears recorded operations.
    pub fn clear_operations(&self) {
        self.operations.lock().expect("lock").clear();
    }

    /// Number of recorded updates.
    #[must_use]
    pub fn updates(&self) -> usize {
        self.count(|op| matches!(op, StoreOp::Update { .. }))
    }

    /// Number of recorded deletes.
    #[must_use]
    pub fn deletes(&self) -> usize {
        self.count(|op| matches!(op, StoreOp::Delete { .. }))
    }

    /// Number of recorded updates and deletes.
    #[must_use]
    pub fn writes(&self) -> usize {
        self.updates() + self.deletes()
    }

    /// Makes every call on keys starting with `prefix` fail.
    pub fn inject_failure(&self, prefix: impl Into<String>) {
        self.fail_keys.lock().expect("lock").push(prefix.into());
    }

    /// Clears all injected failures.
    pub fn clear_failures(&self) {
        self.fail_keys.lock().expect("lock").clear();
    }

    /// Returns all stored keys.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.data.lock().expect("lock").keys().cloned().collect()
    }

    fn count(&self, pred: impl Fn(&StoreOp) -> bool) -> usize {
        self.operations
            .lock()
            .expect("lock")
            .iter()
            .filter(|op| pred(op))
            .count()
    }

    fn record(&self, op: StoreOp) {
        self.operations.lock().expect("lock").push(op);
    }

    fn check_failure(&self, key: &str) -> Result<()> {
        let fail_keys = self.fail_keys.lock().expect("lock");
        if fail_keys.iter().any(|prefix| key.starts_with(prefix)) {
            return Err(Error::storage(format!("injected failure for key: {key}")));
        }
        Ok(())
    }

    async fn maybe_delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    async fn acknowledge(&self) {
        if let Some(latency) = self.commit_latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait::async_trait]
impl PersistentStore for TracingMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.maybe_delay().await;
        self.check_failure(key)?;
        self.record(StoreOp::Get {
            key: key.to_string(),
        });
        Ok(self.data.lock().expect("lock").get(key).cloned())
    }

    async fn update(&self, key: &str, value: Bytes) -> Result<()> {
        self.maybe_delay().await;
        self.check_failure(key)?;
        self.record(StoreOp::Update {
            key: key.to_string(),
            size: value.len(),
        });
        self.data.lock().expect("lock").insert(key.to_string(), value);
        self.acknowledge().await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.maybe_delay().await;
        self.check_failure(key)?;
        self.record(StoreOp::Delete {
            key: key.to_string(),
        });
        self.data.lock().expect("lock").remove(key);
        self.acknowledge().await;
        Ok(())
    }

    async fn all_ids(&self, prefix: &str) -> Result<Vec<String>> {
        self.maybe_delay().await;
        self.check_failure(prefix)?;
        self.record(StoreOp::AllIds {
            prefix: prefix.to_string(),
        });
        let data = self.data.lock().expect("lock");
        Ok(data
            .keys()
            .filter_map(|key| key.strip_prefix(prefix))
            .map(str::to_string)
            .collect())
    }
}
