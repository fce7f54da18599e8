//! Instance state tracking.
//!
//! [`InstanceTracker`] is the entry point: it routes mutations through the
//! [`InstanceStateOpProcessor`](processor) and answers queries from an
//! in-memory [`InstancesBySpec`] index derived from processor outcomes.
//!
//! ## Query Freshness
//!
//! - `*_sync` queries read the last published index. A caller that awaited
//!   [`InstanceTracker::process`] observes its own write.
//! - Async twins first wait for every mutation already in flight, so they
//!   also observe writes submitted concurrently by other callers.

mod index;
mod processor;
mod repository;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use keel_core::{InstanceId, PathId, PersistentStore};

use crate::callbacks::PrePostDriverCallback;
use crate::error::{Error, Result};
use crate::instance::{Instance, InstanceUpdateEffect, InstanceUpdateOperation};

pub use index::{InstanceChange, InstancesBySpec, SpecInstances};
pub use repository::InstanceRepository;

use index::SharedIndex;
use processor::InstanceStateOpProcessor;

const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Tracks the state of every instance.
///
/// Cloning is cheap; clones share the processor and index.
#[derive(Debug, Clone)]
pub struct InstanceTracker {
    processor: Arc<InstanceStateOpProcessor>,
    index: Arc<SharedIndex>,
    startup_timeout: Duration,
}

impl InstanceTracker {
    /// Creates a tracker over `store` with an empty index.
    ///
    /// Call [`InstanceTracker::reload`] (or let the scheduler do so before the
    /// driver starts) to load persisted instances.
    #[must_use]
    pub fn new(store: Arc<dyn PersistentStore>) -> Self {
        let index = Arc::new(SharedIndex::new());
        let processor = InstanceStateOpProcessor::new(
            InstanceRepository::new(store),
            Arc::clone(&index),
        );
        Self {
            processor: Arc::new(processor),
            index,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
        }
    }

    /// Sets the bound for loading the index when the driver starts.
    #[must_use]
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Applies a mutation and returns its effect.
    ///
    /// The index reflects the effect by the time this returns. Dropping the
    /// future does not cancel the operation; fresh queries still wait for it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InstanceNotFound`] when an update targets an instance
    /// with no persisted record, [`Error::TaskNotFound`] when a status names
    /// an unknown task, or the store error that aborted the write.
    pub async fn process(&self, op: InstanceUpdateOperation) -> Result<InstanceUpdateEffect> {
        self.processor.process(op).await
    }

    /// Looks an instance up in the current index.
    #[must_use]
    pub fn instance(&self, instance_id: &InstanceId) -> Option<Instance> {
        self.index.snapshot().instance(instance_id).cloned()
    }

    /// Looks an instance up after in-flight mutations complete.
    pub async fn instance_async(&self, instance_id: &InstanceId) -> Option<Instance> {
        self.processor.settle().await;
        self.instance(instance_id)
    }

    /// Returns the current index.
    #[must_use]
    pub fn instances_by_spec_sync(&self) -> Arc<InstancesBySpec> {
        self.index.snapshot()
    }

    /// Returns the index after in-flight mutations complete.
    pub async fn instances_by_spec(&self) -> Arc<InstancesBySpec> {
        self.processor.settle().await;
        self.index.snapshot()
    }

    /// Returns the instances of a spec from the current index.
    #[must_use]
    pub fn spec_instances_sync(&self, spec_id: &PathId) -> Vec<Instance> {
        self.index.snapshot().spec_instances(spec_id)
    }

    /// Returns the instances of a spec after in-flight mutations complete.
    pub async fn spec_instances(&self, spec_id: &PathId) -> Vec<Instance> {
        self.processor.settle().await;
        self.spec_instances_sync(spec_id)
    }

    /// Counts the instances of a spec that have a launched task.
    #[must_use]
    pub fn count_launched_spec_instances_sync(&self, spec_id: &PathId) -> usize {
        self.index.snapshot().count_launched_spec_instances(spec_id)
    }

    /// Counts every instance of a spec, reserved ones included.
    #[must_use]
    pub fn count_spec_instances_sync(&self, spec_id: &PathId) -> usize {
        self.index.snapshot().spec(spec_id).map_or(0, SpecInstances::len)
    }

    /// Returns true if the spec has at least one instance.
    #[must_use]
    pub fn has_spec_instances_sync(&self, spec_id: &PathId) -> bool {
        self.index.snapshot().has_spec_instances(spec_id)
    }

    /// Subscribes to index changes. Noop effects are not published.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<InstanceChange> {
        self.index.subscribe()
    }

    /// Rebuilds the index from the store and returns the number of loaded
    /// instances.
    ///
    /// Mutations wait until the rebuild completes.
    ///
    /// # Errors
    ///
    /// Returns an error if listing or reading records fails; the previous
    /// index stays in place.
    #[tracing::instrument(skip(self))]
    pub async fn reload(&self) -> Result<usize> {
        let _exclusive = self.processor.exclusive().await;
        let instances = self.processor.repository().all().await?;
        let index = InstancesBySpec::from_instances(instances);
        let loaded = index.len();
        self.index.replace(index);
        tracing::info!(instances = loaded, "instance index loaded");
        Ok(loaded)
    }
}

#[async_trait]
impl PrePostDriverCallback for InstanceTracker {
    async fn pre_driver_starts(&self) -> Result<()> {
        tokio::time::timeout(self.startup_timeout, self.reload())
            .await
            .map_err(|_| Error::Timeout {
                operation: "instance index load",
                after: self.startup_timeout,
            })??;
        Ok(())
    }

    async fn post_driver_terminates(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "instance-tracker"
    }
}
