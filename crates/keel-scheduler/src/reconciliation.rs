//! Periodic jobs started for each leadership term.

use std::sync::Arc;

use async_trait::async_trait;

use crate::driver::SchedulerDriver;
use crate::error::Result;
use crate::instance::RawTaskStatus;
use crate::timer::PeriodicJob;
use crate::tracker::{InstanceTracker, InstancesBySpec};

/// Explicit then implicit task reconciliation against the offer source.
///
/// Sends the last known raw status of every live launched task, followed by
/// an empty request asking the offer source for everything it knows.
pub struct TaskReconciliationJob {
    tracker: InstanceTracker,
    driver: Arc<dyn SchedulerDriver>,
}

impl TaskReconciliationJob {
    /// Creates a job reconciling through `driver`.
    #[must_use]
    pub fn new(tracker: InstanceTracker, driver: Arc<dyn SchedulerDriver>) -> Self {
        Self { tracker, driver }
    }

    fn known_statuses(index: &InstancesBySpec) -> Vec<RawTaskStatus> {
        index
            .all_instances()
            .flat_map(|instance| instance.tasks.values())
            .filter(|task| !task.is_terminal())
            .filter_map(|task| task.status().and_then(|status| status.raw.clone()))
            .collect()
    }
}

#[async_trait]
impl PeriodicJob for TaskReconciliationJob {
    fn name(&self) -> &'static str {
        "task-reconciliation"
    }

    async fn run(&self) -> Result<()> {
        let index = self.tracker.instances_by_spec().await;
        let statuses = Self::known_statuses(&index);
        tracing::info!(tasks = statuses.len(), "reconciling tasks");
        self.driver.reconcile_tasks(&statuses)?;
        self.driver.reconcile_tasks(&[])?;
        Ok(())
    }
}

/// Decides whether specs need more or fewer instances.
#[async_trait]
pub trait ScaleCheck: Send + Sync {
    /// Inspects the current instances.
    ///
    /// # Errors
    ///
    /// Errors are logged by the calling job.
    async fn check_scale(&self, instances: &InstancesBySpec) -> Result<()>;
}

/// [`ScaleCheck`] that only reports instance counts.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingScaleCheck;

#[async_trait]
impl ScaleCheck for LoggingScaleCheck {
    async fn check_scale(&self, instances: &InstancesBySpec) -> Result<()> {
        for bucket in instances.spec_map().values() {
            tracing::debug!(
                spec_id = %bucket.spec_id(),
                instances = bucket.len(),
                launched = bucket.launched_count(),
                "scale check"
            );
        }
        Ok(())
    }
}

/// Hands the current index to a [`ScaleCheck`].
pub struct ScaleCheckJob {
    tracker: InstanceTracker,
    checker: Arc<dyn ScaleCheck>,
}

impl ScaleCheckJob {
    /// Creates a job consulting `checker`.
    #[must_use]
    pub fn new(tracker: InstanceTracker, checker: Arc<dyn ScaleCheck>) -> Self {
        Self { tracker, checker }
    }
}

#[async_trait]
impl PeriodicJob for ScaleCheckJob {
    fn name(&self) -> &'static str {
        "scale-check"
    }

    async fn run(&self) -> Result<()> {
        let index = self.tracker.instances_by_spec().await;
        self.checker.check_scale(&index).await
    }
}
