//! Update operations and their effects.
//!
//! Every mutation of instance state is expressed as an
//! [`InstanceUpdateOperation`]. The processor dispatches on the closed enum
//! with exhaustive matches, so a new operation kind cannot be added without
//! deciding how it writes to the store.

use chrono::{DateTime, Utc};

use keel_core::InstanceId;

use super::{Instance, Launched, RawTaskStatus, TaskStatus};
use crate::error::{Error, Result};

/// A mutating intent targeting exactly one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceUpdateOperation {
    /// Create (or overwrite) an instance launched without reservations.
    LaunchEphemeral(Instance),
    /// Fold a status reported by the offer source into the persisted instance.
    MesosUpdate {
        /// The caller's view of the instance; only its id is trusted.
        instance: Instance,
        /// The reported status.
        status: RawTaskStatus,
        /// Processing time, used for state bookkeeping.
        now: DateTime<Utc>,
    },
    /// Remove the instance record unconditionally.
    ForceExpunge(InstanceId),
    /// Create (or overwrite) an instance holding only reservations.
    Reserve(Instance),
    /// Launch every reserved task of an existing instance.
    LaunchOnReservation {
        /// The reserved instance.
        instance_id: InstanceId,
        /// Run spec version of the launch.
        run_spec_version: DateTime<Utc>,
        /// Staging time of the launched tasks.
        timestamp: DateTime<Utc>,
    },
    /// Drop a reservation that was never used.
    ReservationTimeout(InstanceId),
    /// Restore a previous snapshot, e.g. after a failed launch.
    Revert(Instance),
}

impl InstanceUpdateOperation {
    /// Returns the instance this operation targets.
    #[must_use]
    pub const fn instance_id(&self) -> &InstanceId {
        match self {
            Self::LaunchEphemeral(instance)
            | Self::Reserve(instance)
            | Self::Revert(instance)
            | Self::MesosUpdate { instance, .. } => &instance.instance_id,
            Self::ForceExpunge(instance_id)
            | Self::ReservationTimeout(instance_id)
            | Self::LaunchOnReservation { instance_id, .. } => instance_id,
        }
    }

    /// Returns a short name for logs and spans.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::LaunchEphemeral(_) => "launch_ephemeral",
            Self::MesosUpdate { .. } => "mesos_update",
            Self::ForceExpunge(_) => "force_expunge",
            Self::Reserve(_) => "reserve",
            Self::LaunchOnReservation { .. } => "launch_on_reservation",
            Self::ReservationTimeout(_) => "reservation_timeout",
            Self::Revert(_) => "revert",
        }
    }
}

/// Outcome of a processed operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceUpdateEffect {
    /// The record was written.
    Update {
        /// The new snapshot.
        instance: Instance,
        /// The snapshot it replaced, if one existed.
        old_state: Option<Instance>,
    },
    /// The record was deleted.
    Expunge {
        /// The last snapshot before deletion.
        instance: Instance,
    },
    /// Nothing changed.
    Noop {
        /// The targeted instance.
        instance_id: InstanceId,
    },
}

impl InstanceUpdateEffect {
    /// Returns the targeted instance id.
    #[must_use]
    pub const fn instance_id(&self) -> &InstanceId {
        match self {
            Self::Update { instance, .. } | Self::Expunge { instance } => &instance.instance_id,
            Self::Noop { instance_id } => instance_id,
        }
    }

    /// Returns the snapshot carried by the effect, if any.
    #[must_use]
    pub const fn instance(&self) -> Option<&Instance> {
        match self {
            Self::Update { instance, .. } | Self::Expunge { instance } => Some(instance),
            Self::Noop { .. } => None,
        }
    }

    /// Returns true for [`InstanceUpdateEffect::Noop`].
    #[must_use]
    pub const fn is_noop(&self) -> bool {
        matches!(self, Self::Noop { .. })
    }
}

/// Result of folding a status into an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusFold {
    /// Phase and health are unchanged.
    Unchanged,
    /// The instance changed and is still alive.
    Updated(Instance),
    /// Every task is now terminal.
    Terminal(Instance),
}

impl Instance {
    /// Folds a reported status into the matching task.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskNotFound`] if the status names a task this
    /// instance does not contain.
    pub fn fold_status(&self, status: &RawTaskStatus, now: DateTime<Utc>) -> Result<StatusFold> {
        let Some(task) = self.tasks.get(&status.task_id) else {
            return Err(Error::TaskNotFound {
                task_id: status.task_id.clone(),
                instance_id: self.instance_id.clone(),
            });
        };
        let Some(launched) = task.launched.as_ref() else {
            tracing::warn!(
                task_id = %status.task_id,
                state = ?status.state,
                "status for a task that holds only a reservation; ignoring"
            );
            return Ok(StatusFold::Unchanged);
        };

        let next_status = launched.status.apply(status);
        if next_status.same_significant_state(&launched.status) {
            return Ok(StatusFold::Unchanged);
        }

        let mut tasks = self.tasks.clone();
        if let Some(entry) = tasks.get_mut(&status.task_id) {
            entry.launched = Some(Launched {
                run_spec_version: launched.run_spec_version,
                status: next_status,
            });
        }
        let updated = self.with_tasks(tasks, now);
        if updated.is_terminal() {
            Ok(StatusFold::Terminal(updated))
        } else {
            Ok(StatusFold::Updated(updated))
        }
    }

    /// Gives every reserved task a launch record in the staging phase.
    #[must_use]
    pub fn launch_reserved(
        &self,
        run_spec_version: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let tasks = self
            .tasks
            .iter()
            .map(|(task_id, task)| {
                let mut task = task.clone();
                if task.launched.is_none() {
                    task.launched = Some(Launched {
                        run_spec_version,
                        status: TaskStatus::staged(timestamp),
                    });
                }
                (task_id.clone(), task)
            })
            .collect();
        let mut launched = self.with_tasks(tasks, timestamp);
        launched.run_spec_version = run_spec_version;
        launched
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use keel_core::{PathId, TaskId};

    use super::*;
    use crate::instance::{AgentInfo, Condition, RawTaskState, Reservation, Task};

    fn single_task_instance() -> (Instance, TaskId) {
        let spec: PathId = "/web".parse().unwrap();
        let instance_id = InstanceId::for_spec(&spec);
        let task_id = TaskId::for_instance(&instance_id);
        let now = Utc::now();
        let task = Task::launched_ephemeral(task_id.clone(), now, now);
        (
            Instance::new(instance_id, AgentInfo::on_host("agent-1"), [task], now, now),
            task_id,
        )
    }

    #[test]
    fn operation_names_its_target() {
        let (instance, _) = single_task_instance();
        let id = instance.instance_id.clone();
        assert_eq!(
            InstanceUpdateOperation::LaunchEphemeral(instance).instance_id(),
            &id
        );
        let expunge = InstanceUpdateOperation::ForceExpunge(id.clone());
        assert_eq!(expunge.instance_id(), &id);
        assert_eq!(expunge.name(), "force_expunge");
    }

    #[test]
    fn running_status_updates_staged_task() {
        let (instance, task_id) = single_task_instance();
        let now = Utc::now();
        let status = RawTaskStatus::new(task_id.clone(), RawTaskState::Running, now);

        let StatusFold::Updated(updated) = instance.fold_status(&status, now).unwrap() else {
            panic!("expected update");
        };
        assert_eq!(updated.tasks[&task_id].condition(), Condition::Running);
        assert_eq!(updated.state.condition, Condition::Running);
    }

    #[test]
    fn repeated_status_with_new_timestamp_is_unchanged() {
        let (instance, task_id) = single_task_instance();
        let now = Utc::now();
        let running = RawTaskStatus::new(task_id.clone(), RawTaskState::Running, now);
        let StatusFold::Updated(running_instance) = instance.fold_status(&running, now).unwrap()
        else {
            panic!("expected update");
        };

        let again = RawTaskStatus::new(task_id, RawTaskState::Running, now + Duration::seconds(30));
        assert_eq!(
            running_instance.fold_status(&again, now).unwrap(),
            StatusFold::Unchanged
        );
    }

    #[test]
    fn terminal_status_of_only_task_is_terminal() {
        let (instance, task_id) = single_task_instance();
        let now = Utc::now();
        for state in [
            RawTaskState::Finished,
            RawTaskState::Failed,
            RawTaskState::Killed,
            RawTaskState::Lost,
            RawTaskState::Error,
        ] {
            let status = RawTaskStatus::new(task_id.clone(), state, now);
            assert!(matches!(
                instance.fold_status(&status, now).unwrap(),
                StatusFold::Terminal(_)
            ));
        }
    }

    #[test]
    fn unknown_task_is_rejected() {
        let (instance, _) = single_task_instance();
        let (other, other_task) = single_task_instance();
        assert_ne!(instance.instance_id, other.instance_id);

        let status = RawTaskStatus::new(other_task, RawTaskState::Running, Utc::now());
        let err = instance.fold_status(&status, Utc::now()).unwrap_err();
        assert!(matches!(err, Error::TaskNotFound { .. }));
    }

    #[test]
    fn launch_reserved_stages_every_reserved_task() {
        let spec: PathId = "/db".parse().unwrap();
        let instance_id = InstanceId::for_spec(&spec);
        let now = Utc::now();
        let task = Task::reserved(
            TaskId::for_instance(&instance_id),
            Reservation {
                volume_ids: vec!["vol-1".into()],
            },
        );
        let reserved = Instance::new(instance_id, AgentInfo::default(), [task], now, now);

        let version = now + Duration::seconds(1);
        let launched = reserved.launch_reserved(version, now);
        assert!(launched.is_launched());
        assert_eq!(launched.state.condition, Condition::Staging);
        assert_eq!(launched.run_spec_version, version);
        assert!(launched.tasks.values().all(|t| t.reservation.is_some()));
    }
}
