//! Instance and task data model.
//!
//! An [`Instance`] is one scheduling unit launched from a run spec. It owns
//! one or more [`Task`]s, each carrying the last status reported by the offer
//! source. Instances are immutable values: every state change produces a new
//! snapshot that replaces the persisted record as a whole.

pub mod update;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use keel_core::{InstanceId, PathId, TaskId};

pub use update::{InstanceUpdateEffect, InstanceUpdateOperation};

/// Raw task state as reported by the offer source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawTaskState {
    /// Accepted by an agent, not yet started.
    Staging,
    /// The executor is starting the task.
    Starting,
    /// The task is running.
    Running,
    /// A kill was requested and is in progress.
    Killing,
    /// The agent hosting the task is unreachable.
    Unreachable,
    /// The task exited successfully.
    Finished,
    /// The task exited with an error.
    Failed,
    /// The task was killed.
    Killed,
    /// The task was lost.
    Lost,
    /// The task description was invalid.
    Error,
    /// The task was dropped before it started.
    Dropped,
    /// The task is known to be gone together with its agent.
    Gone,
}

/// Lifecycle phase of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Resources are reserved; nothing is launched yet.
    Reserved,
    /// Staged on an agent.
    Staging,
    /// Starting.
    Starting,
    /// Running.
    Running,
    /// Being killed.
    Killing,
    /// Agent unreachable; may come back.
    Unreachable,
    /// Exited successfully.
    Finished,
    /// Exited with a failure.
    Failed,
    /// Killed.
    Killed,
    /// Lost.
    Lost,
    /// Rejected as invalid.
    Error,
}

impl Condition {
    /// Maps a raw offer-source state onto a task condition.
    #[must_use]
    pub const fn from_raw(state: RawTaskState) -> Self {
        match state {
            RawTaskState::Staging => Self::Staging,
            RawTaskState::Starting => Self::Starting,
            RawTaskState::Running => Self::Running,
            RawTaskState::Killing => Self::Killing,
            RawTaskState::Unreachable => Self::Unreachable,
            RawTaskState::Finished => Self::Finished,
            RawTaskState::Failed => Self::Failed,
            RawTaskState::Killed => Self::Killed,
            RawTaskState::Lost | RawTaskState::Dropped | RawTaskState::Gone => Self::Lost,
            RawTaskState::Error => Self::Error,
        }
    }

    /// Returns true if no further transition can occur.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Failed | Self::Killed | Self::Lost | Self::Error
        )
    }

    /// Precedence used to summarize several tasks into one instance condition.
    /// Lower wins; any live task outranks every terminal one.
    const fn precedence(self) -> u8 {
        match self {
            Self::Unreachable => 0,
            Self::Killing => 1,
            Self::Staging => 2,
            Self::Starting => 3,
            Self::Reserved => 4,
            Self::Running => 5,
            Self::Error => 6,
            Self::Failed => 7,
            Self::Lost => 8,
            Self::Killed => 9,
            Self::Finished => 10,
        }
    }
}

/// Last raw status payload received for a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTaskStatus {
    /// The task the status refers to.
    pub task_id: TaskId,
    /// Reported state.
    pub state: RawTaskState,
    /// When the offer source produced the status.
    pub timestamp: DateTime<Utc>,
    /// Health-check result, if the task has health checks.
    pub healthy: Option<bool>,
    /// Free-form message from the agent.
    pub message: Option<String>,
}

impl RawTaskStatus {
    /// Creates a status without health information or message.
    #[must_use]
    pub const fn new(task_id: TaskId, state: RawTaskState, timestamp: DateTime<Utc>) -> Self {
        Self {
            task_id,
            state,
            timestamp,
            healthy: None,
            message: None,
        }
    }

    /// Sets the health flag.
    #[must_use]
    pub fn with_health(mut self, healthy: bool) -> Self {
        self.healthy = Some(healthy);
        self
    }

    /// Sets the message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Status of a launched task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    /// When the task was staged.
    pub staged_at: DateTime<Utc>,
    /// When the task was first seen running.
    pub started_at: Option<DateTime<Utc>>,
    /// Current lifecycle phase.
    pub condition: Condition,
    /// Last raw status, if any was received.
    pub raw: Option<RawTaskStatus>,
}

impl TaskStatus {
    /// Creates the status of a freshly staged task.
    #[must_use]
    pub const fn staged(at: DateTime<Utc>) -> Self {
        Self {
            staged_at: at,
            started_at: None,
            condition: Condition::Staging,
            raw: None,
        }
    }

    /// Returns the last reported health flag.
    #[must_use]
    pub fn healthy(&self) -> Option<bool> {
        self.raw.as_ref().and_then(|raw| raw.healthy)
    }

    /// Compares the fields that make a status change worth persisting.
    ///
    /// Timestamps and messages are ignored; phase and health are compared.
    #[must_use]
    pub fn same_significant_state(&self, other: &Self) -> bool {
        self.condition == other.condition && self.healthy() == other.healthy()
    }

    /// Folds a raw status into this one.
    #[must_use]
    pub fn apply(&self, raw: &RawTaskStatus) -> Self {
        let condition = Condition::from_raw(raw.state);
        let started_at = match (self.started_at, condition) {
            (None, Condition::Running) => Some(raw.timestamp),
            (started, _) => started,
        };
        Self {
            staged_at: self.staged_at,
            started_at,
            condition,
            raw: Some(raw.clone()),
        }
    }
}

/// Resources reserved for a task across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Reservation {
    /// Persistent volumes bound to the reservation.
    pub volume_ids: Vec<String>,
}

/// Launch record of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Launched {
    /// Version of the run spec the task was launched from.
    pub run_spec_version: DateTime<Utc>,
    /// Current status.
    pub status: TaskStatus,
}

/// The smallest unit carrying a runtime status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Stable identity derived from the owning instance.
    pub task_id: TaskId,
    /// Reservation, for resident tasks.
    pub reservation: Option<Reservation>,
    /// Launch record; `None` while only reserved.
    pub launched: Option<Launched>,
}

impl Task {
    /// Creates a task launched without a reservation.
    #[must_use]
    pub const fn launched_ephemeral(
        task_id: TaskId,
        run_spec_version: DateTime<Utc>,
        staged_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            reservation: None,
            launched: Some(Launched {
                run_spec_version,
                status: TaskStatus::staged(staged_at),
            }),
        }
    }

    /// Creates a task that only holds a reservation.
    #[must_use]
    pub const fn reserved(task_id: TaskId, reservation: Reservation) -> Self {
        Self {
            task_id,
            reservation: Some(reservation),
            launched: None,
        }
    }

    /// Returns true if the task has a launch record.
    #[must_use]
    pub const fn is_launched(&self) -> bool {
        self.launched.is_some()
    }

    /// Returns the task's condition.
    #[must_use]
    pub fn condition(&self) -> Condition {
        self.launched
            .as_ref()
            .map_or(Condition::Reserved, |launched| launched.status.condition)
    }

    /// Returns the task's current status, if launched.
    #[must_use]
    pub fn status(&self) -> Option<&TaskStatus> {
        self.launched.as_ref().map(|launched| &launched.status)
    }

    /// Returns true if the task is launched and has reached a terminal phase.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.is_launched() && self.condition().is_terminal()
    }
}

/// Placement of an instance on an agent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AgentInfo {
    /// Host name of the agent.
    pub host: String,
    /// Agent identity, once known.
    pub agent_id: Option<String>,
    /// Agent attributes used for placement constraints.
    pub attributes: Vec<(String, String)>,
}

impl AgentInfo {
    /// Creates agent info for a host without attributes.
    #[must_use]
    pub fn on_host(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }
}

/// Summary of an instance's tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceState {
    /// Summarized condition across tasks.
    pub condition: Condition,
    /// When the instance entered `condition`.
    pub since: DateTime<Utc>,
    /// `Some(true)` if every launched task is healthy, `Some(false)` if any
    /// reports unhealthy, `None` without health information.
    pub healthy: Option<bool>,
}

impl InstanceState {
    /// Derives the state of a task set, keeping `since` when the summarized
    /// condition did not change.
    #[must_use]
    pub fn derive<'a>(
        tasks: impl IntoIterator<Item = &'a Task>,
        previous: Option<&Self>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut condition: Option<Condition> = None;
        let mut any_unhealthy = false;
        let mut all_healthy = true;
        let mut any_launched = false;

        for task in tasks {
            let task_condition = task.condition();
            if condition.is_none_or(|c| task_condition.precedence() < c.precedence()) {
                condition = Some(task_condition);
            }
            if let Some(status) = task.status() {
                any_launched = true;
                match status.healthy() {
                    Some(true) => {}
                    Some(false) => {
                        any_unhealthy = true;
                        all_healthy = false;
                    }
                    None => all_healthy = false,
                }
            }
        }

        let condition = condition.unwrap_or(Condition::Reserved);
        let healthy = if any_unhealthy {
            Some(false)
        } else if any_launched && all_healthy {
            Some(true)
        } else {
            None
        };
        let since = previous
            .filter(|prev| prev.condition == condition)
            .map_or(now, |prev| prev.since);

        Self {
            condition,
            since,
            healthy,
        }
    }
}

/// One scheduling unit launched from a run spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Immutable identity; embeds the owning spec.
    pub instance_id: InstanceId,
    /// Where the instance runs.
    pub agent_info: AgentInfo,
    /// Summarized state, derived from `tasks`.
    pub state: InstanceState,
    /// Tasks keyed by id.
    pub tasks: HashMap<TaskId, Task>,
    /// Version of the run spec the instance was created from.
    pub run_spec_version: DateTime<Utc>,
}

impl Instance {
    /// Creates an instance and derives its state from the tasks.
    #[must_use]
    pub fn new(
        instance_id: InstanceId,
        agent_info: AgentInfo,
        tasks: impl IntoIterator<Item = Task>,
        run_spec_version: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        let tasks: HashMap<TaskId, Task> = tasks
            .into_iter()
            .map(|task| (task.task_id.clone(), task))
            .collect();
        let state = InstanceState::derive(tasks.values(), None, now);
        Self {
            instance_id,
            agent_info,
            state,
            tasks,
            run_spec_version,
        }
    }

    /// Returns the spec the instance belongs to.
    #[must_use]
    pub const fn spec_id(&self) -> &PathId {
        self.instance_id.spec_id()
    }

    /// Returns true if at least one task has a launch record.
    #[must_use]
    pub fn is_launched(&self) -> bool {
        self.tasks.values().any(Task::is_launched)
    }

    /// Returns true if every task is launched and terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.values().all(Task::is_terminal)
    }

    /// Returns a copy with `tasks` replaced and state re-derived.
    #[must_use]
    pub fn with_tasks(&self, tasks: HashMap<TaskId, Task>, now: DateTime<Utc>) -> Self {
        let state = InstanceState::derive(tasks.values(), Some(&self.state), now);
        Self {
            instance_id: self.instance_id.clone(),
            agent_info: self.agent_info.clone(),
            state,
            tasks,
            run_spec_version: self.run_spec_version,
        }
    }
}
