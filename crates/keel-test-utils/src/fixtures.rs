//! Pre-built fixtures for instance tests.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use keel_core::{InstanceId, PathId, TaskId};
use keel_scheduler::InstanceTracker;
use keel_scheduler::instance::{
    AgentInfo, Instance, RawTaskState, RawTaskStatus, Reservation, Task,
};

use crate::storage::TracingMemoryStore;

/// Tracker over a traced store.
pub struct TestContext {
    /// The store behind the tracker.
    pub store: Arc<TracingMemoryStore>,
    /// The tracker under test.
    pub tracker: InstanceTracker,
}

impl TestContext {
    /// Creates a tracker over a fresh traced store.
    #[must_use]
    pub fn new() -> Self {
        let store = Arc::new(TracingMemoryStore::new());
        let tracker = InstanceTracker::new(store.clone());
        Self { store, tracker }
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses a spec path, panicking on invalid input.
pub fn spec(path: &str) -> PathId {
    path.parse().expect("valid spec path")
}

/// Factory for instances in common states.
pub struct InstanceFactory;

impl InstanceFactory {
    /// An instance of `spec` with one task staged on `agent-1`.
    pub fn launched(spec_path: &str) -> Instance {
        Self::launched_at(spec_path, Utc::now())
    }

    /// Like [`InstanceFactory::launched`] with a fixed staging time.
    pub fn launched_at(spec_path: &str, at: DateTime<Utc>) -> Instance {
        let id = InstanceId::for_spec(&spec(spec_path));
        let task = Task::launched_ephemeral(TaskId::for_instance(&id), at, at);
        Instance::new(id, AgentInfo::on_host("agent-1"), [task], at, at)
    }

    /// An instance of `spec` with one staged task per container name.
    pub fn pod(spec_path: &str, containers: &[&str]) -> Instance {
        let now = Utc::now();
        let id = InstanceId::for_spec(&spec(spec_path));
        let tasks: Vec<Task> = containers
            .iter()
            .map(|container| {
                let task_id = TaskId::for_container(&id, container).expect("valid container name");
                Task::launched_ephemeral(task_id, now, now)
            })
            .collect();
        Instance::new(id, AgentInfo::on_host("agent-1"), tasks, now, now)
    }

    /// An instance of `spec` whose single task only holds a reservation.
    pub fn reserved(spec_path: &str) -> Instance {
        let now = Utc::now();
        let id = InstanceId::for_spec(&spec(spec_path));
        let task = Task::reserved(
            TaskId::for_instance(&id),
            Reservation {
                volume_ids: vec![format!("vol-{}", id.uid())],
            },
        );
        Instance::new(id, AgentInfo::on_host("agent-1"), [task], now, now)
    }

    /// Returns the id of the first task of `instance`.
    pub fn first_task(instance: &Instance) -> TaskId {
        let mut ids: Vec<&TaskId> = instance.tasks.keys().collect();
        ids.sort();
        ids.first().map(|id| (*id).clone()).expect("instance has tasks")
    }
}

/// A status for the first task of `instance`.
pub fn status(instance: &Instance, state: RawTaskState) -> RawTaskStatus {
    RawTaskStatus::new(InstanceFactory::first_task(instance), state, Utc::now())
}

/// A status with a health flag for the first task of `instance`.
pub fn health_status(instance: &Instance, state: RawTaskState, healthy: bool) -> RawTaskStatus {
    status(instance, state).with_health(healthy)
}
