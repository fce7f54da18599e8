//! Sole writer of persisted instance records.
//!
//! ## Ordering
//!
//! Operations on one instance id are serialized through a per-id FIFO lock,
//! so they apply in submission order. Different ids proceed concurrently.
//! The tracker index is patched while the per-id lock is still held, which
//! keeps the index order consistent with the store order.
//!
//! ## Cancellation
//!
//! Each operation runs to completion in its own task. A caller that stops
//! waiting does not stop the operation, so a committed store write is always
//! followed by the matching index update.
//!
//! ## Freshness barrier
//!
//! Each `process` call holds a shared guard on the barrier for its whole
//! duration. A fresh read takes the exclusive guard for an instant, which
//! waits for every mutation that was already in flight.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, RwLock as AsyncRwLock, RwLockWriteGuard};
use tracing::Instrument;

use keel_core::InstanceId;
use keel_core::observability::instance_span;

use super::index::SharedIndex;
use super::repository::InstanceRepository;
use crate::error::{Error, Result};
use crate::instance::update::StatusFold;
use crate::instance::{Instance, InstanceUpdateEffect, InstanceUpdateOperation};

type IdLock = Arc<AsyncMutex<()>>;

/// Applies [`InstanceUpdateOperation`]s to the store and publishes the
/// outcome to the tracker index.
#[derive(Debug)]
pub(crate) struct InstanceStateOpProcessor {
    repository: InstanceRepository,
    index: Arc<SharedIndex>,
    locks: Mutex<HashMap<InstanceId, IdLock>>,
    barrier: AsyncRwLock<()>,
}

impl InstanceStateOpProcessor {
    pub(crate) fn new(repository: InstanceRepository, index: Arc<SharedIndex>) -> Self {
        Self {
            repository,
            index,
            locks: Mutex::new(HashMap::new()),
            barrier: AsyncRwLock::new(()),
        }
    }

    pub(crate) const fn repository(&self) -> &InstanceRepository {
        &self.repository
    }

    /// Processes one operation.
    ///
    /// Dropping the returned future does not cancel the operation.
    pub(crate) async fn process(
        self: &Arc<Self>,
        op: InstanceUpdateOperation,
    ) -> Result<InstanceUpdateEffect> {
        let span = instance_span(op.name(), &op.instance_id().to_string());
        let this = Arc::clone(self);
        let task = tokio::spawn(async move { this.run(op).await }.instrument(span));
        task.await.map_err(|err| {
            Error::Core(keel_core::Error::Internal {
                message: format!("instance operation task failed: {err}"),
            })
        })?
    }

    async fn run(&self, op: InstanceUpdateOperation) -> Result<InstanceUpdateEffect> {
        let _in_flight = self.barrier.read().await;
        let instance_id = op.instance_id().clone();
        let lock = self.lock_for(&instance_id);

        let result = {
            let _serialized = lock.lock().await;
            let result = self.apply(op).await;
            if let Ok(effect) = &result {
                self.index.apply(effect);
            }
            result
        };

        self.release(&instance_id, lock);
        match &result {
            Ok(effect) if effect.is_noop() => tracing::debug!("no change"),
            Ok(_) => tracing::debug!("applied"),
            Err(err) => tracing::warn!(error = %err, "operation failed"),
        }
        result
    }

    /// Waits until every mutation submitted so far has completed.
    pub(crate) async fn settle(&self) {
        drop(self.barrier.write().await);
    }

    /// Blocks new mutations until the guard is dropped.
    pub(crate) async fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.barrier.write().await
    }

    async fn apply(&self, op: InstanceUpdateOperation) -> Result<InstanceUpdateEffect> {
        match op {
            InstanceUpdateOperation::LaunchEphemeral(instance)
            | InstanceUpdateOperation::Reserve(instance)
            | InstanceUpdateOperation::Revert(instance) => self.overwrite(instance).await,

            InstanceUpdateOperation::MesosUpdate {
                instance,
                status,
                now,
            } => {
                let current = self.require(instance.instance_id).await?;
                match current.fold_status(&status, now)? {
                    StatusFold::Unchanged => Ok(InstanceUpdateEffect::Noop {
                        instance_id: current.instance_id,
                    }),
                    StatusFold::Updated(updated) => {
                        self.repository.store(&updated).await?;
                        Ok(InstanceUpdateEffect::Update {
                            instance: updated,
                            old_state: Some(current),
                        })
                    }
                    StatusFold::Terminal(last) => {
                        self.repository.delete(&last.instance_id).await?;
                        Ok(InstanceUpdateEffect::Expunge { instance: last })
                    }
                }
            }

            InstanceUpdateOperation::ForceExpunge(instance_id) => {
                // An unreadable record is still deleted; the index copy stands in.
                let current = match self.repository.get_decodable(&instance_id).await? {
                    Some(instance) => Some(instance),
                    None => self.index.snapshot().instance(&instance_id).cloned(),
                };
                self.repository.delete(&instance_id).await?;
                Ok(current.map_or(
                    InstanceUpdateEffect::Noop { instance_id },
                    |instance| InstanceUpdateEffect::Expunge { instance },
                ))
            }

            InstanceUpdateOperation::LaunchOnReservation {
                instance_id,
                run_spec_version,
                timestamp,
            } => {
                let current = self.require(instance_id).await?;
                let launched = current.launch_reserved(run_spec_version, timestamp);
                self.repository.store(&launched).await?;
                Ok(InstanceUpdateEffect::Update {
                    instance: launched,
                    old_state: Some(current),
                })
            }

            InstanceUpdateOperation::ReservationTimeout(instance_id) => {
                let current = self.require(instance_id).await?;
                self.repository.delete(&current.instance_id).await?;
                Ok(InstanceUpdateEffect::Expunge { instance: current })
            }
        }
    }

    async fn overwrite(&self, instance: Instance) -> Result<InstanceUpdateEffect> {
        let old_state = self.repository.get_decodable(&instance.instance_id).await?;
        self.repository.store(&instance).await?;
        Ok(InstanceUpdateEffect::Update {
            instance,
            old_state,
        })
    }

    async fn require(&self, instance_id: InstanceId) -> Result<Instance> {
        match self.repository.get(&instance_id).await? {
            Some(instance) => Ok(instance),
            None => Err(Error::InstanceNotFound {
                spec_id: instance_id.spec_id().clone(),
                instance_id,
            }),
        }
    }

    fn lock_for(&self, instance_id: &InstanceId) -> IdLock {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(instance_id.clone()).or_default())
    }

    fn release(&self, instance_id: &InstanceId, lock: IdLock) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // The map and `lock` are the only holders: nobody else is queued.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(instance_id);
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use keel_core::{MemoryStore, PathId, PersistentStore, TaskId};

    use super::*;
    use crate::instance::{AgentInfo, RawTaskState, RawTaskStatus, Reservation, Task};

    fn processor() -> Arc<InstanceStateOpProcessor> {
        processor_over(Arc::new(MemoryStore::new()))
    }

    fn processor_over(store: Arc<MemoryStore>) -> Arc<InstanceStateOpProcessor> {
        Arc::new(InstanceStateOpProcessor::new(
            InstanceRepository::new(store),
            Arc::new(SharedIndex::new()),
        ))
    }

    fn launched(spec: &str) -> Instance {
        let spec: PathId = spec.parse().unwrap();
        let id = InstanceId::for_spec(&spec);
        let now = Utc::now();
        let task = Task::launched_ephemeral(TaskId::for_instance(&id), now, now);
        Instance::new(id, AgentInfo::on_host("agent-1"), [task], now, now)
    }

    fn only_task(instance: &Instance) -> TaskId {
        instance.tasks.keys().next().cloned().unwrap()
    }

    #[tokio::test]
    async fn launch_then_terminal_status_expunges() {
        let processor = processor();
        let instance = launched("/web");
        let task_id = only_task(&instance);

        let effect = processor
            .process(InstanceUpdateOperation::LaunchEphemeral(instance.clone()))
            .await
            .unwrap();
        assert!(matches!(effect, InstanceUpdateEffect::Update { old_state: None, .. }));
        assert_eq!(processor.index.snapshot().len(), 1);

        let effect = processor
            .process(InstanceUpdateOperation::MesosUpdate {
                instance: instance.clone(),
                status: RawTaskStatus::new(task_id, RawTaskState::Failed, Utc::now()),
                now: Utc::now(),
            })
            .await
            .unwrap();
        assert!(matches!(effect, InstanceUpdateEffect::Expunge { .. }));
        assert!(processor.index.snapshot().is_empty());
        assert_eq!(processor.repository.get(&instance.instance_id).await.unwrap(), None);
        assert_eq!(processor.tracked_locks(), 0);
    }

    #[tokio::test]
    async fn status_for_missing_instance_is_not_found() {
        let processor = processor();
        let instance = launched("/web");
        let task_id = only_task(&instance);

        let err = processor
            .process(InstanceUpdateOperation::MesosUpdate {
                instance,
                status: RawTaskStatus::new(task_id, RawTaskState::Running, Utc::now()),
                now: Utc::now(),
            })
            .await
            .unwrap_err();
        assert!(err.to_string().ends_with("of app [/web] does not exist"));
        assert!(processor.index.snapshot().is_empty());
    }

    #[tokio::test]
    async fn force_expunge_of_absent_instance_is_noop() {
        let processor = processor();
        let id = launched("/web").instance_id;
        let effect = processor
            .process(InstanceUpdateOperation::ForceExpunge(id))
            .await
            .unwrap();
        assert!(effect.is_noop());
    }

    #[tokio::test]
    async fn undecodable_record_is_overwritten_and_expunged() {
        let store = Arc::new(MemoryStore::new());
        let processor = processor_over(store.clone());
        let instance = launched("/web");
        let key = keel_core::keys::instance(&instance.instance_id);
        store
            .update(&key, bytes::Bytes::from_static(b"garbage"))
            .await
            .unwrap();

        let effect = processor
            .process(InstanceUpdateOperation::LaunchEphemeral(instance.clone()))
            .await
            .unwrap();
        assert!(matches!(effect, InstanceUpdateEffect::Update { old_state: None, .. }));
        assert_eq!(processor.index.snapshot().len(), 1);

        store
            .update(&key, bytes::Bytes::from_static(b"garbage"))
            .await
            .unwrap();
        let effect = processor
            .process(InstanceUpdateOperation::ForceExpunge(instance.instance_id.clone()))
            .await
            .unwrap();
        assert_eq!(effect.instance(), Some(&instance));
        assert!(processor.index.snapshot().is_empty());
        assert_eq!(store.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn reservation_lifecycle() {
        let processor = processor();
        let spec: PathId = "/db".parse().unwrap();
        let id = InstanceId::for_spec(&spec);
        let now = Utc::now();
        let reserved = Instance::new(
            id.clone(),
            AgentInfo::on_host("agent-1"),
            [Task::reserved(TaskId::for_instance(&id), Reservation::default())],
            now,
            now,
        );

        processor
            .process(InstanceUpdateOperation::Reserve(reserved.clone()))
            .await
            .unwrap();
        assert_eq!(processor.index.snapshot().count_launched_spec_instances(&spec), 0);

        let effect = processor
            .process(InstanceUpdateOperation::LaunchOnReservation {
                instance_id: id.clone(),
                run_spec_version: now,
                timestamp: now,
            })
            .await
            .unwrap();
        assert_eq!(effect.instance().map(Instance::is_launched), Some(true));
        assert_eq!(processor.index.snapshot().count_launched_spec_instances(&spec), 1);

        processor
            .process(InstanceUpdateOperation::Revert(reserved))
            .await
            .unwrap();
        assert_eq!(processor.index.snapshot().count_launched_spec_instances(&spec), 0);

        let effect = processor
            .process(InstanceUpdateOperation::ReservationTimeout(id.clone()))
            .await
            .unwrap();
        assert!(matches!(effect, InstanceUpdateEffect::Expunge { .. }));

        let err = processor
            .process(InstanceUpdateOperation::ReservationTimeout(id))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
