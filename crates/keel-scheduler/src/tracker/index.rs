//! Read-optimized index of instances grouped by spec.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::broadcast;

use keel_core::{InstanceId, PathId};

use crate::instance::{Instance, InstanceUpdateEffect};

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Instances of one spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecInstances {
    spec_id: PathId,
    instances: HashMap<InstanceId, Instance>,
}

impl SpecInstances {
    fn new(spec_id: PathId) -> Self {
        Self {
            spec_id,
            instances: HashMap::new(),
        }
    }

    /// Returns the spec this bucket belongs to.
    #[must_use]
    pub const fn spec_id(&self) -> &PathId {
        &self.spec_id
    }

    /// Returns the instances keyed by id.
    #[must_use]
    pub const fn instance_map(&self) -> &HashMap<InstanceId, Instance> {
        &self.instances
    }

    /// Iterates over the instances in no particular order.
    pub fn instances(&self) -> impl Iterator<Item = &Instance> {
        self.instances.values()
    }

    /// Returns the number of instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Returns true if the bucket holds no instances.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Returns the number of instances with at least one launched task.
    #[must_use]
    pub fn launched_count(&self) -> usize {
        self.instances.values().filter(|i| i.is_launched()).count()
    }
}

/// Mapping from spec id to the instances launched from it.
///
/// A spec with no instances has no bucket. Buckets are shared between
/// snapshots until a write touches them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstancesBySpec {
    specs: BTreeMap<PathId, Arc<SpecInstances>>,
}

impl InstancesBySpec {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an index from a full set of instances.
    #[must_use]
    pub fn from_instances(instances: impl IntoIterator<Item = Instance>) -> Self {
        let mut index = Self::new();
        for instance in instances {
            index.upsert(instance);
        }
        index
    }

    /// Returns the buckets keyed by spec id.
    #[must_use]
    pub const fn spec_map(&self) -> &BTreeMap<PathId, Arc<SpecInstances>> {
        &self.specs
    }

    /// Returns the ids of every spec with at least one instance.
    pub fn spec_ids(&self) -> impl Iterator<Item = &PathId> {
        self.specs.keys()
    }

    /// Returns the bucket of a spec.
    #[must_use]
    pub fn spec(&self, spec_id: &PathId) -> Option<&SpecInstances> {
        self.specs.get(spec_id).map(AsRef::as_ref)
    }

    /// Looks an instance up by id.
    #[must_use]
    pub fn instance(&self, instance_id: &InstanceId) -> Option<&Instance> {
        self.specs
            .get(instance_id.spec_id())
            .and_then(|bucket| bucket.instances.get(instance_id))
    }

    /// Returns the instances of a spec.
    #[must_use]
    pub fn spec_instances(&self, spec_id: &PathId) -> Vec<Instance> {
        self.specs
            .get(spec_id)
            .map(|bucket| bucket.instances.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Iterates over every instance.
    pub fn all_instances(&self) -> impl Iterator<Item = &Instance> {
        self.specs.values().flat_map(|bucket| bucket.instances())
    }

    /// Returns true if the spec has at least one instance.
    #[must_use]
    pub fn has_spec_instances(&self, spec_id: &PathId) -> bool {
        self.specs.contains_key(spec_id)
    }

    /// Returns the number of instances of a spec with a launched task.
    #[must_use]
    pub fn count_launched_spec_instances(&self, spec_id: &PathId) -> usize {
        self.specs
            .get(spec_id)
            .map_or(0, |bucket| bucket.launched_count())
    }

    /// Returns the total number of instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.specs.values().map(|bucket| bucket.len()).sum()
    }

    /// Returns true if no spec has instances.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Inserts or replaces an instance.
    pub(crate) fn upsert(&mut self, instance: Instance) {
        let spec_id = instance.spec_id().clone();
        let bucket = self
            .specs
            .entry(spec_id.clone())
            .or_insert_with(|| Arc::new(SpecInstances::new(spec_id)));
        Arc::make_mut(bucket)
            .instances
            .insert(instance.instance_id.clone(), instance);
    }

    /// Removes an instance, dropping its bucket when it becomes empty.
    pub(crate) fn remove(&mut self, instance_id: &InstanceId) -> Option<Instance> {
        let spec_id = instance_id.spec_id();
        let bucket = Arc::make_mut(self.specs.get_mut(spec_id)?);
        let removed = bucket.instances.remove(instance_id);
        if bucket.instances.is_empty() {
            self.specs.remove(spec_id);
        }
        removed
    }
}

/// A change published to tracker subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceChange {
    /// The instance was created or replaced.
    Updated(Instance),
    /// The instance record was removed.
    Expunged(Instance),
}

impl InstanceChange {
    /// Returns the changed instance.
    #[must_use]
    pub const fn instance(&self) -> &Instance {
        match self {
            Self::Updated(instance) | Self::Expunged(instance) => instance,
        }
    }
}

/// The published index snapshot plus the change feed.
///
/// A write clones the bucket map of a snapshot still held by a reader, plus
/// the one bucket it touches. Other buckets stay shared, and a snapshot
/// handed to a reader never changes underneath it.
#[derive(Debug)]
pub(crate) struct SharedIndex {
    snapshot: RwLock<Arc<InstancesBySpec>>,
    changes: broadcast::Sender<InstanceChange>,
}

impl SharedIndex {
    pub(crate) fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            snapshot: RwLock::new(Arc::new(InstancesBySpec::new())),
            changes,
        }
    }

    pub(crate) fn snapshot(&self) -> Arc<InstancesBySpec> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn replace(&self, index: InstancesBySpec) {
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(index);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<InstanceChange> {
        self.changes.subscribe()
    }

    /// Patches the snapshot with a processed effect and notifies subscribers.
    pub(crate) fn apply(&self, effect: &InstanceUpdateEffect) {
        let change = {
            let mut guard = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
            match effect {
                InstanceUpdateEffect::Update { instance, .. } => {
                    Arc::make_mut(&mut guard).upsert(instance.clone());
                    InstanceChange::Updated(instance.clone())
                }
                InstanceUpdateEffect::Expunge { instance } => {
                    Arc::make_mut(&mut guard).remove(&instance.instance_id);
                    InstanceChange::Expunged(instance.clone())
                }
                InstanceUpdateEffect::Noop { .. } => return,
            }
        };
        // No receivers is fine.
        let _ = self.changes.send(change);
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use keel_core::TaskId;

    use super::*;
    use crate::instance::{AgentInfo, Reservation, Task};

    fn launched(spec: &PathId) -> Instance {
        let id = InstanceId::for_spec(spec);
        let now = Utc::now();
        let task = Task::launched_ephemeral(TaskId::for_instance(&id), now, now);
        Instance::new(id, AgentInfo::on_host("agent-1"), [task], now, now)
    }

    fn reserved(spec: &PathId) -> Instance {
        let id = InstanceId::for_spec(spec);
        let now = Utc::now();
        let task = Task::reserved(TaskId::for_instance(&id), Reservation::default());
        Instance::new(id, AgentInfo::on_host("agent-1"), [task], now, now)
    }

    #[test]
    fn groups_instances_by_spec() {
        let web: PathId = "/web".parse().unwrap();
        let db: PathId = "/db".parse().unwrap();
        let index = InstancesBySpec::from_instances([launched(&web), launched(&web), reserved(&db)]);

        assert_eq!(index.len(), 3);
        assert_eq!(index.spec_instances(&web).len(), 2);
        assert_eq!(index.count_launched_spec_instances(&web), 2);
        assert_eq!(index.count_launched_spec_instances(&db), 0);
        assert!(index.has_spec_instances(&db));
    }

    #[test]
    fn removing_last_instance_drops_bucket() {
        let web: PathId = "/web".parse().unwrap();
        let instance = launched(&web);
        let id = instance.instance_id.clone();
        let mut index = InstancesBySpec::from_instances([instance]);

        assert!(index.remove(&id).is_some());
        assert!(!index.has_spec_instances(&web));
        assert!(index.spec(&web).is_none());
        assert!(index.is_empty());
        assert!(index.remove(&id).is_none());
    }

    #[test]
    fn upsert_replaces_existing_instance() {
        let web: PathId = "/web".parse().unwrap();
        let instance = launched(&web);
        let mut index = InstancesBySpec::from_instances([instance.clone()]);

        let mut moved = instance.clone();
        moved.agent_info = AgentInfo::on_host("agent-2");
        index.upsert(moved);

        assert_eq!(index.len(), 1);
        let stored = index.instance(&instance.instance_id).unwrap();
        assert_eq!(stored.agent_info.host, "agent-2");
    }

    #[test]
    fn shared_index_keeps_handed_out_snapshots_stable() {
        let web: PathId = "/web".parse().unwrap();
        let shared = SharedIndex::new();
        let mut changes = shared.subscribe();
        let before = shared.snapshot();

        let instance = launched(&web);
        shared.apply(&InstanceUpdateEffect::Update {
            instance: instance.clone(),
            old_state: None,
        });

        assert!(before.is_empty());
        assert_eq!(shared.snapshot().len(), 1);
        assert_eq!(changes.try_recv().unwrap(), InstanceChange::Updated(instance.clone()));

        shared.apply(&InstanceUpdateEffect::Noop {
            instance_id: instance.instance_id.clone(),
        });
        assert!(changes.try_recv().is_err());

        shared.apply(&InstanceUpdateEffect::Expunge { instance });
        assert!(shared.snapshot().is_empty());
    }

    #[test]
    fn writes_copy_only_the_touched_bucket() {
        let web: PathId = "/web".parse().unwrap();
        let db: PathId = "/db".parse().unwrap();
        let shared = SharedIndex::new();
        shared.replace(InstancesBySpec::from_instances([launched(&web), reserved(&db)]));
        let held = shared.snapshot();

        shared.apply(&InstanceUpdateEffect::Update {
            instance: launched(&web),
            old_state: None,
        });

        let current = shared.snapshot();
        assert_eq!(held.spec_instances(&web).len(), 1);
        assert_eq!(current.spec_instances(&web).len(), 2);
        assert!(Arc::ptr_eq(&held.spec_map()[&db], &current.spec_map()[&db]));
        assert!(!Arc::ptr_eq(&held.spec_map()[&web], &current.spec_map()[&web]));
    }
}
