//! Custom assertion helpers for integration tests.

use std::future::Future;
use std::time::Duration;

use keel_core::{InstanceId, keys};

use crate::fakes::CallLog;
use crate::fixtures::TestContext;
use crate::storage::{StoreOp, TracingMemoryStore};

/// Asserts the exact number of updates and deletes recorded by `store`.
///
/// # Panics
///
/// Panics if either count differs.
pub fn assert_store_writes(store: &TracingMemoryStore, updates: usize, deletes: usize) {
    assert_eq!(
        (store.updates(), store.deletes()),
        (updates, deletes),
        "Expected {updates} update(s) and {deletes} delete(s), operations were {:?}",
        store.operations()
    );
}

/// Asserts that no write reached `store`.
///
/// # Panics
///
/// Panics if any update or delete was recorded.
pub fn assert_no_writes(store: &TracingMemoryStore) {
    let writes: Vec<StoreOp> = store
        .operations()
        .into_iter()
        .filter(|op| matches!(op, StoreOp::Update { .. } | StoreOp::Delete { .. }))
        .collect();
    assert!(writes.is_empty(), "Expected no writes, got {writes:?}");
}

/// Asserts that `expected` occurs in `log` in order.
///
/// # Panics
///
/// Panics if the entries are missing or out of order.
pub fn assert_call_order(log: &CallLog, expected: &[&str]) {
    assert!(
        log.contains_in_order(expected),
        "Expected calls {expected:?} in order, log was {:?}",
        log.entries()
    );
}

/// Asserts that the context no longer knows `instance_id`, neither in the
/// tracker's index nor in the store.
///
/// # Panics
///
/// Panics if the instance is still indexed or persisted.
pub fn assert_instance_absent(ctx: &TestContext, instance_id: &InstanceId) {
    assert!(
        ctx.tracker.instance(instance_id).is_none(),
        "Instance {instance_id} is still indexed"
    );
    assert!(
        ctx.tracker
            .spec_instances_sync(instance_id.spec_id())
            .iter()
            .all(|i| &i.instance_id != instance_id),
        "Instance {instance_id} is still listed under its spec"
    );
    let key = keys::instance(instance_id);
    assert!(
        !ctx.store.keys().contains(&key),
        "Instance {instance_id} is still persisted"
    );
}

/// Polls `condition` until it holds or `timeout` elapses.
///
/// # Panics
///
/// Panics on timeout.
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let poll = async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(timeout, poll)
        .await
        .expect("condition did not hold in time");
}
