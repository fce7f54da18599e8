//! Election services driving real scheduler services.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use keel_core::PersistentStore;
use keel_scheduler::leader::{
    InMemoryLeaderElector, LeaseElectionConfig, LeaseElectionService, PseudoElectionService,
};
use keel_scheduler::{ElectionService, SchedulerConfig, SchedulerService};
use keel_test_utils::{
    CallLog, FakeDriverFactory, RecordingTimerFactory, TracingMemoryStore, eventually,
    init_test_logging,
};
use tokio::runtime::Handle;

const WAIT: Duration = Duration::from_secs(5);

struct Node {
    drivers: Arc<FakeDriverFactory>,
    service: Arc<SchedulerService>,
}

fn node(
    name: &str,
    store: &Arc<TracingMemoryStore>,
    election: Arc<dyn ElectionService>,
) -> Node {
    let drivers = Arc::new(FakeDriverFactory::new(CallLog::new()));
    let service = SchedulerService::builder()
        .config(SchedulerConfig {
            zk_timeout: Duration::from_secs(1),
            ..SchedulerConfig::default()
        })
        .node_id(name)
        .store(store.clone() as Arc<dyn PersistentStore>)
        .driver_factory(drivers.clone())
        .election(election)
        .timers(Arc::new(RecordingTimerFactory::new()))
        .build()
        .unwrap();
    Node { drivers, service }
}

async fn wait_until(condition: impl Fn() -> bool + Clone) {
    eventually(WAIT, move || {
        let condition = condition.clone();
        async move { condition() }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_node_election_restarts_the_term_after_failure() {
    init_test_logging();
    let store = Arc::new(TracingMemoryStore::new());
    let election = Arc::new(PseudoElectionService::new(
        Handle::current(),
        Duration::from_millis(20),
    ));
    let n = node("solo", &store, election.clone());

    n.service.offer_leadership().await;
    let service = Arc::clone(&n.service);
    wait_until(move || service.term() == Some(1)).await;
    assert!(election.is_leader());

    let drivers = Arc::clone(&n.drivers);
    wait_until(move || drivers.drivers().len() == 1).await;
    n.drivers.last().unwrap().fail("session closed");

    let drivers = Arc::clone(&n.drivers);
    wait_until(move || drivers.drivers().len() == 2).await;
    assert_eq!(n.service.term(), Some(2));
    assert_eq!(n.drivers.drivers()[0].stops(), 1);

    n.service.shutdown().await;
    assert!(!n.service.is_leader());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lease_election_hands_leadership_over_on_shutdown() {
    init_test_logging();
    let store = Arc::new(TracingMemoryStore::new());
    let elector = Arc::new(InMemoryLeaderElector::new(Duration::from_secs(2)));
    let config = LeaseElectionConfig {
        lock_key: "keel/test-leader".to_string(),
        renew_interval: Duration::from_millis(50),
        retry_interval: Duration::from_millis(20),
    };
    let a = node(
        "node-a",
        &store,
        Arc::new(LeaseElectionService::new(
            Arc::clone(&elector),
            config.clone(),
            Handle::current(),
        )),
    );
    let b = node(
        "node-b",
        &store,
        Arc::new(LeaseElectionService::new(
            Arc::clone(&elector),
            config,
            Handle::current(),
        )),
    );

    a.service.offer_leadership().await;
    let leader = Arc::clone(&a.service);
    wait_until(move || leader.is_leader()).await;
    b.service.offer_leadership().await;

    // The follower keeps campaigning without starting a term.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!b.service.is_leader());
    assert!(b.drivers.drivers().is_empty());

    a.service.shutdown().await;
    assert!(!a.service.is_leader());

    let drivers = Arc::clone(&b.drivers);
    wait_until(move || drivers.drivers().len() == 1).await;
    assert!(b.service.is_leader());
    assert_eq!(a.drivers.drivers().len(), 1);

    b.service.shutdown().await;
}
