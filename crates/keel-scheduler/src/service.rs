//! Leadership lifecycle of the scheduler.
//!
//! [`SchedulerService`] is the election candidate of this process. While it
//! holds leadership a *term* is active:
//!
//! 1. the persisted schema is migrated (bounded by `zk_timeout`)
//! 2. a driver is created for the offer source
//! 3. pre-start callbacks run in registration order
//! 4. the driver's blocking run loop starts on a dedicated worker and the
//!    heartbeat monitor follows its session
//! 5. task reconciliation and scale checks are scheduled on the term's timer
//!
//! Any failure in steps 1-4 ends the term and abdicates with re-offer.
//!
//! ## Cancellation
//!
//! Every term carries a [`CancellationToken`]. Stopping cancels it first, so a
//! start still in flight aborts at its next step instead of racing the
//! teardown. The leadership state mutex is held only for bookkeeping, never
//! across migration, callbacks or the run loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use ulid::Ulid;

use keel_core::observability::leadership_span;
use keel_core::{FrameworkId, PersistentStore};

use crate::callbacks::PrePostDriverCallback;
use crate::config::SchedulerConfig;
use crate::driver::{DriverFactory, SchedulerDriver};
use crate::error::{Error, Result};
use crate::framework_id::FrameworkIdRepository;
use crate::heartbeat::{HeartbeatMonitor, SessionHeartbeatMonitor};
use crate::leader::{ElectionCandidate, ElectionService};
use crate::migration::{Migration, StorageVersionMigration};
use crate::reconciliation::{LoggingScaleCheck, ScaleCheck, ScaleCheckJob, TaskReconciliationJob};
use crate::timer::{PeriodicTimer, TimerFactory, TokioTimerFactory};
use crate::tracker::InstanceTracker;

const NO_TERM: u64 = 0;

struct ActiveTerm {
    id: u64,
    cancel: CancellationToken,
    driver: Option<Arc<dyn SchedulerDriver>>,
}

struct LeadershipState {
    term: Option<ActiveTerm>,
    timer: Box<dyn PeriodicTimer>,
}

impl LeadershipState {
    fn current(&self, term: u64) -> Option<&ActiveTerm> {
        self.term
            .as_ref()
            .filter(|active| active.id == term && !active.cancel.is_cancelled())
    }
}

/// The leadership lifecycle controller.
pub struct SchedulerService {
    node_id: String,
    config: SchedulerConfig,
    migration: Arc<dyn Migration>,
    driver_factory: Arc<dyn DriverFactory>,
    election: Arc<dyn ElectionService>,
    heartbeat: Arc<dyn HeartbeatMonitor>,
    timers: Arc<dyn TimerFactory>,
    tracker: InstanceTracker,
    scale_check: Arc<dyn ScaleCheck>,
    callbacks: Vec<Arc<dyn PrePostDriverCallback>>,
    framework_ids: FrameworkIdRepository,
    handle: Handle,
    state: Mutex<LeadershipState>,
    stopping: Mutex<()>,
    next_term: AtomicU64,
    current_term: AtomicU64,
    this: Weak<Self>,
}

impl std::fmt::Debug for SchedulerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerService")
            .field("node_id", &self.node_id)
            .field("config", &self.config)
            .field("term", &self.term())
            .finish_non_exhaustive()
    }
}

impl SchedulerService {
    /// Starts building a service.
    #[must_use]
    pub fn builder() -> SchedulerServiceBuilder {
        SchedulerServiceBuilder::default()
    }

    /// Identity presented to the election service.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// The instance tracker shared with the scheduler's jobs.
    #[must_use]
    pub const fn tracker(&self) -> &InstanceTracker {
        &self.tracker
    }

    /// Returns the active term number, if this node is leading.
    #[must_use]
    pub fn term(&self) -> Option<u64> {
        match self.current_term.load(Ordering::SeqCst) {
            NO_TERM => None,
            term => Some(term),
        }
    }

    /// Returns true while a leadership term is active.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.term().is_some()
    }

    /// Enters this node into the election.
    pub async fn offer_leadership(self: &Arc<Self>) {
        let candidate: Arc<dyn ElectionCandidate> = Arc::clone(self) as Arc<dyn ElectionCandidate>;
        self.election.offer_leadership(candidate).await;
    }

    /// Stops the active term and withdraws from the election.
    pub async fn shutdown(&self) {
        self.stop_term(None).await;
        self.election.abdicate_leadership(false, false).await;
    }

    /// Reads the framework id from the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn framework_id(&self) -> Result<Option<FrameworkId>> {
        self.framework_ids.get().await
    }

    #[tracing::instrument(skip(self), fields(node = %self.node_id))]
    async fn start_term(&self) {
        let (term, cancel) = {
            let _stopping = self.stopping.lock().await;
            let mut state = self.state.lock().await;
            if let Some(active) = &state.term {
                tracing::warn!(term = active.id, "leadership already started");
                return;
            }
            let term = self.next_term.fetch_add(1, Ordering::SeqCst) + 1;
            let cancel = CancellationToken::new();
            state.term = Some(ActiveTerm {
                id: term,
                cancel: cancel.clone(),
                driver: None,
            });
            self.current_term.store(term, Ordering::SeqCst);
            (term, cancel)
        };

        let result = self
            .run_term(term, &cancel)
            .instrument(leadership_span(term))
            .await;
        match result {
            Ok(()) => tracing::info!(term, "leadership started"),
            Err(err) if cancel.is_cancelled() => {
                tracing::info!(term, error = %err, "leadership start aborted by stop");
            }
            Err(err) => {
                tracing::error!(term, error = %err, "leadership start failed");
                self.abdicate(term, true).await;
            }
        }
    }

    async fn run_term(&self, term: u64, cancel: &CancellationToken) -> Result<()> {
        let version = bounded(cancel, "migration", self.config.zk_timeout, self.migration.migrate())
            .await
            .map_err(|err| match err {
                Error::TermEnded | Error::MigrationFailed(_) => err,
                other => Error::MigrationFailed(Box::new(other)),
            })?;
        tracing::info!(%version, "migration complete");

        let driver = self.driver_factory.create_driver().map_err(|err| match err {
            Error::DriverCreation { .. } => err,
            other => Error::DriverCreation {
                message: other.to_string(),
            },
        })?;
        {
            let mut state = self.state.lock().await;
            match state.term.as_mut() {
                Some(active) if active.id == term && !cancel.is_cancelled() => {
                    active.driver = Some(Arc::clone(&driver));
                }
                _ => return Err(Error::TermEnded),
            }
        }

        for callback in &self.callbacks {
            let name = callback.name();
            bounded(
                cancel,
                name,
                self.config.on_elected_prepare_timeout,
                callback.pre_driver_starts(),
            )
            .await
            .map_err(|err| match err {
                Error::TermEnded => err,
                other => Error::Callback {
                    callback: name.to_string(),
                    message: other.to_string(),
                },
            })?;
            tracing::debug!(callback = name, "pre-start callback done");
        }

        let state = self.state.lock().await;
        if state.current(term).is_none() {
            return Err(Error::TermEnded);
        }
        let session = driver.session_id();
        self.heartbeat.activate(&session);
        self.spawn_run_loop(term, cancel.clone(), Arc::clone(&driver))?;
        tracing::info!(%session, "driver running");

        state.timer.schedule(
            self.config.reconciliation_initial_delay,
            self.config.reconciliation_interval,
            Arc::new(TaskReconciliationJob::new(self.tracker.clone(), driver)),
        );
        state.timer.schedule(
            self.config.scale_apps_initial_delay,
            self.config.scale_apps_interval,
            Arc::new(ScaleCheckJob::new(
                self.tracker.clone(),
                Arc::clone(&self.scale_check),
            )),
        );
        Ok(())
    }

    fn spawn_run_loop(
        &self,
        term: u64,
        cancel: CancellationToken,
        driver: Arc<dyn SchedulerDriver>,
    ) -> Result<()> {
        let this = self.this.upgrade().ok_or(Error::TermEnded)?;
        let run = self.handle.spawn_blocking(move || driver.run());
        self.handle.spawn(
            async move {
                let outcome = run.await;
                if cancel.is_cancelled() {
                    tracing::debug!("run loop ended after stop");
                    return;
                }
                let error = match outcome {
                    Ok(Ok(())) => {
                        tracing::warn!("run loop exited while leading");
                        false
                    }
                    Ok(Err(err)) => {
                        tracing::error!(error = %err, "run loop failed");
                        true
                    }
                    Err(join) => {
                        tracing::error!(error = %join, "run loop panicked");
                        true
                    }
                };
                this.abdicate(term, error).await;
            }
            .instrument(leadership_span(term)),
        );
        Ok(())
    }

    async fn abdicate(&self, term: u64, error: bool) {
        if self.stop_term(Some(term)).await {
            self.election.abdicate_leadership(error, true).await;
        }
    }

    /// Tears the active term down. With `expected`, only that term is
    /// stopped. Returns true if a term was stopped.
    async fn stop_term(&self, expected: Option<u64>) -> bool {
        let _stopping = self.stopping.lock().await;
        let (term, stale_timer) = {
            let mut state = self.state.lock().await;
            let matches = state
                .term
                .as_ref()
                .is_some_and(|active| expected.is_none_or(|id| id == active.id));
            if !matches {
                return false;
            }
            let Some(term) = state.term.take() else {
                return false;
            };
            term.cancel.cancel();
            self.current_term.store(NO_TERM, Ordering::SeqCst);
            let stale_timer = std::mem::replace(&mut state.timer, self.timers.create());
            (term, stale_timer)
        };
        leadership_span(term.id).in_scope(|| {
            stale_timer.cancel();
            if let Some(driver) = &term.driver {
                self.heartbeat.deactivate(&driver.session_id());
                driver.stop(true);
            }
        });

        for callback in &self.callbacks {
            let name = callback.name();
            match tokio::time::timeout(
                self.config.on_elected_prepare_timeout,
                callback.post_driver_terminates(),
            )
            .await
            {
                Ok(Ok(())) => tracing::debug!(callback = name, "post-stop callback done"),
                Ok(Err(err)) => {
                    tracing::warn!(callback = name, error = %err, "post-stop callback failed");
                }
                Err(_) => tracing::warn!(callback = name, "post-stop callback timed out"),
            }
        }
        tracing::info!(term = term.id, "leadership stopped");
        true
    }
}

#[async_trait]
impl ElectionCandidate for SchedulerService {
    fn candidate_id(&self) -> &str {
        &self.node_id
    }

    async fn start_leadership(&self) {
        self.start_term().await;
    }

    async fn stop_leadership(&self) {
        self.stop_term(None).await;
    }
}

async fn bounded<T, F>(
    cancel: &CancellationToken,
    operation: &'static str,
    after: Duration,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        () = cancel.cancelled() => Err(Error::TermEnded),
        result = tokio::time::timeout(after, fut) => {
            result.map_err(|_| Error::Timeout { operation, after })?
        }
    }
}

/// Builder for [`SchedulerService`].
#[derive(Default)]
pub struct SchedulerServiceBuilder {
    config: SchedulerConfig,
    node_id: Option<String>,
    store: Option<Arc<dyn PersistentStore>>,
    migration: Option<Arc<dyn Migration>>,
    driver_factory: Option<Arc<dyn DriverFactory>>,
    election: Option<Arc<dyn ElectionService>>,
    heartbeat: Option<Arc<dyn HeartbeatMonitor>>,
    timers: Option<Arc<dyn TimerFactory>>,
    tracker: Option<InstanceTracker>,
    scale_check: Option<Arc<dyn ScaleCheck>>,
    callbacks: Vec<Arc<dyn PrePostDriverCallback>>,
    handle: Option<Handle>,
}

impl SchedulerServiceBuilder {
    /// Sets the timing configuration.
    #[must_use]
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the node identity. Defaults to a random ULID.
    #[must_use]
    pub fn node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// Sets the persistent store. Required.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the migration. Defaults to [`StorageVersionMigration`].
    #[must_use]
    pub fn migration(mut self, migration: Arc<dyn Migration>) -> Self {
        self.migration = Some(migration);
        self
    }

    /// Sets the driver factory. Required.
    #[must_use]
    pub fn driver_factory(mut self, factory: Arc<dyn DriverFactory>) -> Self {
        self.driver_factory = Some(factory);
        self
    }

    /// Sets the election service. Required.
    #[must_use]
    pub fn election(mut self, election: Arc<dyn ElectionService>) -> Self {
        self.election = Some(election);
        self
    }

    /// Sets the heartbeat monitor. Defaults to [`SessionHeartbeatMonitor`].
    #[must_use]
    pub fn heartbeat(mut self, heartbeat: Arc<dyn HeartbeatMonitor>) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    /// Sets the timer factory. Defaults to [`TokioTimerFactory`].
    #[must_use]
    pub fn timers(mut self, timers: Arc<dyn TimerFactory>) -> Self {
        self.timers = Some(timers);
        self
    }

    /// Sets the instance tracker. Defaults to a tracker over the store.
    #[must_use]
    pub fn tracker(mut self, tracker: InstanceTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Sets the scale check. Defaults to [`LoggingScaleCheck`].
    #[must_use]
    pub fn scale_check(mut self, scale_check: Arc<dyn ScaleCheck>) -> Self {
        self.scale_check = Some(scale_check);
        self
    }

    /// Registers a lifecycle callback. Callbacks run in registration order,
    /// after the tracker's own index load.
    #[must_use]
    pub fn callback(mut self, callback: Arc<dyn PrePostDriverCallback>) -> Self {
        self.callbacks.push(callback);
        self
    }

    /// Sets the runtime used for the run loop and default timers. Defaults
    /// to the current runtime.
    #[must_use]
    pub fn handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Builds the service.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a required collaborator is missing
    /// or no runtime handle is available.
    pub fn build(self) -> Result<Arc<SchedulerService>> {
        let store = self
            .store
            .ok_or_else(|| Error::configuration("a persistent store is required"))?;
        let driver_factory = self
            .driver_factory
            .ok_or_else(|| Error::configuration("a driver factory is required"))?;
        let election = self
            .election
            .ok_or_else(|| Error::configuration("an election service is required"))?;
        let handle = match self.handle {
            Some(handle) => handle,
            None => Handle::try_current()
                .map_err(|err| Error::configuration(format!("no tokio runtime: {err}")))?,
        };

        let tracker = self
            .tracker
            .unwrap_or_else(|| InstanceTracker::new(Arc::clone(&store)))
            .with_startup_timeout(self.config.max_actor_startup_time);
        let migration = self
            .migration
            .unwrap_or_else(|| Arc::new(StorageVersionMigration::new(Arc::clone(&store))));
        let timers = self
            .timers
            .unwrap_or_else(|| Arc::new(TokioTimerFactory::new(handle.clone())));
        let mut callbacks: Vec<Arc<dyn PrePostDriverCallback>> =
            Vec::with_capacity(self.callbacks.len() + 1);
        callbacks.push(Arc::new(tracker.clone()));
        callbacks.extend(self.callbacks);

        let node_id = self.node_id.unwrap_or_else(|| Ulid::new().to_string());
        let initial_timer = timers.create();

        Ok(Arc::new_cyclic(|this| SchedulerService {
            node_id,
            config: self.config,
            migration,
            driver_factory,
            election,
            heartbeat: self
                .heartbeat
                .unwrap_or_else(|| Arc::new(SessionHeartbeatMonitor::default())),
            timers,
            tracker,
            scale_check: self
                .scale_check
                .unwrap_or_else(|| Arc::new(LoggingScaleCheck)),
            callbacks,
            framework_ids: FrameworkIdRepository::new(store),
            handle,
            state: Mutex::new(LeadershipState {
                term: None,
                timer: initial_timer,
            }),
            stopping: Mutex::new(()),
            next_term: AtomicU64::new(NO_TERM),
            current_term: AtomicU64::new(NO_TERM),
            this: this.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use keel_core::MemoryStore;

    use super::*;

    struct NeverDriver;

    impl DriverFactory for NeverDriver {
        fn create_driver(&self) -> Result<Arc<dyn SchedulerDriver>> {
            Err(Error::DriverCreation {
                message: "offer source unreachable".to_string(),
            })
        }
    }

    struct Quiet;

    #[async_trait]
    impl ElectionService for Quiet {
        async fn offer_leadership(&self, _candidate: Arc<dyn ElectionCandidate>) {}
        async fn abdicate_leadership(&self, _error: bool, _reoffer: bool) {}
        fn is_leader(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn build_requires_collaborators() {
        let err = SchedulerService::builder().build().unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));

        let service = SchedulerService::builder()
            .store(Arc::new(MemoryStore::new()))
            .driver_factory(Arc::new(NeverDriver))
            .election(Arc::new(Quiet))
            .node_id("node-a")
            .build()
            .unwrap();
        assert_eq!(service.candidate_id(), "node-a");
        assert!(!service.is_leader());
    }

    #[tokio::test]
    async fn driver_creation_failure_ends_the_term() {
        let service = SchedulerService::builder()
            .store(Arc::new(MemoryStore::new()))
            .driver_factory(Arc::new(NeverDriver))
            .election(Arc::new(Quiet))
            .build()
            .unwrap();

        service.start_leadership().await;
        assert!(!service.is_leader());
        assert_eq!(service.term(), None);

        // Stopping a follower is a no-op.
        service.stop_leadership().await;
        assert!(!service.is_leader());
    }
}
