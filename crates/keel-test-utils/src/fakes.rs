//! Recording fakes for the scheduler's collaborators.
//!
//! Every fake can share a [`CallLog`] so tests can assert the relative order
//! of calls across collaborators.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use keel_core::SessionId;
use keel_scheduler::driver::{DriverFactory, SchedulerDriver};
use keel_scheduler::error::{Error, Result};
use keel_scheduler::heartbeat::HeartbeatMonitor;
use keel_scheduler::instance::RawTaskStatus;
use keel_scheduler::leader::{ElectionCandidate, ElectionService};
use keel_scheduler::migration::{Migration, StorageVersion};
use keel_scheduler::timer::{PeriodicJob, PeriodicTimer, TimerFactory};
use keel_scheduler::PrePostDriverCallback;

/// Shared, ordered log of collaborator calls.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry.
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().expect("lock").push(entry.into());
    }

    /// Returns all entries.
    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.0.lock().expect("lock").clone()
    }

    /// Counts entries equal to `entry`.
    #[must_use]
    pub fn count(&self, entry: &str) -> usize {
        self.0
            .lock()
            .expect("lock")
            .iter()
            .filter(|e| e.as_str() == entry)
            .count()
    }

    /// Returns true if `expected` occurs in order (not necessarily
    /// contiguously).
    #[must_use]
    pub fn contains_in_order(&self, expected: &[&str]) -> bool {
        let entries = self.entries();
        let mut remaining = entries.iter();
        expected
            .iter()
            .all(|want| remaining.any(|entry| entry == want))
    }
}

/// Event recorded by [`RecordingTimerFactory`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    /// A timer was created.
    Created {
        /// Sequence number of the timer.
        timer: usize,
    },
    /// A job was scheduled.
    Scheduled {
        /// Sequence number of the timer.
        timer: usize,
        /// Delay before the first run.
        initial_delay: Duration,
        /// Interval between runs.
        interval: Duration,
        /// Name of the job.
        job: &'static str,
    },
    /// A timer was cancelled.
    Cancelled {
        /// Sequence number of the timer.
        timer: usize,
    },
}

#[derive(Default)]
struct TimerRecords {
    events: Vec<TimerEvent>,
    jobs: Vec<(usize, Arc<dyn PeriodicJob>)>,
    created: usize,
}

/// [`TimerFactory`] whose timers record calls instead of running jobs.
#[derive(Clone, Default)]
pub struct RecordingTimerFactory {
    records: Arc<Mutex<TimerRecords>>,
    log: Option<CallLog>,
}

impl RecordingTimerFactory {
    /// Creates a factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Also appends `schedule` and `cancel` entries to `log`.
    #[must_use]
    pub fn with_log(log: CallLog) -> Self {
        Self {
            records: Arc::default(),
            log: Some(log),
        }
    }

    /// Returns all recorded events.
    #[must_use]
    pub fn events(&self) -> Vec<TimerEvent> {
        self.records.lock().expect("lock").events.clone()
    }

    /// Returns the `Scheduled` events.
    #[must_use]
    pub fn schedules(&self) -> Vec<TimerEvent> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, TimerEvent::Scheduled { .. }))
            .collect()
    }

    /// Returns the timers that were cancelled, in order.
    #[must_use]
    pub fn cancellations(&self) -> Vec<usize> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                TimerEvent::Cancelled { timer } => Some(timer),
                _ => None,
            })
            .collect()
    }

    /// Number of timers created so far.
    #[must_use]
    pub fn created(&self) -> usize {
        self.records.lock().expect("lock").created
    }

    /// Returns the scheduled job with the given name, most recent first.
    #[must_use]
    pub fn job(&self, name: &str) -> Option<Arc<dyn PeriodicJob>> {
        self.records
            .lock()
            .expect("lock")
            .jobs
            .iter()
            .rev()
            .find(|(_, job)| job.name() == name)
            .map(|(_, job)| Arc::clone(job))
    }
}

impl TimerFactory for RecordingTimerFactory {
    fn create(&self) -> Box<dyn PeriodicTimer> {
        let timer = {
            let mut records = self.records.lock().expect("lock");
            let timer = records.created;
            records.created += 1;
            records.events.push(TimerEvent::Created { timer });
            timer
        };
        Box::new(RecordingTimer {
            timer,
            records: Arc::clone(&self.records),
            log: self.log.clone(),
            cancelled: Mutex::new(false),
        })
    }
}

struct RecordingTimer {
    timer: usize,
    records: Arc<Mutex<TimerRecords>>,
    log: Option<CallLog>,
    cancelled: Mutex<bool>,
}

impl PeriodicTimer for RecordingTimer {
    fn schedule(&self, initial_delay: Duration, interval: Duration, job: Arc<dyn PeriodicJob>) {
        let mut records = self.records.lock().expect("lock");
        records.events.push(TimerEvent::Scheduled {
            timer: self.timer,
            initial_delay,
            interval,
            job: job.name(),
        });
        records.jobs.push((self.timer, job));
        if let Some(log) = &self.log {
            log.push("schedule");
        }
    }

    fn cancel(&self) {
        *self.cancelled.lock().expect("lock") = true;
        self.records
            .lock()
            .expect("lock")
            .events
            .push(TimerEvent::Cancelled { timer: self.timer });
        if let Some(log) = &self.log {
            log.push("cancel");
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.cancelled.lock().expect("lock")
    }
}

#[derive(Debug, Clone)]
enum Exit {
    Stopped,
    Returned,
    Failed(String),
}

/// Driver whose run loop blocks until stopped or released by the test.
pub struct FakeDriver {
    session: SessionId,
    log: CallLog,
    exit: Mutex<Option<Exit>>,
    wake: Condvar,
    stops: AtomicUsize,
    reconciliations: Mutex<Vec<Vec<RawTaskStatus>>>,
}

impl FakeDriver {
    fn new(session: SessionId, log: CallLog) -> Self {
        Self {
            session,
            log,
            exit: Mutex::new(None),
            wake: Condvar::new(),
            stops: AtomicUsize::new(0),
            reconciliations: Mutex::new(Vec::new()),
        }
    }

    fn finish(&self, exit: Exit) {
        let mut current = self.exit.lock().expect("lock");
        if current.is_none() {
            *current = Some(exit);
        }
        self.wake.notify_all();
    }

    /// Makes the run loop return `Ok` as if the session ended by itself.
    pub fn release(&self) {
        self.finish(Exit::Returned);
    }

    /// Makes the run loop fail.
    pub fn fail(&self, message: impl Into<String>) {
        self.finish(Exit::Failed(message.into()));
    }

    /// Number of `stop` calls.
    #[must_use]
    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Reconciliation requests received so far.
    #[must_use]
    pub fn reconciliations(&self) -> Vec<Vec<RawTaskStatus>> {
        self.reconciliations.lock().expect("lock").clone()
    }
}

impl SchedulerDriver for FakeDriver {
    fn session_id(&self) -> SessionId {
        self.session.clone()
    }

    fn run(&self) -> Result<()> {
        self.log.push("run");
        let mut exit = self.exit.lock().expect("lock");
        while exit.is_none() {
            exit = self.wake.wait(exit).expect("lock");
        }
        match exit.clone() {
            Some(Exit::Failed(message)) => Err(Error::driver_run(message)),
            _ => Ok(()),
        }
    }

    fn stop(&self, _failover: bool) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.log.push("stop");
        self.finish(Exit::Stopped);
    }

    fn reconcile_tasks(&self, statuses: &[RawTaskStatus]) -> Result<()> {
        self.reconciliations
            .lock()
            .expect("lock")
            .push(statuses.to_vec());
        Ok(())
    }
}

/// Creates [`FakeDriver`]s with sessions `session-1`, `session-2`, ...
#[derive(Default)]
pub struct FakeDriverFactory {
    log: CallLog,
    drivers: Mutex<Vec<Arc<FakeDriver>>>,
    fail: bool,
}

impl FakeDriverFactory {
    /// Creates a factory logging to `log`.
    #[must_use]
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            ..Self::default()
        }
    }

    /// Creates a factory that always fails.
    #[must_use]
    pub fn failing(log: CallLog) -> Self {
        Self {
            log,
            fail: true,
            ..Self::default()
        }
    }

    /// Returns the drivers created so far.
    #[must_use]
    pub fn drivers(&self) -> Vec<Arc<FakeDriver>> {
        self.drivers.lock().expect("lock").clone()
    }

    /// Returns the most recently created driver.
    #[must_use]
    pub fn last(&self) -> Option<Arc<FakeDriver>> {
        self.drivers.lock().expect("lock").last().cloned()
    }
}

impl DriverFactory for FakeDriverFactory {
    fn create_driver(&self) -> Result<Arc<dyn SchedulerDriver>> {
        if self.fail {
            return Err(Error::DriverCreation {
                message: "offer source unreachable".to_string(),
            });
        }
        let mut drivers = self.drivers.lock().expect("lock");
        let session = SessionId::new(format!("session-{}", drivers.len() + 1));
        let driver = Arc::new(FakeDriver::new(session, self.log.clone()));
        drivers.push(Arc::clone(&driver));
        Ok(driver)
    }
}

/// Call recorded by [`RecordingElection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionCall {
    /// `offer_leadership`, including re-offers after abdication.
    Offer,
    /// `abdicate_leadership`.
    Abdicate {
        /// The error flag.
        error: bool,
        /// The re-offer flag.
        reoffer: bool,
    },
}

/// [`ElectionService`] that records calls and never elects by itself.
///
/// Abdication stops the offered candidate and records a re-offer when asked
/// to; tests start leadership explicitly.
#[derive(Default)]
pub struct RecordingElection {
    log: CallLog,
    calls: Mutex<Vec<ElectionCall>>,
    candidate: Mutex<Option<Arc<dyn ElectionCandidate>>>,
}

impl RecordingElection {
    /// Creates an election logging to `log`.
    #[must_use]
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            ..Self::default()
        }
    }

    /// Returns the recorded calls.
    #[must_use]
    pub fn calls(&self) -> Vec<ElectionCall> {
        self.calls.lock().expect("lock").clone()
    }

    /// Number of offers, re-offers included.
    #[must_use]
    pub fn offers(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, ElectionCall::Offer))
            .count()
    }

    /// Returns the recorded abdications as `(error, reoffer)` pairs.
    #[must_use]
    pub fn abdications(&self) -> Vec<(bool, bool)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ElectionCall::Abdicate { error, reoffer } => Some((error, reoffer)),
                ElectionCall::Offer => None,
            })
            .collect()
    }

    /// Returns the offered candidate's id.
    #[must_use]
    pub fn candidate_id(&self) -> Option<String> {
        self.candidate
            .lock()
            .expect("lock")
            .as_ref()
            .map(|c| c.candidate_id().to_string())
    }

    fn offer(&self) {
        self.calls.lock().expect("lock").push(ElectionCall::Offer);
        self.log.push("offer");
    }
}

#[async_trait]
impl ElectionService for RecordingElection {
    async fn offer_leadership(&self, candidate: Arc<dyn ElectionCandidate>) {
        *self.candidate.lock().expect("lock") = Some(candidate);
        self.offer();
    }

    async fn abdicate_leadership(&self, error: bool, reoffer: bool) {
        self.calls
            .lock()
            .expect("lock")
            .push(ElectionCall::Abdicate { error, reoffer });
        self.log.push("abdicate");
        let candidate = self.candidate.lock().expect("lock").clone();
        if let Some(candidate) = candidate {
            candidate.stop_leadership().await;
        }
        if reoffer {
            self.offer();
        }
    }

    fn is_leader(&self) -> bool {
        false
    }
}

/// [`HeartbeatMonitor`] that records activations and deactivations.
#[derive(Default)]
pub struct RecordingHeartbeat {
    activations: Mutex<Vec<SessionId>>,
    deactivations: Mutex<Vec<SessionId>>,
}

impl RecordingHeartbeat {
    /// Creates a monitor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sessions passed to `activate`.
    #[must_use]
    pub fn activations(&self) -> Vec<SessionId> {
        self.activations.lock().expect("lock").clone()
    }

    /// Sessions passed to `deactivate`.
    #[must_use]
    pub fn deactivations(&self) -> Vec<SessionId> {
        self.deactivations.lock().expect("lock").clone()
    }
}

impl HeartbeatMonitor for RecordingHeartbeat {
    fn activate(&self, session: &SessionId) {
        self.activations.lock().expect("lock").push(session.clone());
    }

    fn deactivate(&self, session: &SessionId) {
        self.deactivations.lock().expect("lock").push(session.clone());
    }
}

/// Behavior of a [`FakeMigration`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationBehavior {
    /// Succeed immediately.
    Succeed,
    /// Fail immediately.
    Fail,
    /// Never complete.
    Hang,
}

/// [`Migration`] with scripted behavior.
pub struct FakeMigration {
    behavior: MigrationBehavior,
    log: CallLog,
    calls: AtomicUsize,
}

impl FakeMigration {
    /// Creates a migration with `behavior` logging to `log`.
    #[must_use]
    pub fn new(behavior: MigrationBehavior, log: CallLog) -> Self {
        Self {
            behavior,
            log,
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of `migrate` calls.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Migration for FakeMigration {
    async fn migrate(&self) -> Result<StorageVersion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.log.push("migrate");
        match self.behavior {
            MigrationBehavior::Succeed => Ok(StorageVersion::CURRENT),
            MigrationBehavior::Fail => Err(Error::configuration("scripted migration failure")),
            MigrationBehavior::Hang => std::future::pending::<Result<StorageVersion>>().await,
        }
    }
}

/// [`PrePostDriverCallback`] that logs `pre_driver_starts` and
/// `post_driver_terminates`.
pub struct RecordingCallback {
    log: CallLog,
    fail_pre: bool,
}

impl RecordingCallback {
    /// Creates a callback logging to `log`.
    #[must_use]
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            fail_pre: false,
        }
    }

    /// Creates a callback whose `pre_driver_starts` fails.
    #[must_use]
    pub fn failing(log: CallLog) -> Self {
        Self {
            log,
            fail_pre: true,
        }
    }
}

#[async_trait]
impl PrePostDriverCallback for RecordingCallback {
    async fn pre_driver_starts(&self) -> Result<()> {
        self.log.push("pre_driver_starts");
        if self.fail_pre {
            return Err(Error::configuration("scripted callback failure"));
        }
        Ok(())
    }

    async fn post_driver_terminates(&self) -> Result<()> {
        self.log.push("post_driver_terminates");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recording-callback"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_log_order_is_subsequence() {
        let log = CallLog::new();
        for entry in ["offer", "migrate", "run", "stop", "offer"] {
            log.push(entry);
        }
        assert!(log.contains_in_order(&["migrate", "stop", "offer"]));
        assert!(!log.contains_in_order(&["stop", "migrate"]));
        assert_eq!(log.count("offer"), 2);
    }

    #[test]
    fn stopped_driver_run_returns() {
        let factory = FakeDriverFactory::new(CallLog::new());
        let driver = factory.create_driver().unwrap();
        driver.stop(true);
        assert!(driver.run().is_ok());
        assert_eq!(factory.last().unwrap().stops(), 1);
    }
}
