//! Periodic job scheduling.
//!
//! A [`PeriodicTimer`] belongs to exactly one leadership term. Cancelling it
//! stops every job it scheduled; the scheduler then replaces it with a fresh
//! timer from the [`TimerFactory`] so a cancelled timer is never reused.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Work executed on every tick of a timer.
#[async_trait]
pub trait PeriodicJob: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Runs one iteration.
    ///
    /// # Errors
    ///
    /// Errors are logged; the job keeps its schedule.
    async fn run(&self) -> Result<()>;
}

/// Timer that runs jobs with a fixed delay and interval until cancelled.
pub trait PeriodicTimer: Send + Sync {
    /// Runs `job` after `initial_delay`, then every `interval`.
    fn schedule(&self, initial_delay: Duration, interval: Duration, job: Arc<dyn PeriodicJob>);

    /// Stops every scheduled job. Idempotent.
    fn cancel(&self);

    /// Returns true once [`PeriodicTimer::cancel`] has been called.
    fn is_cancelled(&self) -> bool;
}

/// Creates unscheduled timers.
pub trait TimerFactory: Send + Sync {
    /// Creates a fresh timer.
    fn create(&self) -> Box<dyn PeriodicTimer>;
}

/// [`PeriodicTimer`] running jobs as tasks on a tokio runtime.
#[derive(Debug)]
pub struct TokioTimer {
    handle: Handle,
    token: CancellationToken,
}

impl TokioTimer {
    /// Creates a timer spawning onto `handle`.
    #[must_use]
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            token: CancellationToken::new(),
        }
    }
}

impl PeriodicTimer for TokioTimer {
    fn schedule(&self, initial_delay: Duration, interval: Duration, job: Arc<dyn PeriodicJob>) {
        if self.token.is_cancelled() {
            tracing::warn!(job = job.name(), "ignoring schedule on a cancelled timer");
            return;
        }
        let token = self.token.clone();
        self.handle.spawn(async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + initial_delay, interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = token.cancelled() => {
                        tracing::debug!(job = job.name(), "periodic job stopped");
                        break;
                    }
                    _ = ticks.tick() => {
                        if let Err(err) = job.run().await {
                            tracing::warn!(job = job.name(), error = %err, "periodic job failed");
                        }
                    }
                }
            }
        });
    }

    fn cancel(&self) {
        self.token.cancel();
    }

    fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Creates [`TokioTimer`]s on a fixed runtime.
#[derive(Debug, Clone)]
pub struct TokioTimerFactory {
    handle: Handle,
}

impl TokioTimerFactory {
    /// Creates a factory spawning onto `handle`.
    #[must_use]
    pub const fn new(handle: Handle) -> Self {
        Self { handle }
    }
}

impl TimerFactory for TokioTimerFactory {
    fn create(&self) -> Box<dyn PeriodicTimer> {
        Box::new(TokioTimer::new(self.handle.clone()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Counter(AtomicUsize);

    #[async_trait]
    impl PeriodicJob for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        async fn run(&self) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_after_delay_then_every_interval_until_cancelled() {
        let timer = TokioTimerFactory::new(Handle::current()).create();
        let job = Arc::new(Counter(AtomicUsize::new(0)));
        timer.schedule(
            Duration::from_secs(5),
            Duration::from_secs(10),
            Arc::clone(&job) as Arc<dyn PeriodicJob>,
        );

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(job.0.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(job.0.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(job.0.load(Ordering::SeqCst), 2);

        timer.cancel();
        assert!(timer.is_cancelled());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(job.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn schedule_after_cancel_is_ignored() {
        let timer = TokioTimer::new(Handle::current());
        timer.cancel();
        timer.cancel();
        let job = Arc::new(Counter(AtomicUsize::new(0)));
        timer.schedule(Duration::ZERO, Duration::from_millis(1), job.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(job.0.load(Ordering::SeqCst), 0);
    }
}
