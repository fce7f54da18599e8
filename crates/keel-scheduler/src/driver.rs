//! Connection to the compute-offer source.
//!
//! A [`SchedulerDriver`] is created once per leadership term through a
//! [`DriverFactory`]. Its run loop blocks the calling thread until the driver
//! is stopped or fails, so the scheduler runs it on a dedicated blocking
//! worker.

use std::sync::Arc;

use keel_core::SessionId;

use crate::error::Result;
use crate::instance::RawTaskStatus;

/// One session with the offer source.
pub trait SchedulerDriver: Send + Sync {
    /// Returns the session this driver negotiated.
    fn session_id(&self) -> SessionId;

    /// Runs the driver until [`SchedulerDriver::stop`] is called or the
    /// session fails. Blocks the calling thread.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::DriverRun`] when the session ends abnormally.
    fn run(&self) -> Result<()>;

    /// Stops the run loop. With `failover` set, the offer source keeps the
    /// framework's tasks alive for the next leader.
    fn stop(&self, failover: bool);

    /// Asks the offer source to resend the status of the given tasks. An
    /// empty slice requests the status of every task it knows.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be sent.
    fn reconcile_tasks(&self, statuses: &[RawTaskStatus]) -> Result<()>;
}

/// Creates a fresh driver for each leadership term.
pub trait DriverFactory: Send + Sync {
    /// Creates a driver.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::DriverCreation`] if the connection cannot be
    /// set up.
    fn create_driver(&self) -> Result<Arc<dyn SchedulerDriver>>;
}
