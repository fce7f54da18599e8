//! Hooks run around the offer-source connection of a leadership term.

use async_trait::async_trait;

use crate::error::Result;

/// A component that prepares before the driver runs and cleans up after it
/// stops.
///
/// The scheduler awaits callbacks one at a time in registration order, each
/// bounded by the on-elected preparation timeout.
#[async_trait]
pub trait PrePostDriverCallback: Send + Sync {
    /// Runs after migration and driver creation, before the run loop starts.
    ///
    /// # Errors
    ///
    /// An error aborts the leadership term.
    async fn pre_driver_starts(&self) -> Result<()>;

    /// Runs after the driver has been stopped.
    ///
    /// # Errors
    ///
    /// Errors are logged; teardown continues with the next callback.
    async fn post_driver_terminates(&self) -> Result<()>;

    /// Name used in logs and errors.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}
