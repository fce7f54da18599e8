//! Error types for the scheduler core.

use std::time::Duration;

use keel_core::{InstanceId, PathId, TaskId};

/// The result type used throughout keel-scheduler.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by state operations and the leadership lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A status update targeted an instance with no persisted record.
    #[error("{instance_id} of app [{spec_id}] does not exist")]
    InstanceNotFound {
        /// The instance that was looked up.
        instance_id: InstanceId,
        /// The spec the instance belongs to.
        spec_id: PathId,
    },

    /// A status update named a task the instance does not contain.
    #[error("{task_id} not found in {instance_id}")]
    TaskNotFound {
        /// The task named by the status.
        task_id: TaskId,
        /// The instance that was searched.
        instance_id: InstanceId,
    },

    /// Schema migration failed or timed out.
    #[error("migration failed: {0}")]
    MigrationFailed(#[source] Box<Error>),

    /// The offer-source connection could not be created.
    #[error("driver creation failed: {message}")]
    DriverCreation {
        /// Description of the failure.
        message: String,
    },

    /// The offer-source run loop failed.
    #[error("driver run loop failed: {message}")]
    DriverRun {
        /// Description of the failure.
        message: String,
    },

    /// A lifecycle callback failed.
    #[error("lifecycle callback {callback} failed: {message}")]
    Callback {
        /// The callback that failed.
        callback: String,
        /// Description of the failure.
        message: String,
    },

    /// A bounded operation did not complete in time.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// The operation that timed out.
        operation: &'static str,
        /// The bound that was exceeded.
        after: Duration,
    },

    /// The leadership term ended while an operation was in flight.
    #[error("leadership term ended")]
    TermEnded,

    /// Configuration was missing or invalid.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the problem.
        message: String,
    },

    /// An error from keel-core (storage, serialization, identifiers).
    #[error(transparent)]
    Core(#[from] keel_core::Error),
}

impl Error {
    /// Creates a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a driver-run error.
    #[must_use]
    pub fn driver_run(message: impl Into<String>) -> Self {
        Self::DriverRun {
            message: message.into(),
        }
    }

    /// Returns true if the error reports a missing instance or task.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::InstanceNotFound { .. } | Self::TaskNotFound { .. }
        )
    }

    /// Returns true if the error came from the persistence layer.
    #[must_use]
    pub const fn is_storage(&self) -> bool {
        matches!(self, Self::Core(keel_core::Error::Storage { .. }))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Core(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_not_found_message_names_instance_and_app() {
        let spec: PathId = "/prod/web".parse().unwrap();
        let instance_id = InstanceId::for_spec(&spec);
        let err = Error::InstanceNotFound {
            instance_id: instance_id.clone(),
            spec_id: spec,
        };
        let msg = err.to_string();
        assert!(msg.contains(&instance_id.to_string()));
        assert!(msg.contains("of app [/prod/web]"));
        assert!(msg.contains("does not exist"));
        assert!(err.is_not_found());
    }

    #[test]
    fn storage_errors_are_classified() {
        let err: Error = keel_core::Error::storage("zk unavailable").into();
        assert!(err.is_storage());
        assert!(!err.is_not_found());
    }

    #[test]
    fn migration_failure_wraps_timeout() {
        let err = Error::MigrationFailed(Box::new(Error::Timeout {
            operation: "migration",
            after: Duration::from_secs(10),
        }));
        assert!(err.to_string().contains("migration timed out"));
    }
}
