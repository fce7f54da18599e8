//! # keel-scheduler
//!
//! State tracking and leadership lifecycle for the keel cluster scheduler.
//!
//! - **Instance tracking**: every instance mutation is an
//!   [`InstanceUpdateOperation`] applied by a single writer that serializes
//!   per instance id, persists the whole record and patches an in-memory
//!   index grouped by spec
//! - **Leadership lifecycle**: [`SchedulerService`] migrates the schema,
//!   connects to the offer source and runs periodic reconciliation only while
//!   this node is the elected leader
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use chrono::Utc;
//! use keel_core::{InstanceId, MemoryStore, PathId, TaskId};
//! use keel_scheduler::instance::{AgentInfo, Instance, Task};
//! use keel_scheduler::{InstanceTracker, InstanceUpdateOperation, Result};
//!
//! # async fn example() -> Result<()> {
//! let tracker = InstanceTracker::new(Arc::new(MemoryStore::new()));
//! let spec: PathId = "/prod/web".parse()?;
//! let id = InstanceId::for_spec(&spec);
//! let now = Utc::now();
//! let task = Task::launched_ephemeral(TaskId::for_instance(&id), now, now);
//! let instance = Instance::new(id, AgentInfo::on_host("agent-1"), [task], now, now);
//!
//! tracker
//!     .process(InstanceUpdateOperation::LaunchEphemeral(instance))
//!     .await?;
//! assert_eq!(tracker.count_launched_spec_instances_sync(&spec), 1);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod callbacks;
pub mod config;
pub mod driver;
pub mod error;
pub mod framework_id;
pub mod heartbeat;
pub mod instance;
pub mod leader;
pub mod migration;
pub mod reconciliation;
pub mod service;
pub mod timer;
pub mod tracker;

pub use callbacks::PrePostDriverCallback;
pub use config::SchedulerConfig;
pub use driver::{DriverFactory, SchedulerDriver};
pub use error::{Error, Result};
pub use framework_id::FrameworkIdRepository;
pub use heartbeat::{HeartbeatMonitor, Liveness, SessionHeartbeatMonitor};
pub use instance::{Instance, InstanceUpdateEffect, InstanceUpdateOperation};
pub use leader::{ElectionCandidate, ElectionService};
pub use migration::{Migration, StorageVersion, StorageVersionMigration};
pub use service::{SchedulerService, SchedulerServiceBuilder};
pub use timer::{PeriodicJob, PeriodicTimer, TimerFactory, TokioTimerFactory};
pub use tracker::{InstanceChange, InstanceTracker, InstancesBySpec, SpecInstances};
