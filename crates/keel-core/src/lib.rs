//! # keel-core
//!
//! Shared primitives for the keel scheduler:
//!
//! - **Identifiers**: spec paths, instance and task ids, offer-source sessions
//! - **Persistence contract**: the [`PersistentStore`] trait and an in-memory
//!   implementation
//! - **Errors**: the shared [`Error`] type and [`Result`] alias
//! - **Observability**: logging initialization and span helpers
//!
//! ## Example
//!
//! ```rust
//! use keel_core::prelude::*;
//!
//! let spec: PathId = "/prod/web".parse().unwrap();
//! let instance = InstanceId::for_spec(&spec);
//! assert_eq!(instance.spec_id(), &spec);
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod observability;
pub mod storage;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{FrameworkId, InstanceId, PathId, SessionId, TaskId};
    pub use crate::storage::{MemoryStore, PersistentStore};
}

pub use error::{Error, Result};
pub use id::{FrameworkId, InstanceId, PathId, SessionId, TaskId};
pub use observability::{LogFormat, init_logging};
pub use storage::{MemoryStore, PersistentStore, keys};
