//! Shared test utilities for keel integration tests.
//!
//! This crate provides:
//! - [`TracingMemoryStore`]: in-memory store with operation recording
//! - Fixture builders for instances and task statuses
//! - Recording fakes for every scheduler collaborator
//! - Assertion helpers
//!
//! # Example
//!
//! ```rust,ignore
//! use keel_test_utils::{InstanceFactory, TracingMemoryStore};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let store = TracingMemoryStore::new();
//!     let instance = InstanceFactory::launched("/web");
//!     // ... run test ...
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod assertions;
pub mod fakes;
pub mod fixtures;
pub mod storage;

pub use assertions::*;
pub use fakes::*;
pub use fixtures::*;
pub use storage::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("keel=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
