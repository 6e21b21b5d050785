//! Snaps Test - shared test utilities for the Snaps runtime.
//!
//! This crate provides fixtures (bundles, manifests, a registry with the
//! built-in permissions) and a [`ScriptedExecutor`] that stands in for real
//! snap code inside an in-process runtime.
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! snaps-test.workspace = true
//! ```
//!
//! ```rust,ignore
//! use snaps_test::{Behavior, ScriptedExecutor};
//!
//! let executor = ScriptedExecutor::new().on("hello", Behavior::Reply(json!("world")));
//! let service = ExecutionService::new(executor.backend(), ExecutionConfig::default());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod prelude;

pub mod executor;
pub mod fixtures;

pub use executor::{Behavior, RecordedCall, ScriptedExecutor};
pub use fixtures::*;

/// Install a test-friendly subscriber once. Honors `RUST_LOG`; defaults to
/// `warn`.
pub fn init_test_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
