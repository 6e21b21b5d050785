//! Snaps Telemetry - logging and request correlation for the Snaps runtime.
//!
//! This crate provides:
//! - [`LogConfig`] and [`setup_logging`] on top of `tracing-subscriber`
//! - [`RequestContext`] for correlating one snap request across the
//!   controller, the execution service and the runtime
//!
//! # Example
//!
//! ```rust,no_run
//! use snaps_telemetry::{LogConfig, LogFormat, RequestContext, setup_logging};
//!
//! # fn main() -> Result<(), snaps_telemetry::TelemetryError> {
//! let config = LogConfig::new("debug")
//!     .with_format(LogFormat::Compact)
//!     .with_directive("snaps_execution=trace");
//! setup_logging(&config)?;
//!
//! let ctx = RequestContext::new("controller")
//!     .with_snap("npm:example")
//!     .with_handler("onRpcRequest");
//! let _guard = ctx.span().entered();
//! tracing::info!("routing request");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

mod context;
mod error;
mod logging;

pub use context::RequestContext;
pub use error::{TelemetryError, TelemetryResult};
pub use logging::{
    FileRotation, LogConfig, LogFormat, LogTarget, setup_default_logging, setup_logging,
};
