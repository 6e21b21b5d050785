//! Prelude module - commonly used types for convenient import.

pub use crate::{LogConfig, LogFormat, LogTarget, RequestContext, setup_logging};
pub use crate::{TelemetryError, TelemetryResult};
