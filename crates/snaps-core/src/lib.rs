//! Snaps Core - shared types for the Snaps plugin runtime.
//!
//! This crate provides:
//! - [`SnapId`]: validated, stable plugin identifiers
//! - [`SnapManifest`]: the manifest shape consumed by the controller
//! - [`HandlerType`]: the entry points a snap may export
//! - JSON-RPC request/error shapes shared by every layer
//! - [`Timer`]: a pausable, resumable, cancelable deadline
//!
//! # Example
//!
//! ```
//! use snaps_core::{SnapId, HandlerType};
//!
//! let id = SnapId::new("npm:@acme/example-snap").unwrap();
//! assert_eq!(id.as_str(), "npm:@acme/example-snap");
//! assert_eq!(HandlerType::OnRpcRequest.as_str(), "onRpcRequest");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

mod error;
mod handler;
mod id;
mod json_rpc;
mod manifest;
pub mod timer;

pub use error::{CoreError, CoreResult};
pub use handler::{HandlerType, TimeoutClass};
pub use id::SnapId;
pub use json_rpc::{JsonRpcError, JsonRpcId, JsonRpcRequest};
pub use manifest::{
    Caveat, PermissionRequest, SnapLocationRef, SnapManifest, SnapSource, shasum_of,
};
pub use timer::{Timer, TimerError, TimerStatus};
