//! Snaps Controller - the lifecycle of installed snaps.
//!
//! [`SnapController`] owns every snap record and drives it through
//! install, approval, lazy start, request routing, crash handling, update
//! and removal. It sits on top of the execution service and the capability
//! registry:
//!
//! - install and update fetch a manifest through a [`LocationFactory`],
//!   verify the bundle, ask an [`ApprovalHandler`] and record grants
//! - [`SnapController::handle_request`] checks the gates, starts the snap
//!   if needed and invokes the handler under its timeout
//! - a runtime that hangs, dies or reports an unhandled error marks its
//!   snaps crashed until an operator restarts them
//! - [`CronScheduler`] delivers `onCronjob` requests
//! - [`NamespaceMatcher`] assigns chain namespaces to snaps for sessions
//!
//! ```no_run
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! use snaps_capabilities::CapabilityRegistry;
//! use snaps_controller::prelude::*;
//! use snaps_core::SnapId;
//! use snaps_execution::backend::ProcessBackend;
//!
//! # async fn demo(registry: Arc<CapabilityRegistry>) -> Result<(), Box<dyn std::error::Error>> {
//! let controller = SnapController::builder(Arc::new(ProcessBackend::from_path()?), registry)
//!     .with_approval_handler(Arc::new(AutoApprove))
//!     .build();
//!
//! let snap_id = SnapId::new("local:/opt/snaps/hello")?;
//! controller
//!     .install("https://dapp.example", BTreeMap::from([(snap_id, "^1".parse()?)]))
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod approval;
pub mod cron;
pub mod location;
pub mod prelude;
pub mod session;

mod controller;
mod error;
mod rpc;
mod snap;

pub use approval::{
    ApprovalDecision, ApprovalHandler, ApprovalKind, ApprovalRequest, AutoApprove, DenyAll,
};
pub use controller::{HOST_ORIGIN, SnapController, SnapControllerBuilder, SnapRequest};
pub use cron::{CronRunner, CronScheduler};
pub use error::{ErrorKind, SnapError, SnapResult};
pub use location::{
    InMemoryLocations, LocalLocation, LocalLocationFactory, LocationFactory, SnapLocation,
};
pub use session::{
    ConflictResolver, FirstRegistered, NamespaceConflict, NamespaceMatch, NamespaceMatcher,
    Session,
};
pub use snap::{Snap, SnapStatus, VersionHistoryEntry};
