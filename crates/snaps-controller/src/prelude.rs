//! Common imports for hosts embedding the controller.
//!
//! ```rust
//! use snaps_controller::prelude::*;
//! ```

pub use crate::{
    ApprovalDecision, ApprovalHandler, ApprovalRequest, AutoApprove, DenyAll, ErrorKind,
    InMemoryLocations, LocalLocationFactory, NamespaceMatcher, Session, Snap, SnapController,
    SnapError, SnapRequest, SnapResult, SnapStatus,
};
