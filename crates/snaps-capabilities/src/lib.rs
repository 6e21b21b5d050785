//! Snaps Capabilities - permission and caveat registry.
//!
//! Holds the set of permission specifications a host supports and enforces
//! them:
//!
//! - Endowments gate handlers and name the runtime globals a snap receives.
//! - Restricted methods are host functions a snap calls through
//!   [`CapabilityRegistry::execute_restricted_method`], wrapped in the
//!   decorators of every caveat on the caller's grant.
//!
//! # Example
//!
//! ```rust,ignore
//! use snaps_capabilities::prelude::*;
//!
//! let registry = CapabilityRegistry::builder().with_builtins(&hooks).build()?;
//! let result = registry
//!     .execute_restricted_method(&store, &snap_id, "snap_dialog", params)
//!     .await?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod builtin;
pub mod prelude;

mod error;
mod registry;
mod spec;
mod store;

pub use builtin::BuiltinHooks;
pub use error::{CapabilityError, CapabilityResult};
pub use registry::{CapabilityRegistry, CapabilityRegistryBuilder};
pub use spec::{
    CaveatSpecification, EndowmentGetter, NoGlobals, Permission, PermissionKind,
    PermissionSpecification, PermissionValidator, RestrictedMethod, StaticGlobals,
};
pub use store::{Grants, InMemoryPermissionStore, PermissionStore};
