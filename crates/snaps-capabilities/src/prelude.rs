//! Common imports for capability consumers.
//!
//! ```rust,ignore
//! use snaps_capabilities::prelude::*;
//! ```

pub use crate::{CapabilityError, CapabilityResult};

pub use crate::{BuiltinHooks, CapabilityRegistry, CapabilityRegistryBuilder};

pub use crate::{
    CaveatSpecification, EndowmentGetter, Permission, PermissionKind, PermissionSpecification,
    RestrictedMethod,
};

pub use crate::{Grants, InMemoryPermissionStore, PermissionStore};
