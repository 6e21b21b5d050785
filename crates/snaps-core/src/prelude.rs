//! Prelude module - commonly used types for convenient import.
//!
//! Use `use snaps_core::prelude::*;` to import all essential types.

// Errors
pub use crate::{CoreError, CoreResult};

// Identity and manifest
pub use crate::{Caveat, PermissionRequest, SnapId, SnapManifest, SnapSource};

// Handlers
pub use crate::{HandlerType, TimeoutClass};

// JSON-RPC
pub use crate::{JsonRpcError, JsonRpcId, JsonRpcRequest};

// Deadlines
pub use crate::{Timer, TimerError, TimerStatus};
