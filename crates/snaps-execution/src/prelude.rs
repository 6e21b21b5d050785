//! Common imports for working with the execution service.
//!
//! ```
//! use snaps_execution::prelude::*;
//! ```

pub use crate::backend::{InProcessBackend, IsolationBackend, ProcessBackend};
pub use crate::runtime::{ExecutorFactory, HostRpc, RuntimeLoop, SnapExecutor};
pub use crate::{
    ExecutionError, ExecutionEvent, ExecutionResult, ExecutionService, RejectAllRpc,
    RequestTimers, RpcHandler, RuntimeId,
};
