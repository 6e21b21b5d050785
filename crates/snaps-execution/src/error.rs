//! Execution error types.

use snaps_core::{JsonRpcError, SnapId, TimerError};
use thiserror::Error;

use crate::runtime_id::RuntimeId;

/// Errors raised by the execution service and the runtime loop.
#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    /// The isolation primitive could not be created.
    #[error("execution environment unavailable: {0}")]
    EnvironmentUnavailable(String),

    /// A round trip exceeded its budget.
    #[error("request '{method}' to {target} timed out after {timeout_ms}ms")]
    Timeout {
        /// Snap or runtime the request targeted.
        target: String,
        /// Handler or command name.
        method: String,
        /// Budget that elapsed.
        timeout_ms: u64,
    },

    /// The runtime was torn down while the request was pending.
    #[error("runtime {runtime_id} terminated: {reason}")]
    Terminated {
        /// Runtime that went away.
        runtime_id: RuntimeId,
        /// Why it went away.
        reason: String,
    },

    /// Snap code raised an error. The payload is the snap's own.
    #[error("snap error: {0}")]
    Snap(JsonRpcError),

    /// The snap is already loaded into a runtime.
    #[error("snap {0} is already executing")]
    AlreadyExecuting(SnapId),

    /// The snap is not loaded into any runtime.
    #[error("snap {0} is not running")]
    NotRunning(SnapId),

    /// No runtime with this id.
    #[error("unknown runtime: {0}")]
    UnknownRuntime(RuntimeId),

    /// A frame violated the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Channel I/O failed.
    #[error("I/O error: {0}")]
    Io(String),

    /// A timer rejected an operation.
    #[error("timer error: {0}")]
    Timer(#[from] TimerError),
}

impl ExecutionError {
    /// Whether this is [`ExecutionError::Timeout`].
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether this is [`ExecutionError::Terminated`].
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated { .. })
    }

    /// Whether this is [`ExecutionError::Snap`].
    #[must_use]
    pub fn is_snap_error(&self) -> bool {
        matches!(self, Self::Snap(_))
    }
}

impl From<std::io::Error> for ExecutionError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for ExecutionError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}

/// Result type for execution operations.
pub type ExecutionResult<T> = Result<T, ExecutionError>;
