//! Errors surfaced to callers of the snap controller.

use snaps_capabilities::CapabilityError;
use snaps_core::{CoreError, JsonRpcError, SnapId};
use snaps_execution::ExecutionError;
use thiserror::Error;

/// Errors returned by [`SnapController`](crate::SnapController) operations.
#[derive(Debug, Clone, Error)]
pub enum SnapError {
    /// Bad manifest, caveat, version or parameters.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The capability is not granted or a caveat rejected the call.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The request outlived its budget. The snap is now crashed.
    #[error("request '{method}' to {target} timed out after {timeout_ms}ms")]
    Timeout {
        /// Snap or runtime targeted.
        target: String,
        /// Handler or command name.
        method: String,
        /// Budget that elapsed.
        timeout_ms: u64,
    },

    /// The runtime was torn down mid-request.
    #[error("runtime terminated: {0}")]
    Terminated(String),

    /// No isolated runtime could be created.
    #[error("runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// The snap's own error, passed through unchanged.
    #[error("snap error: {0}")]
    Plugin(JsonRpcError),

    /// No such snap is installed.
    #[error("snap not found: {0}")]
    NotFound(SnapId),

    /// The snap crashed and awaits an operator restart.
    #[error("snap {snap_id} crashed: {reason}")]
    Crashed {
        /// The snap.
        snap_id: SnapId,
        /// Crash cause.
        reason: String,
    },

    /// The snap is blocked.
    #[error("snap {0} is blocked")]
    Blocked(SnapId),

    /// The snap is disabled.
    #[error("snap {0} is disabled")]
    Disabled(SnapId),

    /// The snap is mid-install or mid-update.
    #[error("snap {snap_id} is {status}")]
    NotReady {
        /// The snap.
        snap_id: SnapId,
        /// Its current status name.
        status: &'static str,
    },

    /// The snap is already installed.
    #[error("snap {0} is already installed")]
    AlreadyInstalled(SnapId),

    /// The snap is being uninstalled.
    #[error("snap {0} is being uninstalled")]
    Uninstalling(SnapId),

    /// The bundle does not match the manifest shasum.
    #[error("source hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        /// Shasum from the manifest.
        expected: String,
        /// Shasum of the fetched bundle.
        actual: String,
    },

    /// The approval flow declined.
    #[error("approval denied for {snap_id}: {reason}")]
    ApprovalDenied {
        /// The snap.
        snap_id: SnapId,
        /// Reason given by the approver.
        reason: String,
    },

    /// The status change is not allowed from the current status.
    #[error("snap {snap_id} cannot go from {from} to {to}")]
    InvalidTransition {
        /// The snap.
        snap_id: SnapId,
        /// Current status name.
        from: &'static str,
        /// Requested status name.
        to: &'static str,
    },

    /// Manifest or bundle could not be fetched.
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// Host infrastructure failed in a way no other variant covers.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Flat discriminant of [`SnapError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ErrorKind {
    Validation,
    PermissionDenied,
    Timeout,
    Terminated,
    RuntimeUnavailable,
    Plugin,
    NotFound,
    Crashed,
    Blocked,
    Disabled,
    NotReady,
    AlreadyInstalled,
    Uninstalling,
    HashMismatch,
    ApprovalDenied,
    InvalidTransition,
    Fetch,
    Internal,
}

impl SnapError {
    /// The flat kind, for branching without matching payloads.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Terminated(_) => ErrorKind::Terminated,
            Self::RuntimeUnavailable(_) => ErrorKind::RuntimeUnavailable,
            Self::Plugin(_) => ErrorKind::Plugin,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Crashed { .. } => ErrorKind::Crashed,
            Self::Blocked(_) => ErrorKind::Blocked,
            Self::Disabled(_) => ErrorKind::Disabled,
            Self::NotReady { .. } => ErrorKind::NotReady,
            Self::AlreadyInstalled(_) => ErrorKind::AlreadyInstalled,
            Self::Uninstalling(_) => ErrorKind::Uninstalling,
            Self::HashMismatch { .. } => ErrorKind::HashMismatch,
            Self::ApprovalDenied { .. } => ErrorKind::ApprovalDenied,
            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Self::Fetch(_) => ErrorKind::Fetch,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Serialize for a JSON-RPC caller. Plugin errors come back verbatim.
    #[must_use]
    pub fn to_json_rpc(&self) -> JsonRpcError {
        match self {
            Self::Plugin(error) => error.clone(),
            Self::PermissionDenied(_) => {
                JsonRpcError::new(self.to_string()).with_code(JsonRpcError::UNAUTHORIZED)
            },
            Self::ApprovalDenied { .. } => {
                JsonRpcError::new(self.to_string()).with_code(JsonRpcError::USER_REJECTED)
            },
            Self::Validation(_) => {
                JsonRpcError::new(self.to_string()).with_code(JsonRpcError::INVALID_PARAMS)
            },
            _ => JsonRpcError::new(self.to_string()).with_code(JsonRpcError::INTERNAL),
        }
    }
}

impl From<ExecutionError> for SnapError {
    fn from(e: ExecutionError) -> Self {
        match e {
            ExecutionError::EnvironmentUnavailable(reason) => Self::RuntimeUnavailable(reason),
            ExecutionError::Timeout {
                target,
                method,
                timeout_ms,
            } => Self::Timeout {
                target,
                method,
                timeout_ms,
            },
            ExecutionError::Terminated { reason, .. } => Self::Terminated(reason),
            ExecutionError::Snap(error) => Self::Plugin(error),
            ExecutionError::NotRunning(snap_id) => {
                Self::Terminated(format!("snap {snap_id} has no runtime"))
            },
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<CapabilityError> for SnapError {
    fn from(e: CapabilityError) -> Self {
        match e {
            CapabilityError::Unauthorized { .. } => Self::PermissionDenied(e.to_string()),
            CapabilityError::Hook(reason) => Self::Internal(reason),
            other => Self::Validation(other.to_string()),
        }
    }
}

impl From<CoreError> for SnapError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::HashMismatch { expected, actual } => Self::HashMismatch { expected, actual },
            other => Self::Validation(other.to_string()),
        }
    }
}

/// Result type for controller operations.
pub type SnapResult<T> = Result<T, SnapError>;
