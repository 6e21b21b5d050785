//! Events surfaced by the execution service.

use snaps_core::{JsonRpcError, SnapId};

use crate::runtime_id::RuntimeId;

/// Something the host should react to.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    /// Snap code failed outside any request.
    UnhandledError {
        /// The failing snap.
        snap_id: SnapId,
        /// The snap's error.
        error: JsonRpcError,
    },
    /// A runtime went away.
    RuntimeTerminated {
        /// The runtime.
        runtime_id: RuntimeId,
        /// Snaps it hosted.
        snap_ids: Vec<SnapId>,
        /// Why.
        reason: String,
        /// `false` when the host asked for it.
        unexpected: bool,
    },
    /// A snap started network activity.
    OutboundRequest {
        /// The snap.
        snap_id: SnapId,
    },
    /// A snap's network activity finished.
    OutboundResponse {
        /// The snap.
        snap_id: SnapId,
    },
}

impl ExecutionEvent {
    /// Short name for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnhandledError { .. } => "unhandled_error",
            Self::RuntimeTerminated { .. } => "runtime_terminated",
            Self::OutboundRequest { .. } => "outbound_request",
            Self::OutboundResponse { .. } => "outbound_response",
        }
    }
}
