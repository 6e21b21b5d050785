//! The install/update approval flow.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snaps_core::{PermissionRequest, SnapId};

/// Why approval is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ApprovalKind {
    /// First install.
    Install,
    /// Update requesting permissions the snap does not hold yet.
    Update,
}

/// What the user is asked to approve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    /// Install or update.
    pub kind: ApprovalKind,
    /// The snap.
    pub snap_id: SnapId,
    /// Who initiated it.
    pub origin: String,
    /// Version being installed.
    pub version: semver::Version,
    /// Permissions to grant.
    pub permissions: BTreeMap<String, PermissionRequest>,
}

/// The user's answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "camelCase")]
pub enum ApprovalDecision {
    /// Grant these permissions. Names that were not requested are ignored.
    Approved {
        /// Approved subset of the request.
        permissions: BTreeMap<String, PermissionRequest>,
    },
    /// Abort.
    Denied {
        /// Reason shown to the caller.
        reason: String,
    },
}

impl ApprovalDecision {
    /// Approve exactly what was asked.
    #[must_use]
    pub fn approve_all(request: &ApprovalRequest) -> Self {
        Self::Approved {
            permissions: request.permissions.clone(),
        }
    }

    /// Deny with `reason`.
    #[must_use]
    pub fn deny(reason: impl Into<String>) -> Self {
        Self::Denied {
            reason: reason.into(),
        }
    }
}

/// Asks a person. May suspend for as long as the person takes.
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    /// Present `request` and wait for a decision.
    async fn request_approval(&self, request: ApprovalRequest) -> ApprovalDecision;
}

/// Approves everything. For hosts that vet snaps out of band.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

#[async_trait]
impl ApprovalHandler for AutoApprove {
    async fn request_approval(&self, request: ApprovalRequest) -> ApprovalDecision {
        ApprovalDecision::approve_all(&request)
    }
}

/// Denies everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

#[async_trait]
impl ApprovalHandler for DenyAll {
    async fn request_approval(&self, _request: ApprovalRequest) -> ApprovalDecision {
        ApprovalDecision::deny("no approval handler configured")
    }
}
