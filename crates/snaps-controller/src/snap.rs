//! The snap record and its lifecycle status.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snaps_core::{SnapId, SnapManifest};
use snaps_execution::RuntimeId;

/// Lifecycle status. Only `Running` carries a runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum SnapStatus {
    /// First install in progress.
    Installing,
    /// Update in progress.
    Updating,
    /// Loaded into a live runtime.
    Running {
        /// Runtime hosting the snap.
        runtime_id: RuntimeId,
        /// When the runtime was started.
        started_at: DateTime<Utc>,
    },
    /// Installed, no runtime.
    Stopped,
    /// Failed; rejects requests until restarted.
    Crashed {
        /// Crash cause.
        reason: String,
    },
}

impl SnapStatus {
    /// Status name for logs and errors.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Installing => "installing",
            Self::Updating => "updating",
            Self::Running { .. } => "running",
            Self::Stopped => "stopped",
            Self::Crashed { .. } => "crashed",
        }
    }

    /// The runtime, when running.
    #[must_use]
    pub fn runtime_id(&self) -> Option<RuntimeId> {
        match self {
            Self::Running { runtime_id, .. } => Some(*runtime_id),
            _ => None,
        }
    }

    /// Whether `next` is reachable from here in one step.
    #[must_use]
    pub fn can_transition_to(&self, next: &Self) -> bool {
        use SnapStatus::{Crashed, Installing, Running, Stopped, Updating};
        matches!(
            (self, next),
            (Installing, Running { .. } | Crashed { .. })
                | (Updating, Running { .. } | Stopped | Crashed { .. })
                | (Running { .. }, Stopped | Crashed { .. } | Updating)
                | (Stopped, Running { .. } | Updating | Crashed { .. })
                | (Crashed { .. }, Stopped)
        )
    }
}

impl fmt::Display for SnapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One entry of a snap's install/update log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionHistoryEntry {
    /// Who asked for it.
    pub origin: String,
    /// Version installed.
    pub version: semver::Version,
    /// When.
    pub date: DateTime<Utc>,
}

/// An installed snap. Mutated only by the controller; callers get copies.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snap {
    pub(crate) id: SnapId,
    pub(crate) status: SnapStatus,
    pub(crate) manifest: SnapManifest,
    pub(crate) enabled: bool,
    pub(crate) blocked: bool,
    pub(crate) blocked_reason: Option<String>,
    pub(crate) version_history: Vec<VersionHistoryEntry>,
    pub(crate) active_references: u64,
    pub(crate) sequence: u64,
    #[serde(skip)]
    pub(crate) source: Arc<Vec<u8>>,
    #[serde(skip)]
    pub(crate) removing: bool,
}

impl fmt::Debug for Snap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snap")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("version", &self.manifest.version)
            .field("enabled", &self.enabled)
            .field("blocked", &self.blocked)
            .field("active_references", &self.active_references)
            .finish_non_exhaustive()
    }
}

impl Snap {
    pub(crate) fn new(
        id: SnapId,
        manifest: SnapManifest,
        source: Vec<u8>,
        sequence: u64,
    ) -> Self {
        Self {
            id,
            status: SnapStatus::Installing,
            manifest,
            enabled: true,
            blocked: false,
            blocked_reason: None,
            version_history: Vec::new(),
            active_references: 0,
            sequence,
            source: Arc::new(source),
            removing: false,
        }
    }

    /// Identity.
    #[must_use]
    pub fn id(&self) -> &SnapId {
        &self.id
    }

    /// Lifecycle status.
    #[must_use]
    pub fn status(&self) -> &SnapStatus {
        &self.status
    }

    /// Current manifest.
    #[must_use]
    pub fn manifest(&self) -> &SnapManifest {
        &self.manifest
    }

    /// Installed version.
    #[must_use]
    pub fn version(&self) -> &semver::Version {
        &self.manifest.version
    }

    /// Whether requests are accepted.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Whether the snap is blocked.
    #[must_use]
    pub fn blocked(&self) -> bool {
        self.blocked
    }

    /// Why the snap was blocked.
    #[must_use]
    pub fn blocked_reason(&self) -> Option<&str> {
        self.blocked_reason.as_deref()
    }

    /// Install and update log, oldest first.
    #[must_use]
    pub fn version_history(&self) -> &[VersionHistoryEntry] {
        &self.version_history
    }

    /// Holders keeping the snap alive.
    #[must_use]
    pub fn active_references(&self) -> u64 {
        self.active_references
    }

    /// Install order; lower installed earlier.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// The verified bundle.
    #[must_use]
    pub fn source(&self) -> &[u8] {
        &self.source
    }

    /// Whether the snap could serve a request right now, starting if needed.
    #[must_use]
    pub fn is_runnable(&self) -> bool {
        self.enabled
            && !self.blocked
            && !self.removing
            && matches!(self.status, SnapStatus::Running { .. } | SnapStatus::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running() -> SnapStatus {
        SnapStatus::Running {
            runtime_id: RuntimeId::new(),
            started_at: Utc::now(),
        }
    }

    #[test]
    fn lifecycle_transitions() {
        let crashed = SnapStatus::Crashed {
            reason: "boom".into(),
        };
        assert!(SnapStatus::Installing.can_transition_to(&running()));
        assert!(running().can_transition_to(&SnapStatus::Stopped));
        assert!(SnapStatus::Stopped.can_transition_to(&running()));
        assert!(running().can_transition_to(&crashed));
        assert!(crashed.can_transition_to(&SnapStatus::Stopped));
        assert!(SnapStatus::Stopped.can_transition_to(&SnapStatus::Updating));
        assert!(SnapStatus::Updating.can_transition_to(&running()));

        // Crashed snaps are never restarted implicitly.
        assert!(!crashed.can_transition_to(&running()));
        assert!(!SnapStatus::Installing.can_transition_to(&SnapStatus::Updating));
        assert!(!SnapStatus::Stopped.can_transition_to(&SnapStatus::Stopped));
    }

    #[test]
    fn status_serializes_with_payload_only_when_running() {
        let json = serde_json::to_value(SnapStatus::Stopped).unwrap();
        assert_eq!(json, serde_json::json!({ "status": "stopped" }));
        let json = serde_json::to_value(running()).unwrap();
        assert!(json.get("runtimeId").is_none());
        assert!(json.get("runtime_id").is_some());
    }
}
