//! Event types for the snap lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snaps_core::SnapId;
use uuid::Uuid;

/// Metadata attached to every event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
    /// Correlation ID for tracing related events.
    pub correlation_id: Option<Uuid>,
    /// Source component that generated the event.
    pub source: String,
}

impl EventMetadata {
    /// Create new event metadata.
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            correlation_id: None,
            source: source.into(),
        }
    }

    /// Set correlation ID.
    #[must_use]
    pub fn with_correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }
}

impl Default for EventMetadata {
    fn default() -> Self {
        Self::new("unknown")
    }
}

/// All lifecycle notifications published by the snap controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SnapEvent {
    // ========== Install / Update ==========
    /// A snap record was created and is installing.
    SnapInstalling {
        /// Event metadata.
        metadata: EventMetadata,
        /// Snap ID.
        snap_id: SnapId,
        /// Origin that requested the install.
        origin: String,
    },

    /// Install finished and the snap is running.
    SnapInstalled {
        /// Event metadata.
        metadata: EventMetadata,
        /// Snap ID.
        snap_id: SnapId,
        /// Installed version.
        version: String,
    },

    /// Install was aborted; no record remains.
    SnapInstallFailed {
        /// Event metadata.
        metadata: EventMetadata,
        /// Snap ID.
        snap_id: SnapId,
        /// Why the install failed.
        error: String,
    },

    /// An installed snap began updating.
    SnapUpdating {
        /// Event metadata.
        metadata: EventMetadata,
        /// Snap ID.
        snap_id: SnapId,
        /// Version being replaced.
        old_version: String,
        /// Target version.
        new_version: String,
    },

    /// Update finished and the snap is running the new version.
    SnapUpdated {
        /// Event metadata.
        metadata: EventMetadata,
        /// Snap ID.
        snap_id: SnapId,
        /// Replaced version.
        old_version: String,
        /// Current version.
        new_version: String,
    },

    // ========== Execution ==========
    /// A runtime was (re)started for the snap.
    SnapStarted {
        /// Event metadata.
        metadata: EventMetadata,
        /// Snap ID.
        snap_id: SnapId,
        /// Runtime hosting the snap.
        runtime_id: String,
    },

    /// The snap's runtime was torn down; the record is retained.
    SnapStopped {
        /// Event metadata.
        metadata: EventMetadata,
        /// Snap ID.
        snap_id: SnapId,
        /// Why it stopped.
        reason: String,
    },

    /// The snap crashed and rejects requests until restarted.
    SnapCrashed {
        /// Event metadata.
        metadata: EventMetadata,
        /// Snap ID.
        snap_id: SnapId,
        /// Crash cause.
        reason: String,
    },

    // ========== Administration ==========
    /// The snap was uninstalled.
    SnapRemoved {
        /// Event metadata.
        metadata: EventMetadata,
        /// Snap ID.
        snap_id: SnapId,
    },

    /// The snap was enabled.
    SnapEnabled {
        /// Event metadata.
        metadata: EventMetadata,
        /// Snap ID.
        snap_id: SnapId,
    },

    /// The snap was disabled.
    SnapDisabled {
        /// Event metadata.
        metadata: EventMetadata,
        /// Snap ID.
        snap_id: SnapId,
    },

    /// The snap was blocked.
    SnapBlocked {
        /// Event metadata.
        metadata: EventMetadata,
        /// Snap ID.
        snap_id: SnapId,
        /// Optional block reason.
        reason: Option<String>,
    },

    /// The snap was unblocked.
    SnapUnblocked {
        /// Event metadata.
        metadata: EventMetadata,
        /// Snap ID.
        snap_id: SnapId,
    },

    /// Persisted state of the snap was cleared.
    SnapStateCleared {
        /// Event metadata.
        metadata: EventMetadata,
        /// Snap ID.
        snap_id: SnapId,
    },

    // ========== Sessions ==========
    /// More than one snap advertised a requested namespace.
    NamespaceConflict {
        /// Event metadata.
        metadata: EventMetadata,
        /// The contested namespace.
        namespace: String,
        /// Snap selected to service it.
        chosen: SnapId,
        /// Candidates that lost.
        rejected: Vec<SnapId>,
    },
}

impl SnapEvent {
    /// Get the event metadata.
    #[must_use]
    pub fn metadata(&self) -> &EventMetadata {
        match self {
            Self::SnapInstalling { metadata, .. }
            | Self::SnapInstalled { metadata, .. }
            | Self::SnapInstallFailed { metadata, .. }
            | Self::SnapUpdating { metadata, .. }
            | Self::SnapUpdated { metadata, .. }
            | Self::SnapStarted { metadata, .. }
            | Self::SnapStopped { metadata, .. }
            | Self::SnapCrashed { metadata, .. }
            | Self::SnapRemoved { metadata, .. }
            | Self::SnapEnabled { metadata, .. }
            | Self::SnapDisabled { metadata, .. }
            | Self::SnapBlocked { metadata, .. }
            | Self::SnapUnblocked { metadata, .. }
            | Self::SnapStateCleared { metadata, .. }
            | Self::NamespaceConflict { metadata, .. } => metadata,
        }
    }

    /// Get the event type as a string.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SnapInstalling { .. } => "snap_installing",
            Self::SnapInstalled { .. } => "snap_installed",
            Self::SnapInstallFailed { .. } => "snap_install_failed",
            Self::SnapUpdating { .. } => "snap_updating",
            Self::SnapUpdated { .. } => "snap_updated",
            Self::SnapStarted { .. } => "snap_started",
            Self::SnapStopped { .. } => "snap_stopped",
            Self::SnapCrashed { .. } => "snap_crashed",
            Self::SnapRemoved { .. } => "snap_removed",
            Self::SnapEnabled { .. } => "snap_enabled",
            Self::SnapDisabled { .. } => "snap_disabled",
            Self::SnapBlocked { .. } => "snap_blocked",
            Self::SnapUnblocked { .. } => "snap_unblocked",
            Self::SnapStateCleared { .. } => "snap_state_cleared",
            Self::NamespaceConflict { .. } => "namespace_conflict",
        }
    }

    /// The snap this event concerns, if it concerns exactly one.
    #[must_use]
    pub fn snap_id(&self) -> Option<&SnapId> {
        match self {
            Self::SnapInstalling { snap_id, .. }
            | Self::SnapInstalled { snap_id, .. }
            | Self::SnapInstallFailed { snap_id, .. }
            | Self::SnapUpdating { snap_id, .. }
            | Self::SnapUpdated { snap_id, .. }
            | Self::SnapStarted { snap_id, .. }
            | Self::SnapStopped { snap_id, .. }
            | Self::SnapCrashed { snap_id, .. }
            | Self::SnapRemoved { snap_id, .. }
            | Self::SnapEnabled { snap_id, .. }
            | Self::SnapDisabled { snap_id, .. }
            | Self::SnapBlocked { snap_id, .. }
            | Self::SnapUnblocked { snap_id, .. }
            | Self::SnapStateCleared { snap_id, .. } => Some(snap_id),
            Self::NamespaceConflict { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_metadata_builder() {
        let correlation = Uuid::new_v4();
        let meta = EventMetadata::new("controller").with_correlation_id(correlation);
        assert_eq!(meta.source, "controller");
        assert_eq!(meta.correlation_id, Some(correlation));
    }

    #[test]
    fn test_event_type_and_snap_id() {
        let id = SnapId::from_static("npm:example");
        let event = SnapEvent::SnapCrashed {
            metadata: EventMetadata::new("controller"),
            snap_id: id.clone(),
            reason: "timeout".into(),
        };
        assert_eq!(event.event_type(), "snap_crashed");
        assert_eq!(event.snap_id(), Some(&id));

        let conflict = SnapEvent::NamespaceConflict {
            metadata: EventMetadata::new("session"),
            namespace: "chain:foo".into(),
            chosen: id,
            rejected: vec![SnapId::from_static("npm:other")],
        };
        assert!(conflict.snap_id().is_none());
    }

    #[test]
    fn test_event_serialization() {
        let event = SnapEvent::SnapBlocked {
            metadata: EventMetadata::new("controller"),
            snap_id: SnapId::from_static("npm:example"),
            reason: Some("malicious".into()),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"snap_blocked\""));
        assert!(json.contains("malicious"));
    }
}
