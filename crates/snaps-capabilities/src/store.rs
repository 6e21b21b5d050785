//! Granted-permission storage.
//!
//! The registry only reads grants and asks for new ones to be recorded; where
//! and how they persist belongs to the embedding host.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use snaps_core::SnapId;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::CapabilityResult;
use crate::spec::Permission;

/// Grants held by one snap, keyed by permission name.
pub type Grants = BTreeMap<String, Permission>;

/// Storage of granted permissions.
#[async_trait]
pub trait PermissionStore: Send + Sync {
    /// Whether `snap_id` holds `name`.
    async fn has_permission(&self, snap_id: &SnapId, name: &str) -> bool {
        self.get_permission(snap_id, name).await.is_some()
    }

    /// The grant for `name`, if any.
    async fn get_permission(&self, snap_id: &SnapId, name: &str) -> Option<Permission>;

    /// All grants held by `snap_id`.
    async fn get_permissions(&self, snap_id: &SnapId) -> Grants;

    /// Record `grants` for `snap_id`, replacing same-named grants. Returns the
    /// resulting full set.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store rejects the write.
    async fn grant_permissions(&self, snap_id: &SnapId, grants: Grants)
    -> CapabilityResult<Grants>;

    /// Drop every grant held by `snap_id`.
    async fn revoke_all(&self, snap_id: &SnapId);
}

/// Process-local permission store.
#[derive(Debug, Default)]
pub struct InMemoryPermissionStore {
    grants: RwLock<HashMap<SnapId, Grants>>,
}

impl InMemoryPermissionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PermissionStore for InMemoryPermissionStore {
    async fn get_permission(&self, snap_id: &SnapId, name: &str) -> Option<Permission> {
        self.grants
            .read()
            .await
            .get(snap_id)
            .and_then(|g| g.get(name))
            .cloned()
    }

    async fn get_permissions(&self, snap_id: &SnapId) -> Grants {
        self.grants
            .read()
            .await
            .get(snap_id)
            .cloned()
            .unwrap_or_default()
    }

    async fn grant_permissions(
        &self,
        snap_id: &SnapId,
        grants: Grants,
    ) -> CapabilityResult<Grants> {
        let mut all = self.grants.write().await;
        let entry = all.entry(snap_id.clone()).or_default();
        debug!(snap_id = %snap_id, count = grants.len(), "Granting permissions");
        entry.extend(grants);
        Ok(entry.clone())
    }

    async fn revoke_all(&self, snap_id: &SnapId) {
        if self.grants.write().await.remove(snap_id).is_some() {
            debug!(snap_id = %snap_id, "Revoked all permissions");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn grant_query_revoke() {
        let store = InMemoryPermissionStore::new();
        let id = SnapId::from_static("npm:example");
        assert!(!store.has_permission(&id, "snap_dialog").await);

        let grants = Grants::from([(
            "snap_dialog".to_string(),
            Permission::new("snap_dialog", Vec::new()),
        )]);
        let all = store.grant_permissions(&id, grants).await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(store.has_permission(&id, "snap_dialog").await);
        assert!(!store.has_permission(&SnapId::from_static("npm:other"), "snap_dialog").await);

        store.revoke_all(&id).await;
        assert!(store.get_permissions(&id).await.is_empty());
    }
}
