//! The capability registry.
//!
//! Built once at process start and shared behind an `Arc`. Specifications
//! cannot be added or removed afterwards.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::Value;
use snaps_core::{Caveat, PermissionRequest, SnapId};
use tracing::{debug, warn};

use crate::error::{CapabilityError, CapabilityResult};
use crate::spec::{
    CaveatSpecification, Permission, PermissionKind, PermissionSpecification, RestrictedMethod,
};
use crate::store::{Grants, PermissionStore};

/// Builder for [`CapabilityRegistry`].
#[derive(Default)]
pub struct CapabilityRegistryBuilder {
    permissions: HashMap<String, PermissionSpecification>,
    caveats: HashMap<String, Arc<dyn CaveatSpecification>>,
}

impl CapabilityRegistryBuilder {
    /// Register a permission. A later registration with the same name replaces
    /// the earlier one.
    #[must_use]
    pub fn permission(mut self, spec: PermissionSpecification) -> Self {
        let name = spec.target_name().to_string();
        if self.permissions.insert(name.clone(), spec).is_some() {
            warn!(permission = %name, "Permission specification replaced");
        }
        self
    }

    /// Register a caveat type.
    #[must_use]
    pub fn caveat(mut self, spec: Arc<dyn CaveatSpecification>) -> Self {
        self.caveats.insert(spec.caveat_type().to_string(), spec);
        self
    }

    /// Freeze the registry.
    ///
    /// # Errors
    ///
    /// Returns [`CapabilityError::InvalidCaveat`] if a permission allows a
    /// caveat type that has no registered specification.
    pub fn build(self) -> CapabilityResult<CapabilityRegistry> {
        for spec in self.permissions.values() {
            if let Some(missing) = spec
                .allowed_caveats()
                .iter()
                .find(|t| !self.caveats.contains_key(t.as_str()))
            {
                return Err(CapabilityError::InvalidCaveat {
                    permission: spec.target_name().to_string(),
                    reason: format!("caveat type '{missing}' has no specification"),
                });
            }
        }
        debug!(
            permissions = self.permissions.len(),
            caveats = self.caveats.len(),
            "Capability registry built"
        );
        Ok(CapabilityRegistry {
            permissions: self.permissions,
            caveats: self.caveats,
        })
    }
}

/// Immutable set of permission and caveat specifications.
pub struct CapabilityRegistry {
    permissions: HashMap<String, PermissionSpecification>,
    caveats: HashMap<String, Arc<dyn CaveatSpecification>>,
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.permissions.keys().collect();
        names.sort();
        f.debug_struct("CapabilityRegistry")
            .field("permissions", &names)
            .finish_non_exhaustive()
    }
}

impl CapabilityRegistry {
    /// Start building a registry.
    #[must_use]
    pub fn builder() -> CapabilityRegistryBuilder {
        CapabilityRegistryBuilder::default()
    }

    /// Look up a permission specification.
    #[must_use]
    pub fn specification(&self, name: &str) -> Option<&PermissionSpecification> {
        self.permissions.get(name)
    }

    /// Whether `name` is a registered endowment.
    #[must_use]
    pub fn is_endowment(&self, name: &str) -> bool {
        self.permissions
            .get(name)
            .is_some_and(PermissionSpecification::is_endowment)
    }

    /// Whether `name` is a registered restricted method.
    #[must_use]
    pub fn is_restricted_method(&self, name: &str) -> bool {
        self.permissions.get(name).is_some_and(|s| !s.is_endowment())
    }

    /// Validate a manifest's requested permissions without granting them.
    ///
    /// # Errors
    ///
    /// Returns the first unknown permission or caveat violation.
    pub fn validate_requested(
        &self,
        requested: &BTreeMap<String, PermissionRequest>,
    ) -> CapabilityResult<()> {
        for (name, request) in requested {
            self.validate_caveats(name, request.caveats())?;
        }
        Ok(())
    }

    /// Validate an existing grant.
    ///
    /// # Errors
    ///
    /// Returns the first caveat violation.
    pub fn validate_grant(&self, permission: &Permission) -> CapabilityResult<()> {
        self.validate_caveats(&permission.parent_capability, &permission.caveats)
    }

    /// Validate `requested` and turn it into grants ready for the store.
    ///
    /// # Errors
    ///
    /// Returns the first validation failure; nothing is granted in that case.
    pub fn build_grants(
        &self,
        requested: &BTreeMap<String, PermissionRequest>,
    ) -> CapabilityResult<Grants> {
        self.validate_requested(requested)?;
        Ok(requested
            .iter()
            .map(|(name, request)| {
                (
                    name.clone(),
                    Permission::new(name.clone(), request.caveats().to_vec()),
                )
            })
            .collect())
    }

    fn validate_caveats(&self, name: &str, caveats: &[Caveat]) -> CapabilityResult<()> {
        let spec = self
            .permissions
            .get(name)
            .ok_or_else(|| CapabilityError::UnknownPermission(name.to_string()))?;

        let mut seen = BTreeSet::new();
        for caveat in caveats {
            let caveat_type = caveat.caveat_type.as_str();
            if !spec.allowed_caveats().contains(caveat_type) {
                return Err(CapabilityError::DisallowedCaveat {
                    permission: name.to_string(),
                    caveat_type: caveat_type.to_string(),
                });
            }
            if !seen.insert(caveat_type) && !spec.duplicate_caveats_allowed() {
                return Err(CapabilityError::DuplicateCaveat {
                    permission: name.to_string(),
                    caveat_type: caveat_type.to_string(),
                });
            }
            // Presence is guaranteed by `build`.
            if let Some(caveat_spec) = self.caveats.get(caveat_type) {
                caveat_spec.validate(name, caveat)?;
            }
        }

        if let Some(validator) = spec.validator() {
            validator(caveats)?;
        }
        Ok(())
    }

    /// Execute a restricted method on behalf of `origin`.
    ///
    /// The grant's caveats decorate the implementation in order before the
    /// call. A missing grant and a caveat rejection produce the same
    /// [`CapabilityError::Unauthorized`].
    ///
    /// # Errors
    ///
    /// Returns [`CapabilityError::MethodNotFound`] for names that are not
    /// restricted methods, `Unauthorized` when not permitted, or whatever the
    /// implementation returns.
    pub async fn execute_restricted_method(
        &self,
        store: &dyn PermissionStore,
        origin: &SnapId,
        method: &str,
        params: Value,
    ) -> CapabilityResult<Value> {
        let Some(spec) = self.permissions.get(method) else {
            return Err(CapabilityError::MethodNotFound(method.to_string()));
        };
        let PermissionKind::RestrictedMethod(implementation) = spec.kind() else {
            return Err(CapabilityError::MethodNotFound(method.to_string()));
        };

        let Some(permission) = store.get_permission(origin, method).await else {
            debug!(snap_id = %origin, method, "Restricted method call without grant");
            return Err(CapabilityError::unauthorized(method, origin));
        };

        let decorated = self.decorate(method, Arc::clone(implementation), &permission)?;
        decorated.call(origin, params).await
    }

    fn decorate(
        &self,
        method: &str,
        mut implementation: Arc<dyn RestrictedMethod>,
        permission: &Permission,
    ) -> CapabilityResult<Arc<dyn RestrictedMethod>> {
        for caveat in &permission.caveats {
            let caveat_spec = self.caveats.get(&caveat.caveat_type).ok_or_else(|| {
                CapabilityError::InvalidCaveat {
                    permission: method.to_string(),
                    reason: format!("unregistered caveat type '{}'", caveat.caveat_type),
                }
            })?;
            implementation = caveat_spec.decorate(method, implementation, caveat)?;
        }
        Ok(implementation)
    }

    /// Global names to inject into `snap_id`'s runtime, derived from its
    /// endowment grants. Sorted and deduplicated.
    pub async fn endowments_for(
        &self,
        store: &dyn PermissionStore,
        snap_id: &SnapId,
    ) -> Vec<String> {
        let grants = store.get_permissions(snap_id).await;
        let mut globals = BTreeSet::new();
        for (name, permission) in &grants {
            let kind = self
                .permissions
                .get(name)
                .map(PermissionSpecification::kind);
            if let Some(PermissionKind::Endowment(getter)) = kind {
                globals.extend(getter.endowments(snap_id, &permission.caveats));
            }
        }
        globals.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{NoGlobals, StaticGlobals};
    use crate::store::InMemoryPermissionStore;
    use async_trait::async_trait;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl RestrictedMethod for Echo {
        async fn call(&self, _origin: &SnapId, params: Value) -> CapabilityResult<Value> {
            Ok(params)
        }
    }

    /// Rejects calls whose `n` exceeds the caveat's `max`.
    struct MaxCaveat;

    struct MaxDecorated {
        permission: String,
        max: u64,
        inner: Arc<dyn RestrictedMethod>,
    }

    #[async_trait]
    impl RestrictedMethod for MaxDecorated {
        async fn call(&self, origin: &SnapId, params: Value) -> CapabilityResult<Value> {
            if params["n"].as_u64().is_none_or(|n| n > self.max) {
                return Err(CapabilityError::unauthorized(&self.permission, origin));
            }
            self.inner.call(origin, params).await
        }
    }

    impl CaveatSpecification for MaxCaveat {
        fn caveat_type(&self) -> &str {
            "max"
        }

        fn validate(&self, permission: &str, caveat: &Caveat) -> CapabilityResult<()> {
            if caveat.value.as_u64().is_none() {
                return Err(CapabilityError::InvalidCaveat {
                    permission: permission.to_string(),
                    reason: "max must be an integer".into(),
                });
            }
            Ok(())
        }

        fn decorate(
            &self,
            permission: &str,
            method: Arc<dyn RestrictedMethod>,
            caveat: &Caveat,
        ) -> CapabilityResult<Arc<dyn RestrictedMethod>> {
            Ok(Arc::new(MaxDecorated {
                permission: permission.to_string(),
                max: caveat.value.as_u64().unwrap_or(0),
                inner: method,
            }))
        }
    }

    fn registry() -> CapabilityRegistry {
        CapabilityRegistry::builder()
            .caveat(Arc::new(MaxCaveat))
            .permission(
                PermissionSpecification::restricted_method("test_echo", Arc::new(Echo))
                    .with_allowed_caveats(["max"]),
            )
            .permission(PermissionSpecification::endowment(
                "endowment:gate",
                Arc::new(NoGlobals),
            ))
            .permission(PermissionSpecification::endowment(
                "endowment:net",
                Arc::new(StaticGlobals(vec!["fetch".into()])),
            ))
            .build()
            .unwrap()
    }

    fn requests(pairs: &[(&str, PermissionRequest)]) -> BTreeMap<String, PermissionRequest> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn build_rejects_unregistered_caveat_types() {
        let result = CapabilityRegistry::builder()
            .permission(
                PermissionSpecification::restricted_method("x", Arc::new(Echo))
                    .with_allowed_caveats(["nope"]),
            )
            .build();
        assert!(matches!(result, Err(CapabilityError::InvalidCaveat { .. })));
    }

    #[test]
    fn validates_requested_permissions() {
        let registry = registry();
        assert!(registry.is_endowment("endowment:gate"));
        assert!(registry.is_restricted_method("test_echo"));

        let ok = requests(&[(
            "test_echo",
            PermissionRequest::with_caveats(vec![Caveat::new("max", json!(5))]),
        )]);
        assert!(registry.validate_requested(&ok).is_ok());

        let unknown = requests(&[("snap_unknown", PermissionRequest::bare())]);
        assert!(matches!(
            registry.validate_requested(&unknown),
            Err(CapabilityError::UnknownPermission(_))
        ));

        let disallowed = requests(&[(
            "endowment:gate",
            PermissionRequest::with_caveats(vec![Caveat::new("max", json!(1))]),
        )]);
        assert!(matches!(
            registry.validate_requested(&disallowed),
            Err(CapabilityError::DisallowedCaveat { .. })
        ));

        let duplicate = requests(&[(
            "test_echo",
            PermissionRequest::with_caveats(vec![
                Caveat::new("max", json!(1)),
                Caveat::new("max", json!(2)),
            ]),
        )]);
        assert!(matches!(
            registry.validate_requested(&duplicate),
            Err(CapabilityError::DuplicateCaveat { .. })
        ));

        let malformed = requests(&[(
            "test_echo",
            PermissionRequest::with_caveats(vec![Caveat::new("max", json!("five"))]),
        )]);
        assert!(matches!(
            registry.validate_requested(&malformed),
            Err(CapabilityError::InvalidCaveat { .. })
        ));
    }

    #[tokio::test]
    async fn ungranted_method_is_unauthorized_regardless_of_params() {
        let registry = registry();
        let store = InMemoryPermissionStore::new();
        let id = SnapId::from_static("npm:example");

        for params in [json!({ "n": 1 }), json!({ "n": 1000 }), Value::Null] {
            let err = registry
                .execute_restricted_method(&store, &id, "test_echo", params)
                .await
                .unwrap_err();
            assert!(err.is_unauthorized());
        }
    }

    #[tokio::test]
    async fn caveat_decoration_is_transparent() {
        let registry = registry();
        let store = InMemoryPermissionStore::new();
        let id = SnapId::from_static("npm:example");
        let grants = registry
            .build_grants(&requests(&[(
                "test_echo",
                PermissionRequest::with_caveats(vec![Caveat::new("max", json!(10))]),
            )]))
            .unwrap();
        store.grant_permissions(&id, grants).await.unwrap();

        let in_range = registry
            .execute_restricted_method(&store, &id, "test_echo", json!({ "n": 3 }))
            .await
            .unwrap();
        assert_eq!(in_range, json!({ "n": 3 }));

        let out_of_range = registry
            .execute_restricted_method(&store, &id, "test_echo", json!({ "n": 11 }))
            .await
            .unwrap_err();
        assert_eq!(
            out_of_range,
            CapabilityError::unauthorized("test_echo", &id)
        );
    }

    #[tokio::test]
    async fn endowments_are_calls_not_methods() {
        let registry = registry();
        let store = InMemoryPermissionStore::new();
        let id = SnapId::from_static("npm:example");
        let grants = registry
            .build_grants(&requests(&[
                ("endowment:gate", PermissionRequest::bare()),
                ("endowment:net", PermissionRequest::bare()),
            ]))
            .unwrap();
        store.grant_permissions(&id, grants).await.unwrap();

        assert_eq!(registry.endowments_for(&store, &id).await, vec!["fetch"]);
        assert!(matches!(
            registry
                .execute_restricted_method(&store, &id, "endowment:net", Value::Null)
                .await,
            Err(CapabilityError::MethodNotFound(_))
        ));
    }
}
