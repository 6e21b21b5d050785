//! Permission and caveat specifications.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snaps_core::{Caveat, SnapId};

use crate::error::CapabilityResult;

/// A granted permission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    /// Name of the specification this grant instantiates.
    pub parent_capability: String,
    /// Caveats narrowing the grant.
    #[serde(default)]
    pub caveats: Vec<Caveat>,
    /// When the grant was made.
    pub date: DateTime<Utc>,
}

impl Permission {
    /// Create a grant dated now.
    #[must_use]
    pub fn new(name: impl Into<String>, caveats: Vec<Caveat>) -> Self {
        Self {
            parent_capability: name.into(),
            caveats,
            date: Utc::now(),
        }
    }

    /// The first caveat of the given type.
    #[must_use]
    pub fn caveat(&self, caveat_type: &str) -> Option<&Caveat> {
        self.caveats.iter().find(|c| c.caveat_type == caveat_type)
    }
}

/// A host-side implementation of a restricted method.
///
/// Decorated implementations wrap an inner one and keep this exact signature.
#[async_trait]
pub trait RestrictedMethod: Send + Sync {
    /// Run the method for `origin` with `params`.
    async fn call(&self, origin: &SnapId, params: Value) -> CapabilityResult<Value>;
}

/// Produces the names of the runtime globals an endowment grants.
///
/// The runtime creates a fresh instance of each named global per snap; only
/// names cross the boundary, never host objects.
pub trait EndowmentGetter: Send + Sync {
    /// Global names to expose, given the grant's caveats.
    fn endowments(&self, snap_id: &SnapId, caveats: &[Caveat]) -> Vec<String>;
}

/// An endowment that only gates a handler and exposes no globals.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoGlobals;

impl EndowmentGetter for NoGlobals {
    fn endowments(&self, _snap_id: &SnapId, _caveats: &[Caveat]) -> Vec<String> {
        Vec::new()
    }
}

/// A fixed list of globals.
#[derive(Debug, Clone, Default)]
pub struct StaticGlobals(pub Vec<String>);

impl EndowmentGetter for StaticGlobals {
    fn endowments(&self, _snap_id: &SnapId, _caveats: &[Caveat]) -> Vec<String> {
        self.0.clone()
    }
}

/// Grant-time structural check over a permission's full caveat list.
pub type PermissionValidator = Arc<dyn Fn(&[Caveat]) -> CapabilityResult<()> + Send + Sync>;

/// What a permission grants.
#[derive(Clone)]
pub enum PermissionKind {
    /// A callable host method.
    RestrictedMethod(Arc<dyn RestrictedMethod>),
    /// Globals injected into the runtime at load time.
    Endowment(Arc<dyn EndowmentGetter>),
}

impl fmt::Debug for PermissionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RestrictedMethod(_) => f.write_str("RestrictedMethod"),
            Self::Endowment(_) => f.write_str("Endowment"),
        }
    }
}

/// Declarative description of one permission.
#[derive(Clone)]
pub struct PermissionSpecification {
    target_name: String,
    kind: PermissionKind,
    allowed_caveats: BTreeSet<String>,
    duplicate_caveats_allowed: bool,
    validator: Option<PermissionValidator>,
}

impl fmt::Debug for PermissionSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionSpecification")
            .field("target_name", &self.target_name)
            .field("kind", &self.kind)
            .field("allowed_caveats", &self.allowed_caveats)
            .field("duplicate_caveats_allowed", &self.duplicate_caveats_allowed)
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

impl PermissionSpecification {
    /// A restricted-method permission.
    #[must_use]
    pub fn restricted_method(
        name: impl Into<String>,
        implementation: Arc<dyn RestrictedMethod>,
    ) -> Self {
        Self::with_kind(name, PermissionKind::RestrictedMethod(implementation))
    }

    /// An endowment permission.
    #[must_use]
    pub fn endowment(name: impl Into<String>, getter: Arc<dyn EndowmentGetter>) -> Self {
        Self::with_kind(name, PermissionKind::Endowment(getter))
    }

    fn with_kind(name: impl Into<String>, kind: PermissionKind) -> Self {
        Self {
            target_name: name.into(),
            kind,
            allowed_caveats: BTreeSet::new(),
            duplicate_caveats_allowed: false,
            validator: None,
        }
    }

    /// Accept these caveat types.
    #[must_use]
    pub fn with_allowed_caveats<I, S>(mut self, caveat_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_caveats
            .extend(caveat_types.into_iter().map(Into::into));
        self
    }

    /// Permit more than one caveat of the same type.
    #[must_use]
    pub fn allow_duplicate_caveats(mut self) -> Self {
        self.duplicate_caveats_allowed = true;
        self
    }

    /// Run `validator` over the caveat list at grant time.
    #[must_use]
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&[Caveat]) -> CapabilityResult<()> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Permission name.
    #[must_use]
    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    /// What the permission grants.
    #[must_use]
    pub fn kind(&self) -> &PermissionKind {
        &self.kind
    }

    /// Accepted caveat types.
    #[must_use]
    pub fn allowed_caveats(&self) -> &BTreeSet<String> {
        &self.allowed_caveats
    }

    /// Whether a caveat type may repeat.
    #[must_use]
    pub fn duplicate_caveats_allowed(&self) -> bool {
        self.duplicate_caveats_allowed
    }

    /// Grant-time validator, if any.
    #[must_use]
    pub fn validator(&self) -> Option<&PermissionValidator> {
        self.validator.as_ref()
    }

    /// Whether this is an endowment.
    #[must_use]
    pub fn is_endowment(&self) -> bool {
        matches!(self.kind, PermissionKind::Endowment(_))
    }
}

/// Behaviour of one caveat type.
pub trait CaveatSpecification: Send + Sync {
    /// The caveat type name, e.g. `"permittedCoinTypes"`.
    fn caveat_type(&self) -> &str;

    /// Check the caveat value at grant time.
    ///
    /// # Errors
    ///
    /// Returns [`CapabilityError::InvalidCaveat`](crate::CapabilityError::InvalidCaveat)
    /// for a malformed value.
    fn validate(&self, permission: &str, caveat: &Caveat) -> CapabilityResult<()>;

    /// Wrap `method` so every call enforces `caveat`.
    ///
    /// Caveats that only inform the host (and do not restrict calls) keep the
    /// default, which returns `method` unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error if the caveat value cannot be interpreted.
    fn decorate(
        &self,
        permission: &str,
        method: Arc<dyn RestrictedMethod>,
        caveat: &Caveat,
    ) -> CapabilityResult<Arc<dyn RestrictedMethod>> {
        let _ = (permission, caveat);
        Ok(method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn permission_caveat_lookup() {
        let permission = Permission::new(
            "endowment:rpc",
            vec![Caveat::new("rpcOrigin", json!({ "dapps": true }))],
        );
        assert!(permission.caveat("rpcOrigin").is_some());
        assert!(permission.caveat("chainNamespaces").is_none());

        let json = serde_json::to_value(&permission).unwrap();
        assert_eq!(json["parentCapability"], "endowment:rpc");
    }

    #[test]
    fn specification_builder() {
        let spec = PermissionSpecification::endowment("endowment:test", Arc::new(NoGlobals))
            .with_allowed_caveats(["a", "b"])
            .allow_duplicate_caveats()
            .with_validator(|_| Ok(()));
        assert!(spec.is_endowment());
        assert_eq!(spec.allowed_caveats().len(), 2);
        assert!(spec.duplicate_caveats_allowed());
        assert!(spec.validator().is_some());
    }
}
